//! Owned backing memory for the fixed-size pools.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use snafu::OptionExt as _;

use crate::error::{InvalidGeometrySnafu, PoolError, ReserveSnafu};

/// Alignment of every pool region.
pub const REGION_ALIGN: usize = 16;

/// A contiguous, exclusively owned block of `blocks * block_size` bytes.
///
/// The memory is uninitialized on reservation and returned to the global
/// allocator when the region is dropped.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Region {}

impl Region {
    pub(crate) fn reserve(blocks: usize, block_size: usize) -> Result<Self, PoolError> {
        let layout = blocks
            .checked_mul(block_size)
            .filter(|&size| size > 0)
            .and_then(|size| Layout::from_size_align(size, REGION_ALIGN).ok())
            .context(InvalidGeometrySnafu { blocks, block_size })?;

        let base = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(base).context(ReserveSnafu {
            size: layout.size(),
        })?;

        Ok(Self { base, layout })
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Returns the byte offset of `ptr` from the region base, if it lies inside.
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = ptr.addr().checked_sub(self.base.addr().get())?;
        (offset < self.len()).then_some(offset)
    }

    /// Returns a pointer `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not inside the region.
    pub(crate) fn at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len(), "offset {offset} outside region");
        unsafe { self.base.add(offset) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_aligned() {
        let region = Region::reserve(4, 64).unwrap();
        assert_eq!(region.len(), 256);
        assert_eq!(region.base().addr().get() % REGION_ALIGN, 0);
    }

    #[test]
    fn test_reserve_rejects_empty_and_overflowing_geometry() {
        assert!(matches!(
            Region::reserve(0, 64),
            Err(PoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            Region::reserve(4, 0),
            Err(PoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            Region::reserve(usize::MAX, 2),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_offset_of() {
        let region = Region::reserve(2, 32).unwrap();
        let base = region.base().as_ptr();
        assert_eq!(region.offset_of(base), Some(0));
        assert_eq!(region.offset_of(base.wrapping_add(63)), Some(63));
        assert_eq!(region.offset_of(base.wrapping_add(64)), None);
        assert_eq!(region.offset_of(base.wrapping_sub(1)), None);
    }
}
