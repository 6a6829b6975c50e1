//! Fixed-size block pool with an intrusive free list.
//!
//! The pool keeps no bookkeeping memory besides a list head and a counter.
//! Every free block stores, in its first word, the offset of the next free
//! block (or [`END_OF_LIST`]). Allocation pops the head; deallocation pushes
//! the released block in front of it.
//!
//! # Memory Layout
//!
//! ```text
//! Initial state (4 blocks):
//!
//!   head ─► ┌──────────┬────┐  ┌──────────┬────┐  ┌──────────┬────┐  ┌──────────┬────┐
//!           │ next: 1B │    │─►│ next: 2B │    │─►│ next: 3B │    │─►│ next: END│    │
//!           └──────────┴────┘  └──────────┴────┘  └──────────┴────┘  └──────────┴────┘
//!            offset 0           offset B           offset 2B          offset 3B
//! ```
//!
//! Offsets rather than addresses are stored so the list only ever refers to
//! positions inside the pool.
//!
//! # Limitations
//!
//! No used set exists, so releasing an address twice (or releasing a block
//! that was never handed out) is not detected. A double release links the
//! block to itself and subsequent allocations hand the same address out more
//! than once. Allocated blocks are not zeroed and still contain the stale
//! link word.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(1)
//! - **Deallocation**: O(1)
//! - **Memory Overhead**: none inside the region; blocks must be at least one
//!   `usize` wide

use std::ptr::NonNull;

use snafu::{OptionExt as _, ensure};

use crate::{
    error::{
        ExhaustedSnafu, InvalidAddressReason, InvalidAddressSnafu, InvalidGeometrySnafu,
        PoolError,
    },
    region::Region,
};

/// Link value marking the last free block.
pub const END_OF_LIST: usize = usize::MAX;

/// Width of the link word stored inside each free block.
pub const LINK_SIZE: usize = size_of::<usize>();

/// A pool of equally sized blocks threaded by an in-band free list.
///
/// # Thread Safety
///
/// The pool is `Send` but not `Sync`. Concurrent use requires external
/// synchronization.
#[derive(Debug)]
pub struct FreeListPool {
    region: Region,
    block_size: usize,
    capacity: usize,
    first_free: Option<usize>,
    free_blocks: usize,
}

impl FreeListPool {
    /// Reserves `blocks * block_size` bytes and links every block into the
    /// free list in address order.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidGeometry`] if `blocks` is zero,
    /// `block_size` is smaller than [`LINK_SIZE`], or the total size
    /// overflows, and [`PoolError::Reserve`] if the memory cannot be reserved.
    pub fn new(blocks: usize, block_size: usize) -> Result<Self, PoolError> {
        ensure!(
            block_size >= LINK_SIZE,
            InvalidGeometrySnafu { blocks, block_size }
        );
        let region = Region::reserve(blocks, block_size)?;

        let mut pool = Self {
            region,
            block_size,
            capacity: blocks,
            first_free: Some(0),
            free_blocks: blocks,
        };
        for index in 0..blocks {
            let next = if index + 1 < blocks {
                (index + 1) * block_size
            } else {
                END_OF_LIST
            };
            unsafe { pool.write_link(index * block_size, next) };
        }

        log::debug!(
            "free-list pool reserved: base={:p}, blocks={blocks}, block_size={block_size}",
            pool.region.base()
        );
        Ok(pool)
    }

    /// Pops the head of the free list.
    ///
    /// The returned block still holds the link word it carried while free.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, PoolError> {
        let capacity = self.capacity;
        ensure!(self.free_blocks > 0, ExhaustedSnafu { capacity });
        let offset = self.first_free.context(ExhaustedSnafu { capacity })?;

        let next = unsafe { self.read_link(offset) };
        debug_assert!(
            next == END_OF_LIST || next < self.region.len(),
            "corrupted free list link {next:#x} at offset {offset:#x}"
        );
        self.first_free = (next != END_OF_LIST).then_some(next);
        self.free_blocks -= 1;

        let block = self.region.at(offset);
        log::trace!("free-list pool: allocated offset {offset:#x} at {block:p}");
        Ok(block)
    }

    /// Pushes a block back onto the front of the free list.
    ///
    /// Only null, out-of-pool and misaligned addresses are rejected; the
    /// pool cannot tell whether `ptr` is currently allocated.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidAddress`] if `ptr` is null, outside the
    /// pool, or not at a block boundary.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) on this pool
    /// - `ptr` has not been released since it was last allocated
    /// - the block is not accessed after it is released
    ///
    /// Violating the first two corrupts the free list, which then hands out
    /// the same block more than once.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<(), PoolError> {
        let offset = self.block_offset(ptr)?;
        let next = self.first_free.unwrap_or(END_OF_LIST);
        unsafe { self.write_link(offset, next) };
        self.first_free = Some(offset);
        self.free_blocks += 1;
        log::trace!("free-list pool: released offset {offset:#x} at {ptr:p}");
        Ok(())
    }

    fn block_offset(&self, ptr: *const u8) -> Result<usize, PoolError> {
        let address = ptr.addr();
        ensure!(
            !ptr.is_null(),
            InvalidAddressSnafu {
                address,
                reason: InvalidAddressReason::Null,
            }
        );
        let offset = self.region.offset_of(ptr).context(InvalidAddressSnafu {
            address,
            reason: InvalidAddressReason::OutOfBounds,
        })?;
        let misalignment = offset % self.block_size;
        ensure!(
            misalignment == 0,
            InvalidAddressSnafu {
                address,
                reason: InvalidAddressReason::Misaligned {
                    offset: misalignment,
                },
            }
        );
        Ok(offset)
    }

    /// Reads the link word of the free block at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be the start of a block that is on the free list.
    unsafe fn read_link(&self, offset: usize) -> usize {
        let link = self.region.at(offset).cast::<usize>();
        unsafe { link.read_unaligned() }
    }

    /// Stores `next` in the link word of the block at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be the start of a block that nobody else accesses.
    unsafe fn write_link(&mut self, offset: usize, next: usize) {
        debug_assert!(offset.is_multiple_of(self.block_size));
        let link = self.region.at(offset).cast::<usize>();
        unsafe { link.write_unaligned(next) };
    }

    /// Returns `true` if `ptr` lies inside the pool's region.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.offset_of(ptr).is_some()
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of releases minus allocations, starting from `capacity`.
    ///
    /// After a double release this can exceed [`capacity`](Self::capacity).
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_blocks
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.free_blocks)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct TestPool {
        pool: FreeListPool,
        live: HashSet<NonNull<u8>>,
    }

    impl TestPool {
        fn allocate(&mut self) -> Option<NonNull<u8>> {
            let ptr = self.pool.allocate().ok()?;
            let base = self.pool.base().as_ptr();
            let end = base.wrapping_add(self.pool.capacity() * self.pool.block_size());
            assert!(ptr.as_ptr() >= base && ptr.as_ptr() < end);
            assert!(self.live.insert(ptr), "{ptr:p} handed out twice");
            unsafe { ptr.as_ptr().write_bytes(0x33, self.pool.block_size()) };
            Some(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
            assert!(self.live.remove(&ptr));
            unsafe {
                for i in 0..self.pool.block_size() {
                    assert_eq!(ptr.as_ptr().add(i).read(), 0x33);
                }
                ptr.as_ptr().write_bytes(0x55, self.pool.block_size());
                self.pool.deallocate(ptr.as_ptr()).unwrap();
            }
        }
    }

    fn with_test_pool<F>(blocks: usize, block_size: usize, test_fn: F)
    where
        F: FnOnce(&mut TestPool),
    {
        let pool = FreeListPool::new(blocks, block_size).unwrap();
        test_fn(&mut TestPool {
            pool,
            live: HashSet::new(),
        });
    }

    #[test]
    fn test_initial_list_is_in_address_order() {
        with_test_pool(4, 32, |pool| {
            let base = pool.pool.base().as_ptr();
            for i in 0..4 {
                assert_eq!(pool.allocate().unwrap().as_ptr(), base.wrapping_add(i * 32));
            }
            assert!(pool.allocate().is_none());
        });
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        with_test_pool(8, 16, |pool| unsafe {
            let ptrs: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
            let err = pool.pool.allocate().unwrap_err();
            assert!(matches!(err, PoolError::Exhausted { capacity: 8, .. }));

            pool.deallocate(ptrs[5]);
            assert_eq!(pool.allocate(), Some(ptrs[5]));
            assert!(pool.allocate().is_none());
        });
    }

    #[test]
    fn test_released_block_is_reused_first() {
        with_test_pool(4, 64, |pool| unsafe {
            let a = pool.allocate().unwrap();
            let b = pool.allocate().unwrap();
            pool.deallocate(a);
            pool.deallocate(b);
            assert_eq!(pool.allocate(), Some(b));
            assert_eq!(pool.allocate(), Some(a));
        });
    }

    #[test]
    fn test_interleaved_allocations_stay_in_bounds_and_distinct() {
        with_test_pool(16, 24, |pool| unsafe {
            let mut held = Vec::new();
            let mut seed = 0x2545_f491_u32;
            for _ in 0..1000 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                if seed % 3 == 0 && !held.is_empty() {
                    let index = seed as usize % held.len();
                    pool.deallocate(held.swap_remove(index));
                } else if let Some(ptr) = pool.allocate() {
                    held.push(ptr);
                }
            }
            for ptr in held {
                pool.deallocate(ptr);
            }
            assert_eq!(pool.pool.available(), 16);
        });
    }

    #[test]
    fn test_allocated_block_keeps_stale_link() {
        let mut pool = FreeListPool::new(2, 16).unwrap();
        let first = pool.allocate().unwrap();
        let link = unsafe { first.cast::<usize>().read_unaligned() };
        assert_eq!(link, 16);
    }

    #[test]
    fn test_unaligned_block_size() {
        with_test_pool(5, 13, |pool| unsafe {
            let ptrs: Vec<_> = (0..5).map(|_| pool.allocate().unwrap()).collect();
            for ptr in ptrs.into_iter().rev() {
                pool.deallocate(ptr);
            }
            assert_eq!(pool.pool.available(), 5);
        });
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let mut pool = FreeListPool::new(4, 32).unwrap();
        let base = pool.base().as_ptr();
        unsafe {
            let err = pool.deallocate(core::ptr::null_mut()).unwrap_err();
            assert_eq!(err.invalid_address_reason(), Some(InvalidAddressReason::Null));

            let err = pool.deallocate(base.wrapping_add(7)).unwrap_err();
            assert_eq!(
                err.invalid_address_reason(),
                Some(InvalidAddressReason::Misaligned { offset: 7 })
            );

            let err = pool.deallocate(base.wrapping_add(4 * 32)).unwrap_err();
            assert_eq!(
                err.invalid_address_reason(),
                Some(InvalidAddressReason::OutOfBounds)
            );
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_double_release_hands_out_duplicates() {
        // Documented limitation: the pool cannot detect a repeated release.
        let mut pool = FreeListPool::new(2, 16).unwrap();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        unsafe {
            pool.deallocate(a.as_ptr()).unwrap();
            pool.deallocate(a.as_ptr()).unwrap();
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.allocate().unwrap(), a);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_block_smaller_than_link_is_rejected() {
        assert!(matches!(
            FreeListPool::new(4, LINK_SIZE - 1),
            Err(PoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            FreeListPool::new(0, 64),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }
}
