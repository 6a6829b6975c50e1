//! Typed allocator handle that lets containers draw storage from a pool.
//!
//! A [`PoolAllocator<T>`] is a cheap, clonable handle to a shared
//! [`FreeListPool`]. Every request is served by exactly one pool block, so a
//! request for `count` elements succeeds only if `count` values of `T` fit a
//! block and the block boundary satisfies `T`'s alignment.
//!
//! Handles compare equal iff they draw from the same pool, whatever their
//! element types. Memory obtained through one handle may be released through
//! any handle that compares equal to it.

use std::{
    fmt,
    marker::PhantomData,
    ptr::NonNull,
    sync::Arc,
};

use snafu::ensure;

use crate::{
    error::{PoolError, UnsupportedLayoutSnafu},
    free_list_pool::FreeListPool,
    region::REGION_ALIGN,
};

/// Number of blocks in the pool created by [`PoolAllocator::with_default_pool`].
pub const DEFAULT_BLOCKS: usize = 256;

/// Block size of the pool created by [`PoolAllocator::with_default_pool`].
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Allocates arrays of `T` from a shared [`FreeListPool`].
pub struct PoolAllocator<T> {
    pool: Arc<spin::Mutex<FreeListPool>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolAllocator<T> {
    /// Creates a handle that takes ownership of `pool`.
    #[must_use]
    pub fn new(pool: FreeListPool) -> Self {
        Self::from_shared(Arc::new(spin::Mutex::new(pool)))
    }

    /// Creates a handle over a fresh pool of [`DEFAULT_BLOCKS`] blocks of
    /// [`DEFAULT_BLOCK_SIZE`] bytes.
    pub fn with_default_pool() -> Result<Self, PoolError> {
        FreeListPool::new(DEFAULT_BLOCKS, DEFAULT_BLOCK_SIZE).map(Self::new)
    }

    fn from_shared(pool: Arc<spin::Mutex<FreeListPool>>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Returns a handle for another element type sharing this pool.
    #[must_use]
    pub fn rebind<U>(&self) -> PoolAllocator<U> {
        PoolAllocator::from_shared(Arc::clone(&self.pool))
    }

    /// Allocates storage for `count` values of `T`.
    ///
    /// A request for zero elements still consumes one block, so the pointer
    /// can be released like any other.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnsupportedLayout`] if the request does not fit a
    /// block and [`PoolError::Exhausted`] if the pool has no free block.
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>, PoolError> {
        let block_size = self.block_size();
        let align = align_of::<T>();
        let size = count.checked_mul(size_of::<T>());
        ensure!(
            size.is_some_and(|size| size <= block_size)
                && align <= REGION_ALIGN
                && block_size % align == 0,
            UnsupportedLayoutSnafu {
                size: size.unwrap_or(usize::MAX),
                align,
                block_size,
            }
        );
        let block = self.pool.lock().allocate()?;
        Ok(block.cast())
    }

    /// Returns storage obtained from [`allocate`](Self::allocate).
    ///
    /// Addresses the pool rejects are logged and otherwise ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on a handle equal to this
    /// one and must not be used or released again afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        debug_assert!(count.saturating_mul(size_of::<T>()) <= self.block_size());
        let res = unsafe { self.pool.lock().deallocate(ptr.as_ptr().cast()) };
        if let Err(err) = res {
            log::warn!("pool allocator: ignoring release of {ptr:p} ({count} elements): {err}");
        }
    }

    /// Bytes available to a single request.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.pool.lock().block_size()
    }

    /// Number of blocks that can still be handed out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.pool.lock().available()
    }
}

impl<T> Clone for PoolAllocator<T> {
    fn clone(&self) -> Self {
        Self::from_shared(Arc::clone(&self.pool))
    }
}

impl<T> fmt::Debug for PoolAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pool", &Arc::as_ptr(&self.pool))
            .field("element", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T, U> PartialEq<PoolAllocator<U>> for PoolAllocator<T> {
    fn eq(&self, other: &PoolAllocator<U>) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl<T> Eq for PoolAllocator<T> {}
