//! Variable-size allocator over a process-shared memory segment.
//!
//! A [`SharedArena`] manages one System V shared memory segment that any
//! number of independent processes may attach. Blocks are carved out of the
//! segment with a best-fit policy, split when the chosen block is larger than
//! needed, and merged with free neighbours when released.
//!
//! Each block carries a [`BLOCK_HEADER_SIZE`]-byte header in front of its
//! payload, and the segment starts with an [`ARENA_HEADER_SIZE`]-byte arena
//! header. All links stored in the segment are offsets, so participants may
//! map it at different addresses.
//!
//! # Create or Join
//!
//! The first process to open a given [`ArenaConfig`] creates the segment and
//! writes the arena header describing one free block that spans the whole
//! arena. Later processes find the segment already present and attach to it
//! without touching the header.
//!
//! # Synchronization
//!
//! Every operation runs under a named POSIX semaphore shared by all
//! participants, so allocations and releases from different processes (or
//! threads) never overlap. Waiting for the semaphore blocks indefinitely.
//!
//! # Teardown
//!
//! Dropping a [`SharedArena`] detaches the segment, marks it for destruction
//! and unlinks the semaphore, regardless of whether other processes still
//! use them. Processes already attached keep working, but a process opening
//! the same configuration afterwards creates a fresh arena. When several
//! participants tear down, all but the first report (and log) the removal as
//! failed.
//!
//! This includes handles whose [`SharedArena::open`] failed after the
//! segment and semaphore were acquired. A process that joins while the
//! creator has not yet written the arena header fails with
//! [`ArenaError::NotInitialized`], and in doing so removes the creator's
//! segment and unlinks its semaphore.
//!
//! # Limitations
//!
//! Releasing an address that was not handed out by the arena, or releasing
//! it twice, is not detected and corrupts the block lists. Participants are
//! assumed not to crash while holding the semaphore.
//!
//! Pointers are only meaningful in the mapping of the handle that produced
//! them. To hand a block to another process (or another handle), pass its
//! offset from [`SharedArena::base`] and rebase it on the receiving side.
//!
//! The creator writes the arena header after the segment becomes visible to
//! other processes. A joiner racing with it is rejected rather than made to
//! wait, so participants should start joining after the creator's `open`
//! returned.

use std::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use snafu::ensure;

use self::{
    heap::Heap,
    segment::SharedSegment,
    semaphore::{NamedSemaphore, SemaphoreGuard},
};
pub use self::{
    config::{
        ArenaConfig, DEFAULT_PROJECT_ID, DEFAULT_SEGMENT_PERMISSIONS,
        DEFAULT_SEMAPHORE_PERMISSIONS, MAX_ARENA_SIZE, MAX_SEMAPHORE_NAME_LEN,
    },
    heap::{ArenaStats, BlockInfo},
    layout::{ARENA_HEADER_SIZE, BLOCK_ALIGN, BLOCK_HEADER_SIZE, BlockState},
    segment::SegmentKey,
};
use crate::error::{ArenaError, ForeignPointerSnafu, NotInitializedSnafu, NullPointerSnafu};

mod config;
mod heap;
mod layout;
mod segment;
mod semaphore;

/// A best-fit allocator whose state lives in shared memory.
///
/// `SharedArena` is `Send` and `Sync`; all state changes are serialized by
/// the arena's semaphore.
pub struct SharedArena {
    // Drop order: detach the segment before releasing the semaphore.
    segment: SharedSegment,
    semaphore: NamedSemaphore,
}

impl SharedArena {
    /// Creates the arena described by `config`, or joins it if another
    /// process already did.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be derived, the segment cannot be
    /// created, joined or attached, the semaphore cannot be opened, or a
    /// joined segment holds no arena. Anything acquired before the failure is
    /// released again.
    pub fn open(config: &ArenaConfig) -> Result<Self, ArenaError> {
        let key = SegmentKey::from_path(config.key_path(), config.project_id())?;
        let segment = SharedSegment::create_or_join(
            key,
            ARENA_HEADER_SIZE + config.size(),
            config.segment_permissions(),
        )?;
        let semaphore =
            NamedSemaphore::open(config.semaphore_name_arc(), config.semaphore_permissions())?;
        let arena = Self { segment, semaphore };

        if arena.is_creator() {
            arena.lock()?.init(config.size());
            log::debug!(
                "shared arena initialized: id={}, size={}",
                arena.segment.id(),
                config.size()
            );
        } else {
            let initialized = arena.lock()?.is_initialized();
            ensure!(
                initialized,
                NotInitializedSnafu {
                    id: arena.segment.id(),
                }
            );
            log::debug!("shared arena joined: id={}", arena.segment.id());
        }

        Ok(arena)
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `Ok(None)` without touching the arena if `size` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::OutOfMemory`] if no free block is large enough
    /// and [`ArenaError::Lock`] if the semaphore cannot be acquired.
    pub fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>, ArenaError> {
        if size == 0 {
            return Ok(None);
        }
        let offset = self.lock()?.allocate(size)?;
        Ok(Some(self.at(offset)))
    }

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::NullPointer`] if `ptr` is null,
    /// [`ArenaError::ForeignPointer`] if it lies outside this handle's mapping
    /// and [`ArenaError::Lock`] if the semaphore cannot be acquired. The arena
    /// is left unchanged in every error case.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` is the payload address of a block allocated from this segment,
    ///   as seen in this handle's mapping (a block allocated elsewhere must be
    ///   rebased through [`base`](Self::base) or [`payload`](Self::payload))
    /// - the block has not been released since, by any participant
    /// - the block is not accessed after it is released
    ///
    /// Violations corrupt the arena; later operations may panic or hand out
    /// overlapping blocks.
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> Result<(), ArenaError> {
        ensure!(!ptr.is_null(), NullPointerSnafu);
        ensure!(
            self.contains(ptr),
            ForeignPointerSnafu {
                address: ptr.addr(),
            }
        );
        let offset = ptr.addr().wrapping_sub(self.segment.addr().addr().get());
        let mut heap = self.lock()?;
        unsafe { heap.deallocate(offset) };
        Ok(())
    }

    /// Returns the occupancy of the arena.
    pub fn stats(&self) -> Result<ArenaStats, ArenaError> {
        Ok(self.lock()?.stats())
    }

    /// Returns every block of the arena in address order.
    pub fn blocks(&self) -> Result<Vec<BlockInfo>, ArenaError> {
        Ok(self.lock()?.blocks().collect())
    }

    /// Checks the arena's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Corrupted`] describing the first violation found.
    pub fn verify(&self) -> Result<(), ArenaError> {
        self.lock()?.verify()
    }

    /// Returns `true` if this handle created the segment.
    #[must_use]
    pub fn is_creator(&self) -> bool {
        self.segment.created()
    }

    /// Bytes covered by blocks, headers included.
    pub fn size(&self) -> Result<usize, ArenaError> {
        Ok(self.lock()?.size())
    }

    /// Address at which this process sees the segment.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.segment.addr()
    }

    /// Returns the payload pointer of a [`BlockInfo`] in this process.
    #[must_use]
    pub fn payload(&self, block: &BlockInfo) -> NonNull<u8> {
        self.at(block.offset + BLOCK_HEADER_SIZE)
    }

    /// Returns `true` if `ptr` lies inside this process's mapping.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr.addr()
            .checked_sub(self.segment.addr().addr().get())
            .is_some_and(|offset| offset < self.segment.len())
    }

    fn at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.segment.len());
        unsafe { self.segment.addr().add(offset) }
    }

    fn lock(&self) -> Result<ArenaGuard<'_>, ArenaError> {
        let guard = self.semaphore.lock()?;
        let heap = unsafe { Heap::from_raw(self.segment.addr(), self.segment.len()) };
        Ok(ArenaGuard {
            heap,
            _guard: guard,
        })
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        log::debug!(
            "shared arena teardown: id={}, semaphore={:?}",
            self.segment.id(),
            self.semaphore.name()
        );
    }
}

/// Exclusive access to the arena's heap for the lifetime of the guard.
struct ArenaGuard<'a> {
    heap: Heap,
    _guard: SemaphoreGuard<'a>,
}

impl Deref for ArenaGuard<'_> {
    type Target = Heap;

    fn deref(&self) -> &Self::Target {
        &self.heap
    }
}

impl DerefMut for ArenaGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.heap
    }
}
