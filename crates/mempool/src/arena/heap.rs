//! Offset-based block management over an arena's bytes.
//!
//! [`Heap`] implements the allocation policy of the shared arena without any
//! knowledge of how the bytes are obtained or synchronized:
//!
//! - **Allocation**: best fit over the free list. The free block whose size
//!   exceeds the request by the least is chosen; an exact fit ends the scan.
//! - **Splitting**: if the chosen block leaves at least one block header's
//!   worth of bytes, the remainder becomes a new free block that takes the
//!   chosen block's place in the free list.
//! - **Deallocation**: the block moves to the front of the free list and is
//!   merged with its arena-order neighbours if they are free.
//!
//! Every header access is bounds checked against the region, so a corrupted
//! link panics instead of touching memory outside the arena.

use std::{collections::BTreeSet, ptr::NonNull};

use snafu::{OptionExt as _, ensure};

use super::layout::{
    ARENA_HEADER_SIZE, ArenaHeader, BLOCK_ALIGN, BLOCK_HEADER_SIZE, BlockHeader, BlockState, List,
    NIL, block_size_for,
};
use crate::error::{ArenaError, CorruptedSnafu, OutOfMemorySnafu, RequestTooLargeSnafu};

/// One block as seen when walking the arena in address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the start of the segment.
    pub offset: usize,
    /// Block size in bytes, header included.
    pub size: usize,
    pub state: BlockState,
}

impl BlockInfo {
    /// Bytes usable by the caller.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.size - BLOCK_HEADER_SIZE
    }
}

/// Occupancy summary of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Bytes covered by blocks.
    pub size: usize,
    /// Bytes held by allocated blocks, headers included.
    pub allocated: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    /// Largest payload a single allocation could currently receive.
    pub largest_free: usize,
}

/// A view of an arena's bytes.
pub(crate) struct Heap {
    base: NonNull<u8>,
    len: usize,
}

impl Heap {
    /// Creates a view over `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + len` is valid for reads and writes for the lifetime
    ///   of the view
    /// - `base` is aligned to [`BLOCK_ALIGN`]
    /// - no one else reads or writes the range while the view is in use
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        assert!(base.as_ptr().addr().is_multiple_of(BLOCK_ALIGN));
        Self { base, len }
    }

    /// Writes a fresh header describing one free block of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`BLOCK_ALIGN`], cannot hold a
    /// block header, or does not fit the region.
    pub(crate) fn init(&mut self, size: usize) {
        assert!(size.is_multiple_of(BLOCK_ALIGN));
        assert!(size >= BLOCK_HEADER_SIZE);
        assert!(ARENA_HEADER_SIZE + size <= self.len);

        self.set_header(ArenaHeader::new(size));
        self.set_block(
            ARENA_HEADER_SIZE,
            BlockHeader::new(size, NIL, BlockState::Free),
        );
    }

    pub(crate) fn is_initialized(&self) -> bool {
        if self.len < ARENA_HEADER_SIZE {
            return false;
        }
        let header = self.header();
        header.is_initialized() && header.end() <= self.len
    }

    pub(crate) fn size(&self) -> usize {
        self.header().size
    }

    /// Carves `payload` bytes out of the best fitting free block.
    ///
    /// Returns the offset of the payload from the start of the region.
    pub(crate) fn allocate(&mut self, payload: usize) -> Result<usize, ArenaError> {
        let needed = block_size_for(payload).context(RequestTooLargeSnafu { requested: payload })?;
        let Some(offset) = self.find_best_fit(needed) else {
            return OutOfMemorySnafu {
                requested: payload,
                largest_free: self.stats().largest_free,
            }
            .fail();
        };

        self.split(offset, needed);
        self.unlink(List::Free, offset);
        self.update_block(offset, |block| block.set_state(BlockState::Allocated));
        self.push_front(List::Allocated, offset);

        let size = self.block(offset).size;
        self.update_header(|header| header.allocated += size);

        log::trace!("heap: allocated block offset={offset:#x}, size={size}, payload={payload}");
        Ok(offset + BLOCK_HEADER_SIZE)
    }

    /// Returns the block owning the payload at `payload_offset` to the free
    /// list and merges it with free neighbours.
    ///
    /// # Safety
    ///
    /// `payload_offset` must have been returned by [`allocate`](Self::allocate)
    /// on this arena and not deallocated since. Otherwise the lists are
    /// corrupted; later operations may panic or hand out overlapping blocks.
    pub(crate) unsafe fn deallocate(&mut self, payload_offset: usize) {
        let offset = payload_offset.wrapping_sub(BLOCK_HEADER_SIZE);
        let block = self.block(offset);
        debug_assert_eq!(block.state(), Some(BlockState::Allocated));

        self.update_block(offset, |block| block.set_state(BlockState::Free));
        self.update_header(|header| header.allocated = header.allocated.saturating_sub(block.size));
        self.unlink(List::Allocated, offset);
        self.push_front(List::Free, offset);
        self.coalesce(offset);

        log::trace!("heap: released block offset={offset:#x}, size={}", block.size);
    }

    fn find_best_fit(&self, needed: usize) -> Option<usize> {
        let mut best = None;
        let mut best_excess = usize::MAX;

        let mut current = self.header().free_head;
        while current != NIL {
            let block = self.block(current);
            if block.is_free() && block.size >= needed {
                let excess = block.size - needed;
                if excess < best_excess {
                    best = Some(current);
                    best_excess = excess;
                    if excess == 0 {
                        break;
                    }
                }
            }
            current = block.next;
        }

        best
    }

    fn split(&mut self, offset: usize, needed: usize) {
        let block = self.block(offset);
        let remainder = block.size - needed;
        if remainder < BLOCK_HEADER_SIZE {
            return;
        }

        let rest = offset + needed;
        self.set_block(rest, BlockHeader::new(remainder, offset, BlockState::Free));
        if let Some(after) = self.next_in_arena(rest) {
            self.update_block(after, |block| block.prev_in_arena = rest);
        }
        self.insert_after(offset, rest);
        self.update_block(offset, |block| block.size = needed);
    }

    fn coalesce(&mut self, offset: usize) {
        if let Some(next) = self.next_in_arena(offset) {
            if self.block(next).is_free() {
                self.absorb(offset, next);
            }
        }

        let prev = self.block(offset).prev_in_arena;
        if prev != NIL && self.block(prev).is_free() {
            self.absorb(prev, offset);
        }
    }

    /// Merges the free block `absorbed` into its arena-order predecessor
    /// `survivor`.
    fn absorb(&mut self, survivor: usize, absorbed: usize) {
        debug_assert_eq!(self.next_in_arena(survivor), Some(absorbed));

        let absorbed_size = self.block(absorbed).size;
        self.unlink(List::Free, absorbed);
        self.update_block(survivor, |block| block.size += absorbed_size);
        if let Some(after) = self.next_in_arena(survivor) {
            self.update_block(after, |block| block.prev_in_arena = survivor);
        }
    }

    fn next_in_arena(&self, offset: usize) -> Option<usize> {
        let next = offset + self.block(offset).size;
        (next < self.header().end()).then_some(next)
    }

    fn unlink(&mut self, list: List, offset: usize) {
        let block = self.block(offset);
        if block.prev == NIL {
            self.update_header(|header| header.set_head(list, block.next));
        } else {
            self.update_block(block.prev, |prev| prev.next = block.next);
        }
        if block.next != NIL {
            self.update_block(block.next, |next| next.prev = block.prev);
        }
        self.update_block(offset, |block| {
            block.next = NIL;
            block.prev = NIL;
        });
    }

    fn push_front(&mut self, list: List, offset: usize) {
        let head = self.header().head(list);
        self.update_block(offset, |block| {
            block.prev = NIL;
            block.next = head;
        });
        if head != NIL {
            self.update_block(head, |head| head.prev = offset);
        }
        self.update_header(|header| header.set_head(list, offset));
    }

    fn insert_after(&mut self, anchor: usize, offset: usize) {
        let next = self.block(anchor).next;
        self.update_block(offset, |block| {
            block.prev = anchor;
            block.next = next;
        });
        self.update_block(anchor, |anchor| anchor.next = offset);
        if next != NIL {
            self.update_block(next, |next| next.prev = offset);
        }
    }

    /// Walks the arena in address order.
    pub(crate) fn blocks(&self) -> Blocks<'_> {
        let header = self.header();
        Blocks {
            heap: self,
            offset: ARENA_HEADER_SIZE,
            end: header.end(),
        }
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        let header = self.header();
        let mut stats = ArenaStats {
            size: header.size,
            allocated: header.allocated,
            ..ArenaStats::default()
        };
        for block in self.blocks() {
            match block.state {
                BlockState::Free => {
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(block.payload_len());
                }
                BlockState::Allocated => stats.allocated_blocks += 1,
            }
        }
        stats
    }

    /// Checks the structural invariants of the arena.
    ///
    /// - blocks tile the arena exactly, without gaps or overlaps
    /// - every block is on the list matching its state, exactly once
    /// - no two arena-adjacent blocks are both free
    /// - the allocated byte counter matches the allocated blocks
    pub(crate) fn verify(&self) -> Result<(), ArenaError> {
        ensure!(
            self.is_initialized(),
            CorruptedSnafu {
                offset: 0_usize,
                reason: "missing or oversized arena header",
            }
        );
        let header = self.header();

        let mut starts = BTreeSet::new();
        let mut allocated = 0;
        let mut prev: Option<BlockHeader> = None;
        let mut prev_offset = NIL;
        let mut offset = ARENA_HEADER_SIZE;
        while offset < header.end() {
            ensure!(
                offset + BLOCK_HEADER_SIZE <= header.end(),
                CorruptedSnafu {
                    offset,
                    reason: "block header crosses the arena end",
                }
            );
            let block = self.block(offset);
            ensure!(
                block.size >= BLOCK_HEADER_SIZE
                    && block.size.is_multiple_of(BLOCK_ALIGN)
                    && block.size <= header.end() - offset,
                CorruptedSnafu {
                    offset,
                    reason: "block size out of range",
                }
            );
            let state = block.state().context(CorruptedSnafu {
                offset,
                reason: "invalid block state",
            })?;
            ensure!(
                block.prev_in_arena == prev_offset,
                CorruptedSnafu {
                    offset,
                    reason: "arena predecessor link mismatch",
                }
            );
            ensure!(
                !(block.is_free() && prev.is_some_and(|prev| prev.is_free())),
                CorruptedSnafu {
                    offset,
                    reason: "adjacent free blocks were not merged",
                }
            );
            if state.is_allocated() {
                allocated += block.size;
            }

            starts.insert(offset);
            prev = Some(block);
            prev_offset = offset;
            offset += block.size;
        }
        ensure!(
            offset == header.end(),
            CorruptedSnafu {
                offset,
                reason: "blocks do not tile the arena",
            }
        );
        ensure!(
            allocated == header.allocated,
            CorruptedSnafu {
                offset: 0_usize,
                reason: "allocated byte counter mismatch",
            }
        );

        let mut listed = 0;
        for (list, state) in [
            (List::Free, BlockState::Free),
            (List::Allocated, BlockState::Allocated),
        ] {
            let mut prev = NIL;
            let mut current = header.head(list);
            while current != NIL {
                ensure!(
                    starts.contains(&current),
                    CorruptedSnafu {
                        offset: current,
                        reason: "list link does not point at a block",
                    }
                );
                ensure!(
                    listed < starts.len(),
                    CorruptedSnafu {
                        offset: current,
                        reason: "block list contains a cycle",
                    }
                );
                let block = self.block(current);
                ensure!(
                    block.state() == Some(state) && state.list() == list,
                    CorruptedSnafu {
                        offset: current,
                        reason: "block is on the wrong list",
                    }
                );
                ensure!(
                    block.prev == prev,
                    CorruptedSnafu {
                        offset: current,
                        reason: "list back link mismatch",
                    }
                );
                listed += 1;
                prev = current;
                current = block.next;
            }
        }
        ensure!(
            listed == starts.len(),
            CorruptedSnafu {
                offset: 0_usize,
                reason: "some blocks are on no list",
            }
        );

        Ok(())
    }

    fn header(&self) -> ArenaHeader {
        assert!(ARENA_HEADER_SIZE <= self.len);
        unsafe { self.base.cast::<ArenaHeader>().read() }
    }

    fn set_header(&mut self, header: ArenaHeader) {
        assert!(ARENA_HEADER_SIZE <= self.len);
        unsafe { self.base.cast::<ArenaHeader>().write(header) };
    }

    fn update_header(&mut self, f: impl FnOnce(&mut ArenaHeader)) {
        let mut header = self.header();
        f(&mut header);
        self.set_header(header);
    }

    fn block_ptr(&self, offset: usize) -> NonNull<BlockHeader> {
        assert!(
            offset >= ARENA_HEADER_SIZE
                && offset.is_multiple_of(BLOCK_ALIGN)
                && offset
                    .checked_add(BLOCK_HEADER_SIZE)
                    .is_some_and(|end| end <= self.len),
            "block offset {offset:#x} outside arena of {} bytes",
            self.len
        );
        unsafe { self.base.add(offset).cast() }
    }

    fn block(&self, offset: usize) -> BlockHeader {
        unsafe { self.block_ptr(offset).read() }
    }

    fn set_block(&mut self, offset: usize, block: BlockHeader) {
        unsafe { self.block_ptr(offset).write(block) };
    }

    fn update_block(&mut self, offset: usize, f: impl FnOnce(&mut BlockHeader)) {
        let mut block = self.block(offset);
        f(&mut block);
        self.set_block(offset, block);
    }
}

/// Iterator over the blocks of an arena in address order.
///
/// Stops early at the first malformed block; use [`Heap::verify`] to find out
/// why.
pub(crate) struct Blocks<'a> {
    heap: &'a Heap,
    offset: usize,
    end: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset.checked_add(BLOCK_HEADER_SIZE)? > self.end {
            return None;
        }
        let block = self.heap.block(self.offset);
        let state = block.state()?;
        if block.size < BLOCK_HEADER_SIZE || block.size > self.end - self.offset {
            return None;
        }
        let info = BlockInfo {
            offset: self.offset,
            size: block.size,
            state,
        };
        self.offset += block.size;
        Some(info)
    }
}
