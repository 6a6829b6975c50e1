//! In-band records stored inside the shared arena.
//!
//! ```text
//! segment
//! ┌──────────────┬───────────────────────┬───────────────────────┬─────┐
//! │ ArenaHeader  │ BlockHeader │ payload │ BlockHeader │ payload │ ... │
//! └──────────────┴───────────────────────┴───────────────────────┴─────┘
//! 0              ARENA_HEADER_SIZE
//!                ◄─────── block.size ────►
//!                ◄──────────────── arena size (header.size) ─────────────►
//! ```
//!
//! All links are byte offsets from the start of the segment, so every
//! process may map the segment at a different address.

/// Link value meaning "no block".
pub(crate) const NIL: usize = usize::MAX;

const ARENA_MAGIC: u64 = u64::from_le_bytes(*b"mempool\0");

/// Alignment of every block header and payload.
pub const BLOCK_ALIGN: usize = align_of::<BlockHeader>();

/// Bytes of overhead in front of every block's payload.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes reserved at the start of the segment for the arena header.
pub const ARENA_HEADER_SIZE: usize = size_of::<ArenaHeader>();

const _: () = assert!(BLOCK_HEADER_SIZE.is_multiple_of(BLOCK_ALIGN));
const _: () = assert!(ARENA_HEADER_SIZE.is_multiple_of(BLOCK_ALIGN));

/// Arena-wide bookkeeping at offset 0 of the segment.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArenaHeader {
    pub(crate) magic: u64,
    /// Bytes covered by blocks, excluding this header.
    pub(crate) size: usize,
    /// Sum of the sizes of all allocated blocks, headers included.
    pub(crate) allocated: usize,
    pub(crate) allocated_head: usize,
    pub(crate) free_head: usize,
}

impl ArenaHeader {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            magic: ARENA_MAGIC,
            size,
            allocated: 0,
            allocated_head: NIL,
            free_head: ARENA_HEADER_SIZE,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.magic == ARENA_MAGIC
    }

    /// Offset one past the last block.
    pub(crate) fn end(&self) -> usize {
        ARENA_HEADER_SIZE + self.size
    }

    pub(crate) fn head(&self, list: List) -> usize {
        match list {
            List::Free => self.free_head,
            List::Allocated => self.allocated_head,
        }
    }

    pub(crate) fn set_head(&mut self, list: List, offset: usize) {
        match list {
            List::Free => self.free_head = offset,
            List::Allocated => self.allocated_head = offset,
        }
    }
}

/// Per-block header placed immediately before the block's payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    /// Block size in bytes, header included.
    pub(crate) size: usize,
    /// Next block in the list owning this block.
    pub(crate) next: usize,
    /// Previous block in the list owning this block.
    pub(crate) prev: usize,
    /// Arena-order predecessor, or [`NIL`] for the first block.
    pub(crate) prev_in_arena: usize,
    pub(crate) state: usize,
}

impl BlockHeader {
    pub(crate) fn new(size: usize, prev_in_arena: usize, state: BlockState) -> Self {
        Self {
            size,
            next: NIL,
            prev: NIL,
            prev_in_arena,
            state: state.into_raw(),
        }
    }

    pub(crate) fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state() == Some(BlockState::Free)
    }

    pub(crate) fn set_state(&mut self, state: BlockState) {
        self.state = state.into_raw();
    }
}

/// Whether a block is available for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum BlockState {
    #[display("free")]
    Free,
    #[display("allocated")]
    Allocated,
}

impl BlockState {
    const FREE: usize = 0xf4ee;
    const ALLOCATED: usize = 0xa110c;

    fn into_raw(self) -> usize {
        match self {
            Self::Free => Self::FREE,
            Self::Allocated => Self::ALLOCATED,
        }
    }

    fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            Self::FREE => Some(Self::Free),
            Self::ALLOCATED => Some(Self::Allocated),
            _ => None,
        }
    }

    pub(crate) fn list(self) -> List {
        match self {
            Self::Free => List::Free,
            Self::Allocated => List::Allocated,
        }
    }
}

/// The two doubly linked lists threaded through the block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum List {
    Free,
    Allocated,
}

/// Rounds a payload request up to the block alignment and adds the header.
///
/// Returns `None` on overflow.
pub(crate) fn block_size_for(payload: usize) -> Option<usize> {
    payload
        .checked_next_multiple_of(BLOCK_ALIGN)?
        .checked_add(BLOCK_HEADER_SIZE)
}
