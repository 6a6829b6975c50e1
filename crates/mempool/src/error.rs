//! Error types shared by the allocators.

use std::{io, path::PathBuf};

use snafu::Snafu;
use snafu_utils::Location;

/// Why an address was rejected by a pool's `deallocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum InvalidAddressReason {
    #[display("null pointer")]
    Null,
    #[display("outside of the pool")]
    OutOfBounds,
    #[display("not at a block boundary (offset {offset} into its block)")]
    Misaligned { offset: usize },
    #[display("block is not currently allocated")]
    NotAllocated,
}

/// Errors returned by the fixed-size pools and the container adapter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PoolError {
    #[snafu(display("invalid pool geometry: blocks={blocks}, block_size={block_size}"))]
    InvalidGeometry {
        blocks: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve {size} bytes of pool memory"))]
    Reserve {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool exhausted: all {capacity} blocks are in use"))]
    Exhausted {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid address {address:#x}: {reason}"))]
    InvalidAddress {
        address: usize,
        reason: InvalidAddressReason,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "request does not fit a pool block: size={size}, align={align}, block_size={block_size}"
    ))]
    UnsupportedLayout {
        size: usize,
        align: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PoolError {
    /// Returns `true` if the error means no memory could be handed out.
    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        !matches!(self, Self::InvalidAddress { .. })
    }

    /// Returns the rejection reason for an [`InvalidAddress`](Self::InvalidAddress) error.
    #[must_use]
    pub fn invalid_address_reason(&self) -> Option<InvalidAddressReason> {
        match self {
            Self::InvalidAddress { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Errors returned by [`SharedArena`](crate::arena::SharedArena) and its configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArenaError {
    #[snafu(display("invalid semaphore name {name:?}: {reason}"))]
    InvalidSemaphoreName {
        name: String,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid key path {}: contains a NUL byte", path.display()))]
    InvalidPath {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {size} bytes cannot hold a single block (minimum {minimum})"))]
    ArenaTooSmall {
        size: usize,
        minimum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {size} bytes exceeds the maximum of {maximum} bytes"))]
    ArenaTooLarge {
        size: usize,
        maximum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to derive a segment key from {}", path.display()))]
    KeyGeneration {
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("failed to create shared segment, key={key:#x}, size={size}"))]
    CreateSegment {
        key: i32,
        size: usize,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("failed to join shared segment, key={key:#x}, size={size}"))]
    JoinSegment {
        key: i32,
        size: usize,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("failed to attach shared segment, id={id}"))]
    AttachSegment {
        id: i32,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("failed to query shared segment, id={id}"))]
    StatSegment {
        id: i32,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("joined segment id={id} carries no initialized arena header"))]
    NotInitialized {
        id: i32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to open semaphore {name:?}"))]
    OpenSemaphore {
        name: String,
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display("failed to acquire arena semaphore"))]
    Lock {
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    },
    #[snafu(display(
        "no free block can hold {requested} bytes (largest free block: {largest_free} bytes)"
    ))]
    OutOfMemory {
        requested: usize,
        largest_free: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request of {requested} bytes overflows the block size"))]
    RequestTooLarge {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot deallocate a null pointer"))]
    NullPointer {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {address:#x} lies outside this handle's mapping"))]
    ForeignPointer {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena corrupted at offset {offset:#x}: {reason}"))]
    Corrupted {
        offset: usize,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ArenaError {
    /// Returns `true` if the error means the arena could not satisfy a request.
    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::RequestTooLarge { .. }
        )
    }
}
