//! Fixed-size memory pools and a process-shared arena allocator.
//!
//! This crate provides three allocators with different trade-offs between
//! bookkeeping cost, validation and sharing scope.
//!
//! # Available Allocators
//!
//! ## [`IndexedPool`]
//!
//! A pool of equally sized blocks that tracks free and allocated block
//! indices outside the pool memory. Best suited for:
//!
//! - Callers that want every release validated
//! - Debugging allocation patterns (per-block state is queryable)
//!
//! **Performance**: O(1) allocation, O(1) expected deallocation.
//!
//! ## [`FreeListPool`]
//!
//! A pool of equally sized blocks threaded by a singly linked list stored
//! inside the free blocks themselves. Best suited for:
//!
//! - Zero bookkeeping memory
//! - Backing containers through [`PoolAllocator`]
//!
//! **Performance**: O(1) allocation and deallocation.
//!
//! ## [`SharedArena`]
//!
//! A best-fit allocator for variable sizes whose whole state lives in a
//! System V shared memory segment, guarded by a named POSIX semaphore. Best
//! suited for:
//!
//! - Handing out memory visible to several cooperating processes
//! - Workloads with mixed allocation sizes
//!
//! **Performance**: O(n) allocation and O(1) deallocation, where n is the
//! number of free blocks.
//!
//! # Usage Examples
//!
//! ## Basic `IndexedPool` Usage
//!
//! ```rust
//! use mempool::IndexedPool;
//!
//! let mut pool = IndexedPool::new(4, 64).unwrap();
//! let block = pool.allocate().unwrap();
//! assert_eq!(pool.available(), 3);
//!
//! pool.deallocate(block.as_ptr()).unwrap();
//! // A second release is rejected.
//! assert!(pool.deallocate(block.as_ptr()).is_err());
//! ```
//!
//! ## Basic `FreeListPool` Usage
//!
//! ```rust
//! use mempool::FreeListPool;
//!
//! let mut pool = FreeListPool::new(16, 32).unwrap();
//! let block = pool.allocate().unwrap();
//! unsafe {
//!     block.as_ptr().write_bytes(0x55, 32);
//!     pool.deallocate(block.as_ptr()).unwrap();
//! }
//! ```
//!
//! ## Sharing a Pool between Containers
//!
//! ```rust
//! use mempool::PoolAllocator;
//!
//! let ints = PoolAllocator::<u32>::with_default_pool().unwrap();
//! let bytes = ints.rebind::<u8>();
//! assert_eq!(ints, bytes);
//!
//! let ptr = ints.allocate(4).unwrap();
//! unsafe {
//!     ptr.write(7);
//!     ints.deallocate(ptr, 4);
//! }
//! ```
//!
//! ## Shared Arena
//!
//! ```rust,no_run
//! use mempool::{ArenaConfig, SharedArena};
//!
//! let config = ArenaConfig::new("/tmp/arena.key", "/arena", 64 * 1024).unwrap();
//! let arena = SharedArena::open(&config).unwrap();
//! if let Some(ptr) = arena.allocate(128).unwrap() {
//!     unsafe { arena.deallocate(ptr.as_ptr()).unwrap() };
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Releasing memory to [`FreeListPool`] and [`SharedArena`] requires `unsafe`
//! code because neither validates that the address is currently allocated.
//! [`IndexedPool`] rejects invalid releases with an error instead.
//!
//! ## Thread Safety
//!
//! The pools are `Send` but not `Sync`. [`PoolAllocator`] wraps a
//! [`FreeListPool`] in a spin lock so its clones can be used from several
//! threads. [`SharedArena`] serializes every operation with its semaphore.
//!
//! ## Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Bookkeeping | Scope |
//! |-----------|------------|--------------|-------------|-------|
//! | `IndexedPool` | O(1) | O(1)* | Outside the pool | Process |
//! | `FreeListPool` | O(1) | O(1) | In free blocks | Process |
//! | `SharedArena` | O(n) | O(1) | 40 bytes/block | Host |
//!
//! *Expected, hash set lookup

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    adapter::PoolAllocator,
    arena::{ArenaConfig, SharedArena},
    error::{ArenaError, InvalidAddressReason, PoolError},
    free_list_pool::FreeListPool,
    indexed_pool::IndexedPool,
    region::REGION_ALIGN,
};

pub mod adapter;
pub mod arena;
pub mod error;
pub mod free_list_pool;
pub mod indexed_pool;
mod region;
