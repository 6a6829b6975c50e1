#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{fs, path::PathBuf, sync::Arc, thread};

use mempool::{
    ArenaConfig, ArenaError, SharedArena,
    arena::{BLOCK_HEADER_SIZE, BlockState},
};

const ARENA_SIZE: usize = 4096;

struct KeyFile(PathBuf);

impl Drop for KeyFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn with_test_config<F>(tag: &str, size: usize, f: F)
where
    F: FnOnce(&ArenaConfig),
{
    let pid = std::process::id();
    let key_file = KeyFile(std::env::temp_dir().join(format!("mempool-arena-{pid}-{tag}")));
    fs::write(&key_file.0, tag).unwrap();
    let config = ArenaConfig::new(&key_file.0, &format!("/mempool-{pid}-{tag}"), size)
        .unwrap()
        .with_segment_permissions(0o600)
        .with_semaphore_permissions(0o600);
    f(&config);
}

#[test]
fn create_then_join() {
    with_test_config("join", ARENA_SIZE, |config| {
        let first = SharedArena::open(config).unwrap();
        let second = SharedArena::open(config).unwrap();
        assert!(first.is_creator());
        assert!(!second.is_creator());
        assert_eq!(second.size().unwrap(), ARENA_SIZE);
    });
}

#[test]
fn allocations_are_visible_to_every_handle() {
    with_test_config("visible", ARENA_SIZE, |config| {
        let first = SharedArena::open(config).unwrap();
        let second = SharedArena::open(config).unwrap();

        let ptr = first.allocate(100).unwrap().unwrap();
        unsafe { ptr.write_bytes(0x33, 100) };

        let stats = second.stats().unwrap();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated, 104 + BLOCK_HEADER_SIZE);

        let blocks = second.blocks().unwrap();
        let block = blocks
            .iter()
            .find(|block| block.state == BlockState::Allocated)
            .unwrap();
        let seen = second.payload(block);
        assert!(second.contains(seen.as_ptr()));
        assert_eq!(unsafe { seen.add(99).read() }, 0x33);

        // Released through the other mapping.
        unsafe { second.deallocate(seen.as_ptr()).unwrap() };
        let stats = first.stats().unwrap();
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.free_blocks, 1);
        first.verify().unwrap();
    });
}

#[test]
fn whole_arena_is_handed_out_once() {
    with_test_config("whole", ARENA_SIZE, |config| {
        let arena = SharedArena::open(config).unwrap();
        let whole = ARENA_SIZE - BLOCK_HEADER_SIZE;

        let ptr = arena.allocate(whole).unwrap().unwrap();
        let err = arena.allocate(1).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::OutOfMemory {
                requested: 1,
                largest_free: 0,
                ..
            }
        ));
        assert!(err.is_allocation_failure());

        unsafe { arena.deallocate(ptr.as_ptr()).unwrap() };
        let again = arena.allocate(whole).unwrap().unwrap();
        assert_eq!(again, ptr);
        unsafe { arena.deallocate(again.as_ptr()).unwrap() };
    });
}

#[test]
fn round_trip_restores_initial_state() {
    with_test_config("roundtrip", ARENA_SIZE, |config| {
        let arena = SharedArena::open(config).unwrap();
        let initial = arena.stats().unwrap();

        let ptrs: Vec<_> = [8, 100, 256, 1]
            .into_iter()
            .map(|size| arena.allocate(size).unwrap().unwrap())
            .collect();
        arena.verify().unwrap();
        assert_eq!(arena.stats().unwrap().allocated_blocks, 4);

        for ptr in ptrs {
            unsafe { arena.deallocate(ptr.as_ptr()).unwrap() };
        }
        assert_eq!(arena.stats().unwrap(), initial);
        arena.verify().unwrap();
    });
}

#[test]
fn zero_size_and_null_requests() {
    with_test_config("zero", ARENA_SIZE, |config| {
        let arena = SharedArena::open(config).unwrap();
        let initial = arena.stats().unwrap();

        assert!(arena.allocate(0).unwrap().is_none());
        assert_eq!(arena.stats().unwrap(), initial);

        let err = unsafe { arena.deallocate(std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, ArenaError::NullPointer { .. }));
        assert!(!err.is_allocation_failure());
    });
}

#[test]
fn pointer_from_another_mapping_is_rejected() {
    with_test_config("foreign", ARENA_SIZE, |config| {
        let first = SharedArena::open(config).unwrap();
        let second = SharedArena::open(config).unwrap();
        let ptr = first.allocate(64).unwrap().unwrap();
        assert!(!second.contains(ptr.as_ptr()));

        let err = unsafe { second.deallocate(ptr.as_ptr()) }.unwrap_err();
        assert!(matches!(err, ArenaError::ForeignPointer { .. }));
        let stats = second.stats().unwrap();
        assert_eq!(stats.allocated_blocks, 1);
        second.verify().unwrap();

        // Rebased on the second mapping, the same block is released.
        let offset = ptr.as_ptr().addr() - first.base().as_ptr().addr();
        let rebased = unsafe { second.base().add(offset) };
        unsafe { second.deallocate(rebased.as_ptr()).unwrap() };
        assert_eq!(first.stats().unwrap().allocated_blocks, 0);
        first.verify().unwrap();
    });
}

#[test]
fn oversized_arena_is_rejected_before_open() {
    let err =
        ArenaConfig::new(std::env::temp_dir(), "/mempool-oversized", usize::MAX).unwrap_err();
    assert!(matches!(err, ArenaError::ArenaTooLarge { .. }));
}

#[test]
fn oversized_request_fails() {
    with_test_config("oversized", ARENA_SIZE, |config| {
        let arena = SharedArena::open(config).unwrap();
        let err = arena.allocate(ARENA_SIZE).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory { .. }));

        let err = arena.allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, ArenaError::RequestTooLarge { .. }));
    });
}

#[test]
fn threads_share_one_handle() {
    with_test_config("threads", 64 * 1024, |config| {
        let arena = Arc::new(SharedArena::open(config).unwrap());
        let handles: Vec<_> = (0..4_u8)
            .map(|n| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    for i in 0..100 {
                        let len = 16 + usize::from(n) * 8 + i % 32;
                        let ptr = arena.allocate(len).unwrap().unwrap();
                        unsafe {
                            ptr.write_bytes(n, len);
                            assert_eq!(ptr.add(len - 1).read(), n);
                            arena.deallocate(ptr.as_ptr()).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = arena.stats().unwrap();
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.free_blocks, 1);
        arena.verify().unwrap();
    });
}

#[test]
fn teardown_by_every_handle() {
    with_test_config("teardown", ARENA_SIZE, |config| {
        let first = SharedArena::open(config).unwrap();
        let second = SharedArena::open(config).unwrap();
        let ptr = second.allocate(64).unwrap().unwrap();

        // The first teardown removes the segment; the second handle keeps its
        // mapping and only logs when its own removal fails.
        drop(first);
        unsafe {
            ptr.write_bytes(0x55, 64);
            second.deallocate(ptr.as_ptr()).unwrap();
        }
        drop(second);

        let fresh = SharedArena::open(config).unwrap();
        assert!(fresh.is_creator());
        assert_eq!(fresh.stats().unwrap().allocated_blocks, 0);
    });
}
