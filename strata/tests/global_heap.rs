//! Integration tests for the lock-protected heap

mod common;

use common::Arena;
use core::alloc::{GlobalAlloc, Layout};
use strata::{DEFAULT_TIERS, HeapError, LockedTieredHeap};

static HEAP: LockedTieredHeap = LockedTieredHeap::empty();

#[test]
fn test_static_heap_lifecycle() {
    let arena = Arena::new(128 * 1024);
    let layout = Layout::from_size_align(64, 16).unwrap();

    assert!(unsafe { HEAP.alloc(layout) }.is_null());

    unsafe { HEAP.init(arena.as_mut_ptr(), arena.len(), &DEFAULT_TIERS) }.unwrap();
    assert_eq!(
        unsafe { HEAP.init(arena.as_mut_ptr(), arena.len(), &DEFAULT_TIERS) },
        Err(HeapError::AlreadyInitialized)
    );

    let ptrs: Vec<_> = (0..32)
        .map(|i| {
            let layout = Layout::from_size_align(8 + i * 24, 8).unwrap();
            let ptr = unsafe { HEAP.alloc(layout) };
            assert!(!ptr.is_null());
            (ptr, layout)
        })
        .collect();

    for &(ptr, layout) in &ptrs {
        unsafe { HEAP.dealloc(ptr, layout) };
    }
    HEAP.collect();

    let report = HEAP.teardown().unwrap();
    assert!(report.is_clean());
    assert!(!HEAP.is_initialized());
}

#[test]
fn test_shared_across_threads() {
    let arena = Arena::new(512 * 1024);
    let heap = LockedTieredHeap::empty();
    unsafe { heap.init(arena.as_mut_ptr(), arena.len(), &DEFAULT_TIERS) }.unwrap();

    std::thread::scope(|scope| {
        for thread in 0..4 {
            let heap = &heap;
            scope.spawn(move || {
                for i in 0..200 {
                    let layout = Layout::from_size_align(8 + (thread * 31 + i) % 700, 8).unwrap();
                    let ptr = heap.allocate(layout).unwrap();
                    unsafe { ptr.as_ptr().write_bytes(0xEE, layout.size()) };
                    heap.free(ptr).unwrap();
                }
            });
        }
    });

    heap.collect();
    let report = heap.teardown().unwrap();
    assert!(report.is_clean());
}
