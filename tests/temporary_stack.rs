//! Integration tests for the thread-local temporary stack

#![cfg(feature = "temporary")]

use rawmem::temporary::{TemporaryAllocator, TemporaryStackInitializer};
use rawmem::RawAllocator;

#[test]
fn scopes_release_their_allocations() {
    let _init = TemporaryStackInitializer::new(2048);

    let first_ptr = {
        let temp = TemporaryAllocator::new();
        let ptr = temp.allocate(512, 8).expect("allocation failed");
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x77, 512) };
        ptr.as_ptr() as usize
    };

    // The previous scope unwound; the same bytes serve the next scope.
    let temp = TemporaryAllocator::new();
    let ptr = temp.allocate(512, 8).expect("allocation failed");
    assert_eq!(ptr.as_ptr() as usize, first_ptr);
}

#[test]
fn nested_scopes_stack_lifo() {
    let _init = TemporaryStackInitializer::new(2048);

    let outer = TemporaryAllocator::new();
    let a = outer.allocate(64, 8).expect("outer allocation failed");

    {
        let inner = TemporaryAllocator::new();
        let b = inner.allocate(64, 8).expect("inner allocation failed");
        assert!(b.as_ptr() > a.as_ptr());

        let deepest = TemporaryAllocator::new();
        let c = deepest.allocate(64, 8).expect("deepest allocation failed");
        assert!(c.as_ptr() > b.as_ptr());
        // deepest drops, then inner: reverse construction order.
    }

    // The outer scope is the top again and may allocate.
    let d = outer.allocate(64, 8).expect("outer allocation failed");
    assert!(d.as_ptr() > a.as_ptr());
}

#[test]
fn works_through_the_raw_allocator_surface() {
    let _init = TemporaryStackInitializer::new(2048);

    let temp = TemporaryAllocator::new();
    let node = temp.allocate_node(128, 16).expect("allocation failed");
    assert_eq!(node.as_ptr() as usize % 16, 0);
    unsafe { temp.deallocate_node(node, 128, 16) };
}

#[test]
fn each_thread_gets_its_own_stack() {
    let _init = TemporaryStackInitializer::new(2048);
    let temp = TemporaryAllocator::new();
    let here = temp.allocate(64, 8).expect("allocation failed").as_ptr() as usize;

    let there = std::thread::spawn(|| {
        let temp = TemporaryAllocator::new();
        temp.allocate(64, 8).expect("allocation failed").as_ptr() as usize
    })
    .join()
    .expect("worker thread failed");

    assert_ne!(here, there);
}
