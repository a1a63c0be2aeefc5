//! Integration tests for the pool allocators

use rand::seq::SliceRandom;
use rawmem::pool::{ArrayPool, MemoryPool, NodePool, SmallNodePool};
use rawmem::{AllocError, RawAllocator};

#[test]
fn shuffled_deallocation_restores_capacity() {
    const NODE: usize = 8;
    const COUNT: usize = 25;

    let pool = MemoryPool::<NodePool>::new(
        NODE,
        MemoryPool::<NodePool>::min_block_size(NODE, COUNT),
    )
    .expect("failed to create pool");

    let mut nodes = Vec::new();
    for _ in 0..COUNT {
        nodes.push(pool.allocate_node(NODE, 8).expect("allocation failed"));
    }
    // The eagerly inserted first block covers all 25 nodes.
    assert_eq!(pool.block_count(), 1);

    nodes.shuffle(&mut rand::thread_rng());
    for node in nodes {
        unsafe { pool.deallocate_node(node, NODE, 8) };
    }

    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.capacity_left(), COUNT * NODE);
}

#[test]
fn allocation_past_capacity_grows_by_one_block() {
    const NODE: usize = 8;
    const COUNT: usize = 25;

    let pool = MemoryPool::<NodePool>::new(
        NODE,
        MemoryPool::<NodePool>::min_block_size(NODE, COUNT),
    )
    .expect("failed to create pool");

    let mut nodes = Vec::new();
    for _ in 0..COUNT {
        nodes.push(pool.allocate_node(NODE, 8).expect("allocation failed"));
    }
    assert_eq!(pool.block_count(), 1);

    // The 26th node does not fit the first block; the arena grows.
    let extra = pool.allocate_node(NODE, 8).expect("26th allocation failed");
    assert_eq!(pool.block_count(), 2);

    unsafe { pool.deallocate_node(extra, NODE, 8) };
    for node in nodes {
        unsafe { pool.deallocate_node(node, NODE, 8) };
    }
}

#[test]
fn nodes_do_not_overlap() {
    let pool = MemoryPool::<NodePool>::new(
        16,
        MemoryPool::<NodePool>::min_block_size(16, 32),
    )
    .expect("failed to create pool");

    let nodes: Vec<_> = (0..32)
        .map(|i| {
            let node = pool.allocate_node(16, 8).expect("allocation failed");
            unsafe { std::ptr::write_bytes(node.as_ptr(), i as u8, 16) };
            node
        })
        .collect();

    for (i, node) in nodes.iter().enumerate() {
        // Every node still carries its own fill: no overlap.
        let seen = unsafe { *node.as_ptr() };
        assert_eq!(seen, i as u8);
    }

    for node in nodes {
        unsafe { pool.deallocate_node(node, 16, 8) };
    }
}

#[test]
fn ordered_array_allocation_is_ascending_and_contiguous() {
    const NODE: usize = 16;

    let pool = MemoryPool::<ArrayPool>::new(
        NODE,
        MemoryPool::<ArrayPool>::min_block_size(NODE, 64),
    )
    .expect("failed to create pool");

    let single = pool.allocate_node(NODE, 8).expect("node failed");
    let run = pool.allocate_array(6, NODE, 8).expect("array failed");

    // The run is one contiguous region of 6 * NODE bytes.
    unsafe {
        std::ptr::write_bytes(run.as_ptr(), 0x42, 6 * NODE);
        assert_eq!(*run.as_ptr().add(6 * NODE - 1), 0x42);
    }

    // The ordered list serves the lowest run first, above the single node.
    assert!(run.as_ptr() > single.as_ptr());

    unsafe {
        pool.deallocate_array(run, 6, NODE, 8);
        pool.deallocate_node(single, NODE, 8);
    }
}

#[test]
fn array_request_on_node_pool_is_rejected() {
    let pool = MemoryPool::<NodePool>::new(
        16,
        MemoryPool::<NodePool>::min_block_size(16, 8),
    )
    .expect("failed to create pool");

    match pool.allocate_array(4, 16, 8) {
        Err(AllocError::BadArraySize { .. }) => {}
        other => panic!("expected BadArraySize, got {other:?}"),
    }
}

#[test]
fn small_pool_block_growth() {
    let pool = MemoryPool::<SmallNodePool>::new(
        4,
        MemoryPool::<SmallNodePool>::min_block_size(4, 128),
    )
    .expect("failed to create pool");

    let initial_capacity = pool.capacity_left() / pool.node_size();
    let mut nodes = Vec::new();
    for _ in 0..initial_capacity + 1 {
        nodes.push(pool.allocate_node(4, 1).expect("allocation failed"));
    }
    assert!(pool.block_count() >= 2, "arena must have grown");

    for node in nodes {
        unsafe { pool.deallocate_node(node, 4, 1) };
    }
}

#[test]
fn matched_pairs_leave_no_leak() {
    let pool = MemoryPool::<NodePool>::new(
        32,
        MemoryPool::<NodePool>::min_block_size(32, 16),
    )
    .expect("failed to create pool");
    let full = pool.capacity_left();

    for _ in 0..100 {
        let a = pool.allocate_node(32, 8).expect("allocation failed");
        let b = pool.allocate_node(32, 8).expect("allocation failed");
        unsafe {
            pool.deallocate_node(b, 32, 8);
            pool.deallocate_node(a, 32, 8);
        }
    }
    assert_eq!(pool.capacity_left(), full);
}
