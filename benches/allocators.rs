//! Allocator benchmarks
//!
//! Compares the allocation strategies against the system heap baseline.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rawmem::lowlevel::HeapAllocator;
use rawmem::pool::{Log2Buckets, MemoryPool, MemoryPoolCollection, NodePool};
use rawmem::stack::MemoryStack;
use rawmem::RawAllocator;
use std::hint::black_box;

/// Single allocation/deallocation cycle
fn bench_single_node(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_node");

    group.bench_function("pool_64b", |b| {
        let pool = MemoryPool::<NodePool>::new(
            64,
            MemoryPool::<NodePool>::min_block_size(64, 4096),
        )
        .unwrap();
        b.iter(|| {
            let ptr = pool.allocate_node(64, 8).unwrap();
            unsafe { pool.deallocate_node(ptr, 64, 8) };
            black_box(ptr);
        });
    });

    group.bench_function("collection_64b", |b| {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 256 * 1024).unwrap();
        b.iter(|| {
            let ptr = pool.allocate_node(64, 8).unwrap();
            unsafe { pool.deallocate_node(ptr, 64, 8) };
            black_box(ptr);
        });
    });

    group.bench_function("heap_64b", |b| {
        let heap = HeapAllocator::new();
        b.iter(|| {
            let ptr = heap.allocate_node(64, 8).unwrap();
            unsafe { heap.deallocate_node(ptr, 64, 8) };
            black_box(ptr);
        });
    });

    group.finish();
}

/// Burst of allocations released by a single unwind
fn bench_stack_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("stack_burst");

    for count in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("stack", count), &count, |b, &count| {
            let stack = MemoryStack::new(MemoryStack::<rawmem::block::GrowingBlockAllocator<rawmem::lowlevel::HeapAllocator>>::min_block_size(count * 128));
            b.iter(|| {
                let marker = stack.top();
                for _ in 0..count {
                    black_box(stack.allocate(64, 8).unwrap());
                }
                unsafe { stack.unwind(marker) };
            });
        });

        group.bench_with_input(BenchmarkId::new("heap", count), &count, |b, &count| {
            let heap = HeapAllocator::new();
            b.iter(|| {
                let mut ptrs = Vec::with_capacity(count);
                for _ in 0..count {
                    ptrs.push(heap.allocate_node(64, 8).unwrap());
                }
                for ptr in ptrs {
                    unsafe { heap.deallocate_node(ptr, 64, 8) };
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_node, bench_stack_burst);
criterion_main!(benches);
