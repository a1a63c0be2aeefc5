//! Allocation tracking through observer hooks
//!
//! A [`Tracker`] receives a callback on every allocation and deallocation
//! passing through a [`TrackedAllocator`]. A [`DeepTracker`] additionally
//! observes arena growth: [`TrackedBlockAllocator`] rebinds an arena's
//! block-allocator parameter so block traffic reaches the tracker too.
//!
//! [`StatsTracker`] is the stock tracker, counting operations and bytes
//! with atomics so one tracker can be shared by reference across several
//! tracked allocators.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{BlockAllocator, MemoryBlock};
use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::{ComposableAllocator, RawAllocator};

/// Observer of a tracked allocator's node and array traffic
///
/// Hooks run after a successful operation (or after a failure for
/// [`on_allocation_failure`](Tracker::on_allocation_failure)). They must not
/// allocate from the tracked allocator.
pub trait Tracker {
    /// A node of `size` bytes was issued
    fn on_node_allocation(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let _ = (ptr, size, alignment);
    }

    /// An array of `count` nodes was issued
    fn on_array_allocation(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        let _ = (ptr, count, size, alignment);
    }

    /// A node came back
    fn on_node_deallocation(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let _ = (ptr, size, alignment);
    }

    /// An array came back
    fn on_array_deallocation(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        let _ = (ptr, count, size, alignment);
    }

    /// An allocation raised instead of returning memory
    fn on_allocation_failure(&self, size: usize, alignment: usize) {
        let _ = (size, alignment);
    }
}

/// Tracker that also observes block-level arena traffic
pub trait DeepTracker: Tracker {
    /// The wrapped allocator grew by a block
    fn on_allocator_growth(&self, block: &MemoryBlock) {
        let _ = block;
    }

    /// The wrapped allocator released a block
    fn on_allocator_shrinking(&self, block: &MemoryBlock) {
        let _ = block;
    }
}

impl<T: Tracker + ?Sized> Tracker for &T {
    fn on_node_allocation(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        (**self).on_node_allocation(ptr, size, alignment)
    }

    fn on_array_allocation(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        (**self).on_array_allocation(ptr, count, size, alignment)
    }

    fn on_node_deallocation(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        (**self).on_node_deallocation(ptr, size, alignment)
    }

    fn on_array_deallocation(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize) {
        (**self).on_array_deallocation(ptr, count, size, alignment)
    }

    fn on_allocation_failure(&self, size: usize, alignment: usize) {
        (**self).on_allocation_failure(size, alignment)
    }
}

impl<T: DeepTracker + ?Sized> DeepTracker for &T {
    fn on_allocator_growth(&self, block: &MemoryBlock) {
        (**self).on_allocator_growth(block)
    }

    fn on_allocator_shrinking(&self, block: &MemoryBlock) {
        (**self).on_allocator_shrinking(block)
    }
}

/// Raw allocator forwarding every call to its tracker
///
/// ```
/// use rawmem::adapters::{StatsTracker, TrackedAllocator};
/// use rawmem::lowlevel::HeapAllocator;
/// use rawmem::RawAllocator;
///
/// let stats = StatsTracker::new();
/// let alloc = TrackedAllocator::new(HeapAllocator::new(), &stats);
///
/// let node = alloc.allocate_node(64, 8).unwrap();
/// unsafe { alloc.deallocate_node(node, 64, 8) };
/// assert_eq!(stats.snapshot().node_allocations, 1);
/// ```
#[derive(Debug)]
pub struct TrackedAllocator<A: RawAllocator, T: Tracker> {
    alloc: A,
    tracker: T,
}

impl<A: RawAllocator, T: Tracker> TrackedAllocator<A, T> {
    /// Wraps `alloc` with `tracker`
    pub fn new(alloc: A, tracker: T) -> Self {
        Self { alloc, tracker }
    }

    /// The wrapped allocator
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The tracker
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Splits the wrapper apart again
    pub fn into_parts(self) -> (A, T) {
        (self.alloc, self.tracker)
    }
}

// SAFETY: pure forwarding; the hooks observe but never touch the memory.
unsafe impl<A: RawAllocator, T: Tracker> RawAllocator for TrackedAllocator<A, T> {
    fn info(&self) -> AllocatorInfo {
        self.alloc.info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        match self.alloc.allocate_node(size, alignment) {
            Ok(ptr) => {
                self.tracker.on_node_allocation(ptr, size, alignment);
                Ok(ptr)
            }
            Err(err) => {
                self.tracker.on_allocation_failure(size, alignment);
                Err(err)
            }
        }
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.alloc.deallocate_node(ptr, size, alignment) };
        self.tracker.on_node_deallocation(ptr, size, alignment);
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        match self.alloc.allocate_array(count, size, alignment) {
            Ok(ptr) => {
                self.tracker.on_array_allocation(ptr, count, size, alignment);
                Ok(ptr)
            }
            Err(err) => {
                self.tracker.on_allocation_failure(count * size, alignment);
                Err(err)
            }
        }
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe { self.alloc.deallocate_array(ptr, count, size, alignment) };
        self.tracker.on_array_deallocation(ptr, count, size, alignment);
    }

    fn max_node_size(&self) -> usize {
        self.alloc.max_node_size()
    }

    fn max_array_size(&self) -> usize {
        self.alloc.max_array_size()
    }

    fn max_alignment(&self) -> usize {
        self.alloc.max_alignment()
    }
}

// SAFETY: pure forwarding of the try paths; hooks fire only on success.
unsafe impl<A: ComposableAllocator, T: Tracker> ComposableAllocator for TrackedAllocator<A, T> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc.try_allocate_node(size, alignment)?;
        self.tracker.on_node_allocation(ptr, size, alignment);
        Some(ptr)
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = self.alloc.try_allocate_array(count, size, alignment)?;
        self.tracker.on_array_allocation(ptr, count, size, alignment);
        Some(ptr)
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        // SAFETY: forwarded caller contract.
        let done = unsafe { self.alloc.try_deallocate_node(ptr, size, alignment) };
        if done {
            self.tracker.on_node_deallocation(ptr, size, alignment);
        }
        done
    }

    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool {
        // SAFETY: forwarded caller contract.
        let done = unsafe { self.alloc.try_deallocate_array(ptr, count, size, alignment) };
        if done {
            self.tracker.on_array_deallocation(ptr, count, size, alignment);
        }
        done
    }
}

/// Block allocator decorator feeding a [`DeepTracker`]
///
/// Deep tracking is a builder transformation: construct the arena-backed
/// allocator over `TrackedBlockAllocator::new(block_alloc, tracker)` and
/// wrap it in a [`TrackedAllocator`] with the same tracker, typically a
/// shared reference to one [`StatsTracker`].
#[derive(Debug)]
pub struct TrackedBlockAllocator<B: BlockAllocator, T: DeepTracker> {
    block_alloc: B,
    tracker: T,
}

impl<B: BlockAllocator, T: DeepTracker> TrackedBlockAllocator<B, T> {
    /// Decorates `block_alloc` with `tracker`
    pub fn new(block_alloc: B, tracker: T) -> Self {
        Self {
            block_alloc,
            tracker,
        }
    }
}

// SAFETY: pure forwarding around the inner block allocator.
unsafe impl<B: BlockAllocator, T: DeepTracker> BlockAllocator for TrackedBlockAllocator<B, T> {
    fn allocate_block(&mut self) -> AllocResult<MemoryBlock> {
        let block = self.block_alloc.allocate_block()?;
        self.tracker.on_allocator_growth(&block);
        Ok(block)
    }

    unsafe fn deallocate_block(&mut self, block: MemoryBlock) {
        self.tracker.on_allocator_shrinking(&block);
        // SAFETY: forwarded caller contract.
        unsafe { self.block_alloc.deallocate_block(block) };
    }

    fn next_block_size(&self) -> usize {
        self.block_alloc.next_block_size()
    }
}

// ============================================================================
// Stock tracker
// ============================================================================

/// Counter snapshot taken from a [`StatsTracker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Nodes issued
    pub node_allocations: usize,
    /// Arrays issued
    pub array_allocations: usize,
    /// Nodes returned
    pub node_deallocations: usize,
    /// Arrays returned
    pub array_deallocations: usize,
    /// Allocations that raised
    pub failed_allocations: usize,
    /// Bytes currently out
    pub allocated_bytes: usize,
    /// High-water mark of `allocated_bytes`
    pub peak_allocated_bytes: usize,
    /// Blocks the arena acquired
    pub blocks_allocated: usize,
    /// Blocks the arena released
    pub blocks_deallocated: usize,
}

impl AllocatorStats {
    /// Allocations minus deallocations, node and array combined
    pub fn outstanding(&self) -> usize {
        (self.node_allocations + self.array_allocations)
            .saturating_sub(self.node_deallocations + self.array_deallocations)
    }
}

/// Atomic counters implementing [`Tracker`] and [`DeepTracker`]
///
/// Shareable by reference: `TrackedAllocator::new(alloc, &stats)` lets one
/// tracker observe several allocators.
#[derive(Debug, Default)]
pub struct StatsTracker {
    node_allocations: AtomicUsize,
    array_allocations: AtomicUsize,
    node_deallocations: AtomicUsize,
    array_deallocations: AtomicUsize,
    failed_allocations: AtomicUsize,
    allocated_bytes: AtomicUsize,
    peak_allocated_bytes: AtomicUsize,
    blocks_allocated: AtomicUsize,
    blocks_deallocated: AtomicUsize,
}

impl StatsTracker {
    /// Creates a tracker with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counter values
    pub fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            node_allocations: self.node_allocations.load(Ordering::Relaxed),
            array_allocations: self.array_allocations.load(Ordering::Relaxed),
            node_deallocations: self.node_deallocations.load(Ordering::Relaxed),
            array_deallocations: self.array_deallocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            peak_allocated_bytes: self.peak_allocated_bytes.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_deallocated: self.blocks_deallocated.load(Ordering::Relaxed),
        }
    }

    /// Resets every counter to zero
    pub fn reset(&self) {
        self.node_allocations.store(0, Ordering::Relaxed);
        self.array_allocations.store(0, Ordering::Relaxed);
        self.node_deallocations.store(0, Ordering::Relaxed);
        self.array_deallocations.store(0, Ordering::Relaxed);
        self.failed_allocations.store(0, Ordering::Relaxed);
        self.allocated_bytes.store(0, Ordering::Relaxed);
        self.peak_allocated_bytes.store(0, Ordering::Relaxed);
        self.blocks_allocated.store(0, Ordering::Relaxed);
        self.blocks_deallocated.store(0, Ordering::Relaxed);
    }

    fn add_bytes(&self, bytes: usize) {
        let now = self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let mut peak = self.peak_allocated_bytes.load(Ordering::Relaxed);
        while now > peak {
            match self.peak_allocated_bytes.compare_exchange_weak(
                peak,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }

    fn sub_bytes(&self, bytes: usize) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

impl Tracker for StatsTracker {
    fn on_node_allocation(&self, _ptr: NonNull<u8>, size: usize, _alignment: usize) {
        self.node_allocations.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(size);
    }

    fn on_array_allocation(&self, _ptr: NonNull<u8>, count: usize, size: usize, _alignment: usize) {
        self.array_allocations.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(count * size);
    }

    fn on_node_deallocation(&self, _ptr: NonNull<u8>, size: usize, _alignment: usize) {
        self.node_deallocations.fetch_add(1, Ordering::Relaxed);
        self.sub_bytes(size);
    }

    fn on_array_deallocation(
        &self,
        _ptr: NonNull<u8>,
        count: usize,
        size: usize,
        _alignment: usize,
    ) {
        self.array_deallocations.fetch_add(1, Ordering::Relaxed);
        self.sub_bytes(count * size);
    }

    fn on_allocation_failure(&self, _size: usize, _alignment: usize) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }
}

impl DeepTracker for StatsTracker {
    fn on_allocator_growth(&self, _block: &MemoryBlock) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn on_allocator_shrinking(&self, _block: &MemoryBlock) {
        self.blocks_deallocated.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GrowingBlockAllocator;
    use crate::lowlevel::HeapAllocator;
    use crate::pool::{MemoryPool, NodePool};

    #[test]
    fn counts_nodes_and_bytes() {
        let stats = StatsTracker::new();
        let alloc = TrackedAllocator::new(HeapAllocator::new(), &stats);

        let a = alloc.allocate_node(64, 8).unwrap();
        let b = alloc.allocate_node(32, 8).unwrap();
        assert_eq!(stats.snapshot().allocated_bytes, 96);
        assert_eq!(stats.snapshot().peak_allocated_bytes, 96);

        unsafe {
            alloc.deallocate_node(a, 64, 8);
            alloc.deallocate_node(b, 32, 8);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.allocated_bytes, 0);
        assert_eq!(snap.peak_allocated_bytes, 96);
        assert_eq!(snap.outstanding(), 0);
    }

    #[test]
    fn counts_failures() {
        let stats = StatsTracker::new();
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 4)).unwrap();
        let alloc = TrackedAllocator::new(pool, &stats);

        assert!(alloc.allocate_node(1024, 8).is_err());
        assert_eq!(stats.snapshot().failed_allocations, 1);
    }

    #[test]
    fn deep_tracking_sees_arena_growth() {
        let stats = StatsTracker::new();
        let pool = MemoryPool::<NodePool, _>::with_block_allocator(
            16,
            TrackedBlockAllocator::new(
                GrowingBlockAllocator::new(MemoryPool::<NodePool>::min_block_size(16, 4)),
                &stats,
            ),
        )
        .unwrap();
        let alloc = TrackedAllocator::new(pool, &stats);

        // The eager first block already fired the growth hook.
        assert_eq!(stats.snapshot().blocks_allocated, 1);

        let mut nodes = Vec::new();
        for _ in 0..8 {
            nodes.push(alloc.allocate_node(16, 8).unwrap());
        }
        assert!(stats.snapshot().blocks_allocated >= 2);

        for node in nodes {
            unsafe { alloc.deallocate_node(node, 16, 8) };
        }
        assert_eq!(stats.snapshot().outstanding(), 0);
    }
}
