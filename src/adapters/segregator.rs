//! Size-based routing across a chain of allocators

use core::ptr::NonNull;

use crate::error::{AllocError, AllocResult, AllocatorInfo};
use crate::traits::RawAllocator;

/// An allocator bundled with the predicate deciding which requests it takes
pub trait Segregatable {
    /// The bundled allocator
    type Allocator: RawAllocator;

    /// The bundled allocator
    fn allocator(&self) -> &Self::Allocator;

    /// Whether this link services the node request
    fn use_allocate_node(&self, size: usize, alignment: usize) -> bool;

    /// Whether this link services the array request
    fn use_allocate_array(&self, count: usize, size: usize, alignment: usize) -> bool;
}

/// Segregatable routing requests of at most `threshold` bytes
#[derive(Debug)]
pub struct ThresholdSegregatable<A: RawAllocator> {
    threshold: usize,
    alloc: A,
}

impl<A: RawAllocator> ThresholdSegregatable<A> {
    /// Routes `size <= threshold` (and `count * size <= threshold`) to
    /// `alloc`
    pub fn new(threshold: usize, alloc: A) -> Self {
        Self { threshold, alloc }
    }

    /// The routing threshold in bytes
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl<A: RawAllocator> Segregatable for ThresholdSegregatable<A> {
    type Allocator = A;

    fn allocator(&self) -> &A {
        &self.alloc
    }

    fn use_allocate_node(&self, size: usize, _alignment: usize) -> bool {
        size <= self.threshold
    }

    fn use_allocate_array(&self, count: usize, size: usize, _alignment: usize) -> bool {
        count
            .checked_mul(size)
            .is_some_and(|total| total <= self.threshold)
    }
}

/// Routing link: requests matching the segregatable go to its allocator,
/// everything else recurses into the tail
///
/// Tails chain: a `Segregator` whose tail is another `Segregator` forms a
/// multi-way split, terminated by a plain allocator or [`NullAllocator`].
/// Routing is deterministic, so deallocation retraces the same path.
///
/// ```
/// use rawmem::adapters::{Segregator, ThresholdSegregatable};
/// use rawmem::lowlevel::HeapAllocator;
/// use rawmem::pool::{MemoryPool, NodePool};
/// use rawmem::RawAllocator;
///
/// let pool = MemoryPool::<NodePool>::new(
///     8,
///     MemoryPool::<NodePool>::min_block_size(8, 32),
/// ).unwrap();
/// let alloc = Segregator::new(
///     ThresholdSegregatable::new(8, pool),
///     HeapAllocator::new(),
/// );
///
/// let small = alloc.allocate_node(8, 8).unwrap();  // pool
/// let large = alloc.allocate_node(64, 8).unwrap(); // heap
/// unsafe {
///     alloc.deallocate_node(small, 8, 8);
///     alloc.deallocate_node(large, 64, 8);
/// }
/// ```
#[derive(Debug)]
pub struct Segregator<S: Segregatable, Tail: RawAllocator> {
    segregatable: S,
    tail: Tail,
}

impl<S: Segregatable, Tail: RawAllocator> Segregator<S, Tail> {
    /// Chains `segregatable` in front of `tail`
    pub fn new(segregatable: S, tail: Tail) -> Self {
        Self { segregatable, tail }
    }

    /// The first link's segregatable
    pub fn segregatable(&self) -> &S {
        &self.segregatable
    }

    /// The rest of the chain
    pub fn tail(&self) -> &Tail {
        &self.tail
    }
}

// SAFETY: the predicate is deterministic in (count, size, alignment), so
// every pointer is deallocated by the allocator that issued it.
unsafe impl<S: Segregatable, Tail: RawAllocator> RawAllocator for Segregator<S, Tail> {
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new("rawmem::Segregator", self)
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        if self.segregatable.use_allocate_node(size, alignment) {
            self.segregatable.allocator().allocate_node(size, alignment)
        } else {
            self.tail.allocate_node(size, alignment)
        }
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: forwarded caller contract; routing repeats the allocation
        // decision.
        unsafe {
            if self.segregatable.use_allocate_node(size, alignment) {
                self.segregatable
                    .allocator()
                    .deallocate_node(ptr, size, alignment)
            } else {
                self.tail.deallocate_node(ptr, size, alignment)
            }
        }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        if self.segregatable.use_allocate_array(count, size, alignment) {
            self.segregatable
                .allocator()
                .allocate_array(count, size, alignment)
        } else {
            self.tail.allocate_array(count, size, alignment)
        }
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // SAFETY: forwarded caller contract; routing repeats the allocation
        // decision.
        unsafe {
            if self.segregatable.use_allocate_array(count, size, alignment) {
                self.segregatable
                    .allocator()
                    .deallocate_array(ptr, count, size, alignment)
            } else {
                self.tail.deallocate_array(ptr, count, size, alignment)
            }
        }
    }

    fn max_node_size(&self) -> usize {
        self.segregatable
            .allocator()
            .max_node_size()
            .max(self.tail.max_node_size())
    }

    fn max_array_size(&self) -> usize {
        self.segregatable
            .allocator()
            .max_array_size()
            .max(self.tail.max_array_size())
    }

    fn max_alignment(&self) -> usize {
        self.segregatable
            .allocator()
            .max_alignment()
            .min(self.tail.max_alignment())
    }
}

/// Terminal chain link that refuses every request
///
/// Ends a segregator chain when no catch-all allocator is wanted: requests
/// falling through the chain raise `OutOfMemory` here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullAllocator;

impl NullAllocator {
    /// Creates the allocator; a zero-cost operation
    pub const fn new() -> Self {
        NullAllocator
    }
}

// SAFETY: never hands out memory, so there is nothing to get wrong.
unsafe impl RawAllocator for NullAllocator {
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::stateless("rawmem::NullAllocator")
    }

    fn allocate_node(&self, size: usize, _alignment: usize) -> AllocResult<NonNull<u8>> {
        Err(AllocError::OutOfMemory {
            info: self.info(),
            requested: size,
        })
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, _size: usize, _alignment: usize) {
        debug_assert!(
            false,
            "null allocator never issued {ptr:?}; deallocation is a routing bug"
        );
    }

    fn max_node_size(&self) -> usize {
        0
    }

    fn max_array_size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::HeapAllocator;
    use crate::pool::{MemoryPool, NodePool};

    #[test]
    fn threshold_predicate() {
        let seg = ThresholdSegregatable::new(8, HeapAllocator::new());
        assert!(seg.use_allocate_node(1, 1));
        assert!(seg.use_allocate_node(8, 8));
        assert!(!seg.use_allocate_node(9, 8));
        assert!(seg.use_allocate_array(2, 4, 4));
        assert!(!seg.use_allocate_array(3, 4, 4));
        assert!(!seg.use_allocate_array(usize::MAX, 2, 1));
    }

    #[test]
    fn routes_by_size() {
        let pool =
            MemoryPool::<NodePool>::new(8, MemoryPool::<NodePool>::min_block_size(8, 16)).unwrap();
        let alloc = Segregator::new(ThresholdSegregatable::new(8, pool), HeapAllocator::new());

        let small = alloc.allocate_node(8, 8).unwrap();
        let large = alloc.allocate_node(64, 8).unwrap();
        assert!(alloc.segregatable().allocator().owns(small.as_ptr()));
        assert!(!alloc.segregatable().allocator().owns(large.as_ptr()));

        unsafe {
            alloc.deallocate_node(small, 8, 8);
            alloc.deallocate_node(large, 64, 8);
        }
    }

    #[test]
    fn routing_is_idempotent() {
        let seg = ThresholdSegregatable::new(16, HeapAllocator::new());
        for size in [1usize, 8, 16, 17, 64] {
            let first = seg.use_allocate_node(size, 8);
            for _ in 0..3 {
                assert_eq!(seg.use_allocate_node(size, 8), first);
            }
        }
    }

    #[test]
    fn null_allocator_always_fails() {
        let null = NullAllocator::new();
        assert!(matches!(
            null.allocate_node(1, 1),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert_eq!(null.max_node_size(), 0);
    }

    #[test]
    fn chains_terminate_in_null() {
        let pool =
            MemoryPool::<NodePool>::new(8, MemoryPool::<NodePool>::min_block_size(8, 4)).unwrap();
        let alloc = Segregator::new(ThresholdSegregatable::new(8, pool), NullAllocator::new());

        let node = alloc.allocate_node(8, 8).unwrap();
        assert!(matches!(
            alloc.allocate_node(9, 8),
            Err(AllocError::OutOfMemory { .. })
        ));
        unsafe { alloc.deallocate_node(node, 8, 8) };
    }
}
