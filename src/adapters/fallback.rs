//! Primary-plus-rescue composition

use core::ptr::NonNull;

use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::{ComposableAllocator, RawAllocator};

/// Tries a composable primary, falling back to a secondary on failure
///
/// The secondary is consulted only when the primary's `try_*` path returns
/// nothing. Deallocation is symmetric: the primary's `try_deallocate` runs
/// first, and a denial of ownership forwards the pointer to the secondary.
///
/// ```
/// use rawmem::adapters::FallbackAllocator;
/// use rawmem::lowlevel::HeapAllocator;
/// use rawmem::pool::{MemoryPool, NodePool};
/// use rawmem::RawAllocator;
///
/// let pool = MemoryPool::<NodePool>::new(
///     32,
///     MemoryPool::<NodePool>::min_block_size(32, 16),
/// ).unwrap();
/// let alloc = FallbackAllocator::new(pool, HeapAllocator::new());
///
/// // Pool-sized requests hit the pool; anything else lands on the heap.
/// let node = alloc.allocate_node(32, 8).unwrap();
/// unsafe { alloc.deallocate_node(node, 32, 8) };
/// ```
#[derive(Debug)]
pub struct FallbackAllocator<P: ComposableAllocator, S: RawAllocator> {
    primary: P,
    secondary: S,
}

impl<P: ComposableAllocator, S: RawAllocator> FallbackAllocator<P, S> {
    /// Combines `primary` with the rescue allocator `secondary`
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    /// The primary allocator
    pub fn primary(&self) -> &P {
        &self.primary
    }

    /// The rescue allocator
    pub fn secondary(&self) -> &S {
        &self.secondary
    }

    /// Splits the composition apart again
    pub fn into_parts(self) -> (P, S) {
        (self.primary, self.secondary)
    }
}

// SAFETY: every pointer is issued by exactly one of the two allocators, and
// deallocation asks the primary for ownership before involving the
// secondary.
unsafe impl<P: ComposableAllocator, S: RawAllocator> RawAllocator for FallbackAllocator<P, S> {
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new("rawmem::FallbackAllocator", self)
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        match self.primary.try_allocate_node(size, alignment) {
            Some(ptr) => Ok(ptr),
            None => self.secondary.allocate_node(size, alignment),
        }
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: forwarded caller contract; ownership is established by
        // the primary's try path.
        unsafe {
            if !self.primary.try_deallocate_node(ptr, size, alignment) {
                self.secondary.deallocate_node(ptr, size, alignment);
            }
        }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        match self.primary.try_allocate_array(count, size, alignment) {
            Some(ptr) => Ok(ptr),
            None => self.secondary.allocate_array(count, size, alignment),
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
        unsafe {
            if !self.primary.try_deallocate_array(ptr, count, size, alignment) {
                self.secondary.deallocate_array(ptr, count, size, alignment);
            }
        }
    }

    fn max_node_size(&self) -> usize {
        self.primary.max_node_size().max(self.secondary.max_node_size())
    }

    fn max_array_size(&self) -> usize {
        self.primary
            .max_array_size()
            .max(self.secondary.max_array_size())
    }

    fn max_alignment(&self) -> usize {
        self.primary
            .max_alignment()
            .min(self.secondary.max_alignment())
    }
}

// SAFETY: both branches are pure try paths when the secondary is
// composable too.
unsafe impl<P: ComposableAllocator, S: ComposableAllocator> ComposableAllocator
    for FallbackAllocator<P, S>
{
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.primary
            .try_allocate_node(size, alignment)
            .or_else(|| self.secondary.try_allocate_node(size, alignment))
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        self.primary
            .try_allocate_array(count, size, alignment)
            .or_else(|| self.secondary.try_allocate_array(count, size, alignment))
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.primary.try_deallocate_node(ptr, size, alignment)
                || self.secondary.try_deallocate_node(ptr, size, alignment)
        }
    }

    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.primary.try_deallocate_array(ptr, count, size, alignment)
                || self
                    .secondary
                    .try_deallocate_array(ptr, count, size, alignment)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::HeapAllocator;
    use crate::pool::{MemoryPool, NodePool};

    #[test]
    fn primary_preferred_until_exhausted() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 2)).unwrap();
        let alloc = FallbackAllocator::new(pool, HeapAllocator::new());

        let a = alloc.allocate_node(16, 8).unwrap();
        let b = alloc.allocate_node(16, 8).unwrap();
        // The pool is drained; the rescue serves the third request.
        let c = alloc.allocate_node(16, 8).unwrap();

        assert!(alloc.primary().owns(a.as_ptr()));
        assert!(alloc.primary().owns(b.as_ptr()));
        assert!(!alloc.primary().owns(c.as_ptr()));

        unsafe {
            alloc.deallocate_node(a, 16, 8);
            alloc.deallocate_node(b, 16, 8);
            alloc.deallocate_node(c, 16, 8);
        }
    }

    #[test]
    fn deallocation_routes_by_ownership() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 1)).unwrap();
        let alloc = FallbackAllocator::new(pool, HeapAllocator::new());

        let pooled = alloc.allocate_node(16, 8).unwrap();
        let rescued = alloc.allocate_node(16, 8).unwrap();

        unsafe {
            // Free the rescued pointer first; the pool denies ownership and
            // the heap takes it.
            alloc.deallocate_node(rescued, 16, 8);
            alloc.deallocate_node(pooled, 16, 8);
        }
        assert_eq!(alloc.primary().capacity_left(), 16);
    }
}
