//! Minimum-alignment forwarder

use core::ptr::NonNull;

use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::{ComposableAllocator, RawAllocator};

/// Forwards every call with the alignment raised to a stored minimum
///
/// Useful to give cache-line or SIMD alignment to an allocator-agnostic
/// consumer without touching its requests.
#[derive(Debug)]
pub struct AlignedAllocator<A: RawAllocator> {
    alloc: A,
    min_alignment: usize,
}

impl<A: RawAllocator> AlignedAllocator<A> {
    /// Wraps `alloc`, raising every request to at least `min_alignment`
    ///
    /// # Panics
    /// When `min_alignment` is not a power of two.
    pub fn new(alloc: A, min_alignment: usize) -> Self {
        assert!(
            crate::utils::is_power_of_two(min_alignment),
            "alignment must be a power of two"
        );
        Self {
            alloc,
            min_alignment,
        }
    }

    /// The enforced minimum alignment
    pub fn min_alignment(&self) -> usize {
        self.min_alignment
    }

    /// The wrapped allocator
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Consumes the adapter and returns the allocator
    pub fn into_inner(self) -> A {
        self.alloc
    }

    #[inline]
    fn raise(&self, alignment: usize) -> usize {
        alignment.max(self.min_alignment)
    }
}

// SAFETY: forwarding with a raised alignment can only strengthen the
// wrapped allocator's guarantees.
unsafe impl<A: RawAllocator> RawAllocator for AlignedAllocator<A> {
    fn info(&self) -> AllocatorInfo {
        self.alloc.info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.alloc.allocate_node(size, self.raise(alignment))
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: forwarded caller contract; the raised alignment matches
        // the allocation call.
        unsafe { self.alloc.deallocate_node(ptr, size, self.raise(alignment)) }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        self.alloc.allocate_array(count, size, self.raise(alignment))
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
            self.alloc
                .deallocate_array(ptr, count, size, self.raise(alignment))
        }
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

// SAFETY: pure forwarding of the try paths with a raised alignment.
unsafe impl<A: ComposableAllocator> ComposableAllocator for AlignedAllocator<A> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.alloc.try_allocate_node(size, self.raise(alignment))
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        self.alloc
            .try_allocate_array(count, size, self.raise(alignment))
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.alloc
                .try_deallocate_node(ptr, size, self.raise(alignment))
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
            self.alloc
                .try_deallocate_array(ptr, count, size, self.raise(alignment))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::HeapAllocator;

    #[test]
    fn raises_alignment() {
        let aligned = AlignedAllocator::new(HeapAllocator::new(), 16);
        let ptr = aligned.allocate_node(10, 1).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { aligned.deallocate_node(ptr, 10, 1) };
    }

    #[test]
    fn keeps_stricter_requests() {
        let aligned = AlignedAllocator::new(HeapAllocator::new(), 2);
        let ptr = aligned.allocate_node(8, 8).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        unsafe { aligned.deallocate_node(ptr, 8, 8) };
    }
}
