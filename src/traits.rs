//! The raw allocator contract
//!
//! A *raw allocator* hands out uninitialized byte regions with explicit size
//! and alignment, decoupled from object construction. The surface splits
//! *node* allocations (a single region) from *array* allocations (a run of
//! `count` consecutive nodes freed together), because pooled allocators treat
//! the two very differently.
//!
//! A [`ComposableAllocator`] additionally exposes `try_*` shapes used by the
//! composition adapters: a failed try returns `None`/`false` without side
//! effects and never raises. The raising shape is exactly `try_* else raise`;
//! both produce the same state transition on success.

use core::ptr::NonNull;

use crate::error::{AllocResult, AllocatorInfo};
use crate::utils::MAX_ALIGNMENT;

/// Raw memory allocator handing out uninitialized byte regions
///
/// Single-threaded cores (stack, pools, joint) implement this behind `&self`
/// with interior mutability; they are `Send` but not `Sync`. Wrap them in
/// [`LockedAllocator`](crate::adapters::LockedAllocator) for shared use.
///
/// # Safety
///
/// Implementors must ensure that:
/// - a successful `allocate_node(size, align)` returns a pointer aligned to
///   `align` whose `size` bytes do not overlap any other outstanding
///   allocation
/// - requests within the advertised maxima either succeed or raise; they are
///   never silently truncated
/// - deallocation with the original `(size, alignment)` restores the
///   allocator's prior capacity
pub unsafe trait RawAllocator {
    /// Identity used in error reports and debug handlers
    fn info(&self) -> AllocatorInfo
    where
        Self: Sized,
    {
        AllocatorInfo::new(core::any::type_name::<Self>(), self)
    }

    /// Allocates a single region of `size` bytes aligned to `alignment`
    ///
    /// # Errors
    /// Raises `OutOfMemory`/`OutOfFixedMemory` on exhaustion and
    /// `BadNodeSize`/`BadAlignment` when the request exceeds the advertised
    /// maxima.
    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>>;

    /// Deallocates a node previously returned by [`allocate_node`]
    ///
    /// # Safety
    /// - `ptr` must have been returned by this allocator's `allocate_node`
    ///   with the same `size` and `alignment`
    /// - `ptr` must not be used afterwards; double-free is undefined behavior
    ///
    /// [`allocate_node`]: RawAllocator::allocate_node
    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize);

    /// Allocates `count` consecutive nodes of `size` bytes each
    ///
    /// The default forwards to [`allocate_node`] with the total size, which
    /// is correct for every allocator without node granularity.
    ///
    /// [`allocate_node`]: RawAllocator::allocate_node
    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>>
    where
        Self: Sized,
    {
        let total =
            crate::error::check_array_request(self.info(), count, size, alignment, self.max_array_size(), self.max_alignment())?;
        self.allocate_node(total, alignment)
    }

    /// Deallocates an array previously returned by [`allocate_array`]
    ///
    /// # Safety
    /// Same contract as [`deallocate_node`], with matching `count`.
    ///
    /// [`allocate_array`]: RawAllocator::allocate_array
    /// [`deallocate_node`]: RawAllocator::deallocate_node
    unsafe fn deallocate_array(&self, ptr: NonNull<u8>, count: usize, size: usize, alignment: usize)
    where
        Self: Sized,
    {
        unsafe { self.deallocate_node(ptr, count * size, alignment) }
    }

    /// Maximum size of a single node
    fn max_node_size(&self) -> usize {
        isize::MAX as usize
    }

    /// Maximum total size of an array
    fn max_array_size(&self) -> usize {
        self.max_node_size()
    }

    /// Maximum supported alignment
    fn max_alignment(&self) -> usize {
        MAX_ALIGNMENT
    }
}

/// Allocator whose failure paths are pure, usable in composition
///
/// # Safety
/// In addition to the [`RawAllocator`] contract:
/// - `try_allocate_*` never raises or aborts; a failure returns `None` and
///   leaves the allocator unchanged
/// - `try_deallocate_*` returns `false` without side effects when the pointer
///   was not issued by this allocator
pub unsafe trait ComposableAllocator: RawAllocator {
    /// Like [`RawAllocator::allocate_node`], returning `None` on failure
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Like [`RawAllocator::allocate_array`], returning `None` on failure
    fn try_allocate_array(&self, count: usize, size: usize, alignment: usize)
        -> Option<NonNull<u8>>;

    /// Deallocates `ptr` if it was issued by this allocator
    ///
    /// # Safety
    /// `ptr` must be a live allocation of `(size, alignment)` issued by
    /// *some* allocator; this allocator only touches it after establishing
    /// ownership.
    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool;

    /// Array variant of [`try_deallocate_node`]
    ///
    /// # Safety
    /// Same contract as [`try_deallocate_node`].
    ///
    /// [`try_deallocate_node`]: ComposableAllocator::try_deallocate_node
    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool;
}

/// Marker for allocators that are safe to share between threads as-is
///
/// Stateless allocators are trivially thread-safe; stateful ones qualify only
/// when every operation is internally synchronized.
pub trait ThreadSafeAllocator: RawAllocator + Send + Sync {}

// ============================================================================
// Blanket implementations for references and smart pointers
// ============================================================================

// SAFETY: forwarding preserves the implementor's guarantees.
unsafe impl<A: RawAllocator> RawAllocator for &A {
    fn info(&self) -> AllocatorInfo {
        (**self).info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        (**self).allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        unsafe { (**self).deallocate_node(ptr, size, alignment) }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        (**self).allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        unsafe { (**self).deallocate_array(ptr, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        (**self).max_node_size()
    }

    fn max_array_size(&self) -> usize {
        (**self).max_array_size()
    }

    fn max_alignment(&self) -> usize {
        (**self).max_alignment()
    }
}

// SAFETY: forwarding preserves the implementor's guarantees.
unsafe impl<A: ComposableAllocator> ComposableAllocator for &A {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        (**self).try_allocate_node(size, alignment)
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        (**self).try_allocate_array(count, size, alignment)
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        unsafe { (**self).try_deallocate_node(ptr, size, alignment) }
    }

    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool {
        unsafe { (**self).try_deallocate_array(ptr, count, size, alignment) }
    }
}

macro_rules! forward_raw_allocator_for_smart_ptr {
    ($($ptr:tt)*) => {
        // SAFETY: forwarding preserves the implementor's guarantees.
        unsafe impl<A: RawAllocator> RawAllocator for $($ptr)*<A> {
            fn info(&self) -> AllocatorInfo {
                (**self).info()
            }

            fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
                (**self).allocate_node(size, alignment)
            }

            unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
                unsafe { (**self).deallocate_node(ptr, size, alignment) }
            }

            fn allocate_array(
                &self,
                count: usize,
                size: usize,
                alignment: usize,
            ) -> AllocResult<NonNull<u8>> {
                (**self).allocate_array(count, size, alignment)
            }

            unsafe fn deallocate_array(
                &self,
                ptr: NonNull<u8>,
                count: usize,
                size: usize,
                alignment: usize,
            ) {
                unsafe { (**self).deallocate_array(ptr, count, size, alignment) }
            }

            fn max_node_size(&self) -> usize {
                (**self).max_node_size()
            }

            fn max_array_size(&self) -> usize {
                (**self).max_array_size()
            }

            fn max_alignment(&self) -> usize {
                (**self).max_alignment()
            }
        }
    };
}

forward_raw_allocator_for_smart_ptr!(std::rc::Rc);
forward_raw_allocator_for_smart_ptr!(std::sync::Arc);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::HeapAllocator;

    #[test]
    fn reference_forwarding() {
        let heap = HeapAllocator;
        let by_ref = &heap;

        let ptr = by_ref.allocate_node(64, 8).unwrap();
        unsafe { by_ref.deallocate_node(ptr, 64, 8) };
        assert_eq!(by_ref.max_alignment(), heap.max_alignment());
    }

    #[test]
    fn smart_pointer_forwarding() {
        let heap = std::sync::Arc::new(HeapAllocator);
        let ptr = heap.allocate_node(32, 8).unwrap();
        unsafe { heap.deallocate_node(ptr, 32, 8) };
    }
}
