//! Value-typed face over a raw allocator
//!
//! [`TypedAllocator`] turns any raw allocator into an allocator of `T`
//! values, splitting the container-style `allocate(n)` call into the node
//! primitive for `n == 1` and the array primitive otherwise. It allocates
//! and frees raw, properly typed memory; constructing values in it stays
//! the caller's business.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::RawAllocator;

/// Typed wrapper dispatching node vs array calls at count 1
///
/// Propagation behavior for container frameworks is exposed as associated
/// constants; raw allocators propagate on every container operation by
/// default.
///
/// ```
/// use rawmem::adapters::TypedAllocator;
/// use rawmem::lowlevel::HeapAllocator;
///
/// let alloc = TypedAllocator::<u64, _>::new(HeapAllocator::new());
/// let array = alloc.allocate(16).unwrap();
/// unsafe { alloc.deallocate(array, 16) };
/// ```
#[derive(Debug)]
pub struct TypedAllocator<T, A: RawAllocator> {
    alloc: A,
    _marker: PhantomData<fn() -> T>,
}

impl<T, A: RawAllocator> TypedAllocator<T, A> {
    /// Whether containers should carry the allocator along on move
    /// assignment
    pub const PROPAGATE_ON_MOVE_ASSIGNMENT: bool = true;
    /// Whether containers should carry the allocator along on copy
    /// assignment
    pub const PROPAGATE_ON_COPY_ASSIGNMENT: bool = true;
    /// Whether containers should swap allocators when they swap contents
    pub const PROPAGATE_ON_SWAP: bool = true;

    /// Wraps `alloc` for allocations of `T`
    pub fn new(alloc: A) -> Self {
        assert!(core::mem::size_of::<T>() > 0, "zero-sized types need no allocator");
        Self {
            alloc,
            _marker: PhantomData,
        }
    }

    /// The wrapped raw allocator
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Consumes the adapter and returns the allocator
    pub fn into_inner(self) -> A {
        self.alloc
    }

    /// Allocates memory for `n` values of `T`
    ///
    /// A single value uses the node path, everything else the array path.
    pub fn allocate(&self, n: usize) -> AllocResult<NonNull<T>> {
        let size = core::mem::size_of::<T>();
        let alignment = core::mem::align_of::<T>();
        let raw = if n == 1 {
            self.alloc.allocate_node(size, alignment)?
        } else {
            self.alloc.allocate_array(n, size, alignment)?
        };
        Ok(raw.cast())
    }

    /// Returns memory obtained from [`allocate`](TypedAllocator::allocate)
    /// with the same `n`
    ///
    /// # Safety
    /// `ptr` must come from this adapter's `allocate(n)` and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let size = core::mem::size_of::<T>();
        let alignment = core::mem::align_of::<T>();
        // SAFETY: forwarded caller contract; the path mirrors allocate.
        unsafe {
            if n == 1 {
                self.alloc.deallocate_node(ptr.cast(), size, alignment)
            } else {
                self.alloc.deallocate_array(ptr.cast(), n, size, alignment)
            }
        }
    }

    /// Largest `n` a single [`allocate`](TypedAllocator::allocate) call can
    /// request
    pub fn max_count(&self) -> usize {
        self.alloc.max_array_size() / core::mem::size_of::<T>()
    }

    /// Identity of the wrapped allocator
    pub fn info(&self) -> AllocatorInfo {
        self.alloc.info()
    }
}

impl<T, A: RawAllocator + Clone> Clone for TypedAllocator<T, A> {
    fn clone(&self) -> Self {
        Self {
            alloc: self.alloc.clone(),
            _marker: PhantomData,
        }
    }
}

/// Stateless allocators compare equal; stateful ones delegate to the
/// wrapped comparison (reference storages compare addresses).
impl<T, A: RawAllocator + PartialEq> PartialEq for TypedAllocator<T, A> {
    fn eq(&self, other: &Self) -> bool {
        self.alloc == other.alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::HeapAllocator;
    use crate::pool::{ArrayPool, MemoryPool};
    use crate::storage::AnyAllocator;

    #[test]
    fn single_value_uses_node_path() {
        let pool =
            MemoryPool::<ArrayPool>::new(8, MemoryPool::<ArrayPool>::min_block_size(8, 16))
                .unwrap();
        let typed = TypedAllocator::<u64, _>::new(&pool);

        let one = typed.allocate(1).unwrap();
        assert_eq!(one.as_ptr() as usize % core::mem::align_of::<u64>(), 0);
        unsafe { typed.deallocate(one, 1) };
    }

    #[test]
    fn array_roundtrip_through_erased_reference() {
        let heap = HeapAllocator::new();
        let any = AnyAllocator::new_composable(&heap);
        let typed = TypedAllocator::<u32, _>::new(any);

        let array = typed.allocate(12).unwrap();
        unsafe {
            for i in 0..12 {
                array.as_ptr().add(i).write(i as u32);
            }
            assert_eq!(*array.as_ptr().add(11), 11);
            typed.deallocate(array, 12);
        }
    }

    #[test]
    fn stateless_allocators_compare_equal() {
        let a = TypedAllocator::<u64, _>::new(HeapAllocator::new());
        let b = TypedAllocator::<u64, _>::new(HeapAllocator::new());
        assert_eq!(a, b);
    }

    #[test]
    fn propagation_defaults() {
        assert!(TypedAllocator::<u64, HeapAllocator>::PROPAGATE_ON_MOVE_ASSIGNMENT);
        assert!(TypedAllocator::<u64, HeapAllocator>::PROPAGATE_ON_COPY_ASSIGNMENT);
        assert!(TypedAllocator::<u64, HeapAllocator>::PROPAGATE_ON_SWAP);
    }
}
