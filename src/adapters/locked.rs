//! Mutex-guarded allocator façade

use core::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::{ComposableAllocator, RawAllocator, ThreadSafeAllocator};

/// Serializes a single-threaded allocator behind a mutex
///
/// Every operation acquires the lock on entry and releases it on exit, which
/// makes the wrapper `Sync`. Compound operations (allocate, then touch the
/// memory while relying on allocator state) still need
/// [`lock`](LockedAllocator::lock).
///
/// ```
/// use std::sync::Arc;
///
/// use rawmem::adapters::LockedAllocator;
/// use rawmem::pool::{MemoryPool, NodePool};
/// use rawmem::RawAllocator;
///
/// let pool = MemoryPool::<NodePool>::new(
///     64,
///     MemoryPool::<NodePool>::min_block_size(64, 128),
/// ).unwrap();
/// let shared = Arc::new(LockedAllocator::new(pool));
///
/// let worker = {
///     let shared = Arc::clone(&shared);
///     std::thread::spawn(move || {
///         let node = shared.allocate_node(64, 8).unwrap();
///         unsafe { shared.deallocate_node(node, 64, 8) };
///     })
/// };
/// worker.join().unwrap();
/// ```
#[derive(Debug)]
pub struct LockedAllocator<A: RawAllocator> {
    inner: Mutex<A>,
}

impl<A: RawAllocator> LockedAllocator<A> {
    /// Moves `alloc` behind a mutex
    pub fn new(alloc: A) -> Self {
        Self {
            inner: Mutex::new(alloc),
        }
    }

    /// Holds the lock for compound operations
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    /// Consumes the wrapper and returns the allocator
    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

// SAFETY: the mutex serializes every operation on the inner allocator.
unsafe impl<A: RawAllocator> RawAllocator for LockedAllocator<A> {
    fn info(&self) -> AllocatorInfo {
        self.inner.lock().info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.inner.lock().allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().deallocate_node(ptr, size, alignment) }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        self.inner.lock().allocate_array(count, size, alignment)
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
            self.inner
                .lock()
                .deallocate_array(ptr, count, size, alignment)
        }
    }

    fn max_node_size(&self) -> usize {
        self.inner.lock().max_node_size()
    }

    fn max_array_size(&self) -> usize {
        self.inner.lock().max_array_size()
    }

    fn max_alignment(&self) -> usize {
        self.inner.lock().max_alignment()
    }
}

// SAFETY: pure forwarding under the lock.
unsafe impl<A: ComposableAllocator> ComposableAllocator for LockedAllocator<A> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.inner.lock().try_allocate_node(size, alignment)
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        self.inner.lock().try_allocate_array(count, size, alignment)
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().try_deallocate_node(ptr, size, alignment) }
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
            self.inner
                .lock()
                .try_deallocate_array(ptr, count, size, alignment)
        }
    }
}

impl<A: RawAllocator + Send> ThreadSafeAllocator for LockedAllocator<A> {}
