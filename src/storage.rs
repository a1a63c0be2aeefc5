//! Storage policies, allocator references and type erasure
//!
//! A *storage policy* decides how an allocator is held: by value
//! ([`DirectStorage`]), by non-owning reference ([`ReferenceStorage`]), or
//! by a shared handle ([`SharedStorage`]). [`AllocatorStorage`] pairs a
//! policy with a mutex policy, giving a uniform wrapper that is either free
//! of synchronization or serializes every call.
//!
//! [`AnyAllocator`] erases the concrete allocator type behind a
//! (payload, vtable) pair, so APIs can take any allocator without a generic
//! parameter.

use core::marker::PhantomData;
use core::ptr::NonNull;

use parking_lot::lock_api::RawMutex as RawMutexTrait;

use crate::error::{AllocResult, AllocatorInfo};
use crate::traits::{ComposableAllocator, RawAllocator};

// ============================================================================
// Storage policies
// ============================================================================

/// How an allocator is held by a wrapper
pub trait StoragePolicy {
    /// The stored allocator type
    type Allocator: RawAllocator;

    /// The stored allocator
    fn get_allocator(&self) -> &Self::Allocator;
}

/// Owns the allocator by value
///
/// Stateless allocators are zero-sized, so owning them costs nothing; this
/// also covers the "reconstruct on demand" case of the reference taxonomy.
#[derive(Debug, Default)]
pub struct DirectStorage<A: RawAllocator>(A);

impl<A: RawAllocator> DirectStorage<A> {
    /// Moves `allocator` into the storage
    pub fn new(allocator: A) -> Self {
        Self(allocator)
    }

    /// Consumes the storage and returns the allocator
    pub fn into_inner(self) -> A {
        self.0
    }
}

impl<A: RawAllocator> StoragePolicy for DirectStorage<A> {
    type Allocator = A;

    fn get_allocator(&self) -> &A {
        &self.0
    }
}

/// Stores a non-owning reference to a stateful allocator
///
/// The caller is bound to the referenced allocator's lifetime; the borrow
/// checker enforces what the C family leaves to discipline.
#[derive(Debug)]
pub struct ReferenceStorage<'a, A: RawAllocator>(&'a A);

impl<'a, A: RawAllocator> ReferenceStorage<'a, A> {
    /// References `allocator` without taking ownership
    pub fn new(allocator: &'a A) -> Self {
        Self(allocator)
    }
}

impl<A: RawAllocator> Clone for ReferenceStorage<'_, A> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<A: RawAllocator> Copy for ReferenceStorage<'_, A> {}

impl<A: RawAllocator> StoragePolicy for ReferenceStorage<'_, A> {
    type Allocator = A;

    fn get_allocator(&self) -> &A {
        self.0
    }
}

impl<A: RawAllocator> PartialEq for ReferenceStorage<'_, A> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

/// Stores a shared allocator handle by value
///
/// For allocators that are themselves reference-like (`Rc<A>`, `Arc<A>`, or
/// hand-rolled handles); cloning the storage clones the handle.
#[derive(Debug, Clone)]
pub struct SharedStorage<A: RawAllocator + Clone>(A);

impl<A: RawAllocator + Clone> SharedStorage<A> {
    /// Stores the handle
    pub fn new(handle: A) -> Self {
        Self(handle)
    }
}

impl<A: RawAllocator + Clone> StoragePolicy for SharedStorage<A> {
    type Allocator = A;

    fn get_allocator(&self) -> &A {
        &self.0
    }
}

// ============================================================================
// Mutex policies
// ============================================================================

/// Locking discipline of an [`AllocatorStorage`]
pub trait MutexPolicy: Default {
    /// Acquires the lock
    fn lock(&self);
    /// Releases the lock
    fn unlock(&self);
}

/// No synchronization; for single-threaded use and thread-safe allocators
#[derive(Debug, Default)]
pub struct NoMutex;

impl MutexPolicy for NoMutex {
    #[inline]
    fn lock(&self) {}
    #[inline]
    fn unlock(&self) {}
}

/// Real mutual exclusion via `parking_lot`
pub struct DefaultMutex(parking_lot::RawMutex);

impl Default for DefaultMutex {
    fn default() -> Self {
        Self(parking_lot::RawMutex::INIT)
    }
}

impl MutexPolicy for DefaultMutex {
    #[inline]
    fn lock(&self) {
        self.0.lock();
    }

    #[inline]
    fn unlock(&self) {
        // SAFETY: lock/unlock calls are balanced by LockGuard and the
        // RawAllocator forwarding below.
        unsafe { self.0.unlock() };
    }
}

/// Balances a mutex across early returns
struct LockGuard<'a, M: MutexPolicy>(&'a M);

impl<'a, M: MutexPolicy> LockGuard<'a, M> {
    fn acquire(mutex: &'a M) -> Self {
        mutex.lock();
        Self(mutex)
    }
}

impl<M: MutexPolicy> Drop for LockGuard<'_, M> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

// ============================================================================
// Allocator storage
// ============================================================================

/// Storage policy plus mutex policy, forwarding the allocator surface
///
/// With [`NoMutex`] this is a transparent wrapper; with [`DefaultMutex`]
/// every call runs under the lock and the wrapper is `Sync` whenever the
/// allocator is `Send`.
pub struct AllocatorStorage<S: StoragePolicy, M: MutexPolicy = NoMutex> {
    storage: S,
    mutex: M,
}

/// Owning storage without a lock
pub type DirectAllocator<A> = AllocatorStorage<DirectStorage<A>, NoMutex>;
/// Non-owning reference without a lock
pub type AllocatorReference<'a, A> = AllocatorStorage<ReferenceStorage<'a, A>, NoMutex>;

impl<S: StoragePolicy, M: MutexPolicy> AllocatorStorage<S, M> {
    /// Wraps a storage policy
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mutex: M::default(),
        }
    }

    /// Acquires the mutex for the handle's lifetime
    ///
    /// The handle dereferences to the stored allocator, allowing compound
    /// operations under one acquisition.
    pub fn lock(&self) -> LockedAllocatorHandle<'_, S, M> {
        self.mutex.lock();
        LockedAllocatorHandle { storage: self }
    }
}

impl<'a, A: RawAllocator> AllocatorReference<'a, A> {
    /// References `allocator` without taking ownership
    pub fn reference(allocator: &'a A) -> Self {
        Self::new(ReferenceStorage::new(allocator))
    }
}

/// Scoped handle holding the storage mutex
pub struct LockedAllocatorHandle<'a, S: StoragePolicy, M: MutexPolicy> {
    storage: &'a AllocatorStorage<S, M>,
}

impl<S: StoragePolicy, M: MutexPolicy> core::ops::Deref for LockedAllocatorHandle<'_, S, M> {
    type Target = S::Allocator;

    fn deref(&self) -> &Self::Target {
        self.storage.storage.get_allocator()
    }
}

impl<S: StoragePolicy, M: MutexPolicy> Drop for LockedAllocatorHandle<'_, S, M> {
    fn drop(&mut self) {
        self.storage.mutex.unlock();
    }
}

// SAFETY: every operation on the stored allocator runs under the mutex
// policy; forwarding preserves the allocator's guarantees.
unsafe impl<S: StoragePolicy, M: MutexPolicy> RawAllocator for AllocatorStorage<S, M> {
    fn info(&self) -> AllocatorInfo {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage.get_allocator().info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage.get_allocator().allocate_node(size, alignment)
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let _guard = LockGuard::acquire(&self.mutex);
        // SAFETY: forwarded caller contract.
        unsafe {
            self.storage
                .get_allocator()
                .deallocate_node(ptr, size, alignment)
        }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage
            .get_allocator()
            .allocate_array(count, size, alignment)
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        let _guard = LockGuard::acquire(&self.mutex);
        // SAFETY: forwarded caller contract.
        unsafe {
            self.storage
                .get_allocator()
                .deallocate_array(ptr, count, size, alignment)
        }
    }

    fn max_node_size(&self) -> usize {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage.get_allocator().max_node_size()
    }

    fn max_array_size(&self) -> usize {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage.get_allocator().max_array_size()
    }

    fn max_alignment(&self) -> usize {
        let _guard = LockGuard::acquire(&self.mutex);
        self.storage.get_allocator().max_alignment()
    }
}

// SAFETY: without a mutex the wrapper adds nothing; sharing is exactly as
// safe as sharing the stored allocator.
unsafe impl<S: StoragePolicy + Sync> Sync for AllocatorStorage<S, NoMutex> {}

// SAFETY: the real mutex serializes every call, so a Send allocator behind
// it is safe to share.
unsafe impl<S: StoragePolicy + Send> Sync for AllocatorStorage<S, DefaultMutex> {}

// ============================================================================
// Type erasure
// ============================================================================

struct AnyAllocatorVTable {
    allocate: unsafe fn(NonNull<()>, usize, usize, usize) -> AllocResult<NonNull<u8>>,
    deallocate: unsafe fn(NonNull<()>, NonNull<u8>, usize, usize, usize),
    try_allocate: Option<unsafe fn(NonNull<()>, usize, usize, usize) -> Option<NonNull<u8>>>,
    try_deallocate: Option<unsafe fn(NonNull<()>, NonNull<u8>, usize, usize, usize) -> bool>,
    max_node_size: unsafe fn(NonNull<()>) -> usize,
    max_array_size: unsafe fn(NonNull<()>) -> usize,
    max_alignment: unsafe fn(NonNull<()>) -> usize,
    info: unsafe fn(NonNull<()>) -> AllocatorInfo,
}

/// Reads the payload back as the concrete allocator
///
/// # Safety
/// `payload` must be the pointer an `AnyAllocator` constructor erased from
/// a live `&A`.
unsafe fn payload_as<'a, A>(payload: NonNull<()>) -> &'a A {
    unsafe { payload.cast::<A>().as_ref() }
}

unsafe fn allocate_shim<A: RawAllocator>(
    payload: NonNull<()>,
    count: usize,
    size: usize,
    alignment: usize,
) -> AllocResult<NonNull<u8>> {
    // SAFETY: constructor invariant.
    let alloc = unsafe { payload_as::<A>(payload) };
    if count == 1 {
        alloc.allocate_node(size, alignment)
    } else {
        alloc.allocate_array(count, size, alignment)
    }
}

unsafe fn deallocate_shim<A: RawAllocator>(
    payload: NonNull<()>,
    ptr: NonNull<u8>,
    count: usize,
    size: usize,
    alignment: usize,
) {
    // SAFETY: constructor invariant; deallocation contract forwarded.
    let alloc = unsafe { payload_as::<A>(payload) };
    if count == 1 {
        unsafe { alloc.deallocate_node(ptr, size, alignment) }
    } else {
        unsafe { alloc.deallocate_array(ptr, count, size, alignment) }
    }
}

unsafe fn try_allocate_shim<A: ComposableAllocator>(
    payload: NonNull<()>,
    count: usize,
    size: usize,
    alignment: usize,
) -> Option<NonNull<u8>> {
    // SAFETY: constructor invariant.
    let alloc = unsafe { payload_as::<A>(payload) };
    if count == 1 {
        alloc.try_allocate_node(size, alignment)
    } else {
        alloc.try_allocate_array(count, size, alignment)
    }
}

unsafe fn try_deallocate_shim<A: ComposableAllocator>(
    payload: NonNull<()>,
    ptr: NonNull<u8>,
    count: usize,
    size: usize,
    alignment: usize,
) -> bool {
    // SAFETY: constructor invariant; deallocation contract forwarded.
    let alloc = unsafe { payload_as::<A>(payload) };
    if count == 1 {
        unsafe { alloc.try_deallocate_node(ptr, size, alignment) }
    } else {
        unsafe { alloc.try_deallocate_array(ptr, count, size, alignment) }
    }
}

unsafe fn max_node_size_shim<A: RawAllocator>(payload: NonNull<()>) -> usize {
    // SAFETY: constructor invariant.
    unsafe { payload_as::<A>(payload) }.max_node_size()
}

unsafe fn max_array_size_shim<A: RawAllocator>(payload: NonNull<()>) -> usize {
    // SAFETY: constructor invariant.
    unsafe { payload_as::<A>(payload) }.max_array_size()
}

unsafe fn max_alignment_shim<A: RawAllocator>(payload: NonNull<()>) -> usize {
    // SAFETY: constructor invariant.
    unsafe { payload_as::<A>(payload) }.max_alignment()
}

unsafe fn info_shim<A: RawAllocator>(payload: NonNull<()>) -> AllocatorInfo {
    // SAFETY: constructor invariant.
    unsafe { payload_as::<A>(payload) }.info()
}

struct RawVTable<A>(PhantomData<A>);

impl<A: RawAllocator> RawVTable<A> {
    const TABLE: AnyAllocatorVTable = AnyAllocatorVTable {
        allocate: allocate_shim::<A>,
        deallocate: deallocate_shim::<A>,
        try_allocate: None,
        try_deallocate: None,
        max_node_size: max_node_size_shim::<A>,
        max_array_size: max_array_size_shim::<A>,
        max_alignment: max_alignment_shim::<A>,
        info: info_shim::<A>,
    };
}

struct ComposableVTable<A>(PhantomData<A>);

impl<A: ComposableAllocator> ComposableVTable<A> {
    const TABLE: AnyAllocatorVTable = AnyAllocatorVTable {
        allocate: allocate_shim::<A>,
        deallocate: deallocate_shim::<A>,
        try_allocate: Some(try_allocate_shim::<A>),
        try_deallocate: Some(try_deallocate_shim::<A>),
        max_node_size: max_node_size_shim::<A>,
        max_array_size: max_array_size_shim::<A>,
        max_alignment: max_alignment_shim::<A>,
        info: info_shim::<A>,
    };
}

/// Type-erased allocator reference: a (payload, vtable) handle
///
/// A count of `1` dispatches to the node primitives, anything else to the
/// array primitives. The handle is `Copy`; cloning it clones the reference,
/// not the allocator.
///
/// ```
/// use rawmem::lowlevel::HeapAllocator;
/// use rawmem::storage::AnyAllocator;
/// use rawmem::RawAllocator;
///
/// let heap = HeapAllocator::new();
/// let any = AnyAllocator::new_composable(&heap);
/// let node = any.allocate_node(64, 8).unwrap();
/// unsafe { any.deallocate_node(node, 64, 8) };
/// ```
#[derive(Clone, Copy)]
pub struct AnyAllocator<'a> {
    payload: NonNull<()>,
    vtable: &'static AnyAllocatorVTable,
    _marker: PhantomData<&'a ()>,
}

impl<'a> AnyAllocator<'a> {
    /// Erases a plain raw allocator; the try paths report "not composable"
    pub fn new<A: RawAllocator>(allocator: &'a A) -> Self {
        Self {
            payload: NonNull::from(allocator).cast(),
            vtable: &RawVTable::<A>::TABLE,
            _marker: PhantomData,
        }
    }

    /// Erases a composable allocator, keeping its try paths reachable
    pub fn new_composable<A: ComposableAllocator>(allocator: &'a A) -> Self {
        Self {
            payload: NonNull::from(allocator).cast(),
            vtable: &ComposableVTable::<A>::TABLE,
            _marker: PhantomData,
        }
    }

    /// Whether the erased allocator exposes the composable try paths
    pub fn is_composable(&self) -> bool {
        self.vtable.try_allocate.is_some()
    }
}

// SAFETY: dispatch forwards to the erased allocator, whose guarantees the
// constructors pinned down.
unsafe impl RawAllocator for AnyAllocator<'_> {
    fn info(&self) -> AllocatorInfo {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.info)(self.payload) }
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.allocate)(self.payload, 1, size, alignment) }
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        // SAFETY: payload/vtable pair built by a constructor; caller
        // contract forwarded.
        unsafe { (self.vtable.deallocate)(self.payload, ptr, 1, size, alignment) }
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.allocate)(self.payload, count, size, alignment) }
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        // SAFETY: payload/vtable pair built by a constructor; caller
        // contract forwarded.
        unsafe { (self.vtable.deallocate)(self.payload, ptr, count, size, alignment) }
    }

    fn max_node_size(&self) -> usize {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.max_node_size)(self.payload) }
    }

    fn max_array_size(&self) -> usize {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.max_array_size)(self.payload) }
    }

    fn max_alignment(&self) -> usize {
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { (self.vtable.max_alignment)(self.payload) }
    }
}

// SAFETY: a non-composable erasure answers the try paths negatively without
// side effects, which satisfies the purity contract.
unsafe impl ComposableAllocator for AnyAllocator<'_> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let shim = self.vtable.try_allocate?;
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { shim(self.payload, 1, size, alignment) }
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let shim = self.vtable.try_allocate?;
        // SAFETY: payload/vtable pair built by a constructor.
        unsafe { shim(self.payload, count, size, alignment) }
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        match self.vtable.try_deallocate {
            // SAFETY: payload/vtable pair built by a constructor.
            Some(shim) => unsafe { shim(self.payload, ptr, 1, size, alignment) },
            None => false,
        }
    }

    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool {
        match self.vtable.try_deallocate {
            // SAFETY: payload/vtable pair built by a constructor.
            Some(shim) => unsafe { shim(self.payload, ptr, count, size, alignment) },
            None => false,
        }
    }
}
