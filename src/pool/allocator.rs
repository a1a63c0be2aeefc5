//! Arena-backed fixed-size pool

use core::cell::RefCell;
use core::marker::PhantomData;
use core::ptr::NonNull;

use super::PoolKind;
use crate::arena::MemoryArena;
use crate::block::{BlockAllocator, GrowingBlockAllocator};
use crate::debug::LeakCounter;
use crate::error::{AllocError, AllocResult, AllocatorInfo};
use crate::free_list::FreeList;
use crate::lowlevel::HeapAllocator;
use crate::traits::{ComposableAllocator, RawAllocator};

struct PoolInner<L: FreeList, B: BlockAllocator> {
    arena: MemoryArena<B>,
    list: L,
}

impl<L: FreeList, B: BlockAllocator> PoolInner<L, B> {
    /// Pulls one arena block and hands it to the free list
    fn refill(&mut self) -> AllocResult<()> {
        let block = self.arena.allocate_block()?;
        // SAFETY: the block is exclusive to this pool and stays alive while
        // the arena holds it.
        unsafe { self.list.insert(block.memory, block.size) };
        Ok(())
    }
}

/// Pool of equally sized nodes drawn from an arena
///
/// The kind tag `K` selects the free-list variant; see the
/// [module docs](crate::pool). The effective node size is the requested size
/// clamped to the list's minimum element size.
///
/// ```
/// use rawmem::pool::{MemoryPool, NodePool};
/// use rawmem::RawAllocator;
///
/// let pool = MemoryPool::<NodePool>::new(
///     32,
///     MemoryPool::<NodePool>::min_block_size(32, 64),
/// ).unwrap();
/// let node = pool.allocate_node(32, 8).unwrap();
/// unsafe { pool.deallocate_node(node, 32, 8) };
/// ```
pub struct MemoryPool<K: PoolKind, B: BlockAllocator = GrowingBlockAllocator<HeapAllocator>> {
    inner: RefCell<PoolInner<K::List, B>>,
    leaks: LeakCounter,
    _kind: PhantomData<K>,
}

impl<K: PoolKind> MemoryPool<K, GrowingBlockAllocator<HeapAllocator>> {
    /// Creates a heap-backed pool; the first block is inserted eagerly
    pub fn new(node_size: usize, block_size: usize) -> AllocResult<Self> {
        Self::with_block_allocator(node_size, GrowingBlockAllocator::new(block_size))
    }
}

impl<K: PoolKind, B: BlockAllocator> MemoryPool<K, B> {
    /// Block size able to hold `n_nodes` nodes of `node_size` bytes
    pub fn min_block_size(node_size: usize, n_nodes: usize) -> usize {
        K::List::min_block_size(node_size, n_nodes) + MemoryArena::<B>::BLOCK_OVERHEAD
    }

    /// Creates a pool over the given block allocator
    pub fn with_block_allocator(node_size: usize, block_alloc: B) -> AllocResult<Self> {
        let mut inner = PoolInner {
            arena: MemoryArena::new(block_alloc),
            list: K::List::new(node_size),
        };
        inner.refill()?;
        Ok(Self {
            inner: RefCell::new(inner),
            leaks: LeakCounter::new(),
            _kind: PhantomData,
        })
    }

    /// The node size nodes are issued for
    pub fn node_size(&self) -> usize {
        self.inner.borrow().list.node_size()
    }

    /// Alignment every node satisfies: the largest power of two dividing
    /// the node size
    pub fn alignment(&self) -> usize {
        self.inner.borrow().list.alignment()
    }

    /// Bytes servable without growing the arena
    pub fn capacity_left(&self) -> usize {
        let inner = self.inner.borrow();
        inner.list.capacity() * inner.list.node_size()
    }

    /// Number of arena blocks in use
    pub fn block_count(&self) -> usize {
        self.inner.borrow().arena.size()
    }

    /// Whether `ptr` was issued from this pool's blocks
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.inner.borrow().arena.owns(ptr)
    }

    /// Returns cached arena blocks to the block allocator
    pub fn shrink_to_fit(&self) {
        self.inner.borrow_mut().arena.shrink_to_fit();
    }

    fn pool_info(&self) -> AllocatorInfo {
        AllocatorInfo::new("rawmem::MemoryPool", self)
    }

    fn check_node(&self, size: usize, alignment: usize) -> AllocResult<()> {
        let info = self.pool_info();
        if size > self.max_node_size() {
            return Err(AllocError::BadNodeSize {
                info,
                passed: size,
                supported: self.max_node_size(),
            });
        }
        if !crate::utils::is_power_of_two(alignment) || alignment > self.alignment() {
            return Err(AllocError::BadAlignment {
                info,
                passed: alignment,
                supported: self.alignment(),
            });
        }
        Ok(())
    }
}

// SAFETY: nodes are disjoint free-list slots; capacity is restored on
// deallocation.
unsafe impl<K: PoolKind, B: BlockAllocator> RawAllocator for MemoryPool<K, B> {
    fn info(&self) -> AllocatorInfo {
        self.pool_info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.check_node(size, alignment)?;
        let inner = &mut *self.inner.borrow_mut();
        let ptr = match inner.list.allocate() {
            Some(ptr) => ptr,
            None => {
                inner.refill()?;
                inner.list.allocate().ok_or(AllocError::OutOfMemory {
                    info: self.pool_info(),
                    requested: size,
                })?
            }
        };
        self.leaks.on_allocate(inner.list.node_size());
        Ok(ptr)
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, _size: usize, _alignment: usize) {
        let inner = &mut *self.inner.borrow_mut();
        self.leaks.on_deallocate(inner.list.node_size());
        // SAFETY: forwarded caller contract.
        unsafe { inner.list.deallocate(ptr) };
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        self.check_node(size, alignment)?;
        let info = self.pool_info();
        let total = count.checked_mul(size).ok_or(AllocError::BadArraySize {
            info,
            passed: usize::MAX,
            supported: self.max_array_size(),
        })?;
        if !K::List::SUPPORTS_ARRAYS {
            // Node-only variants cannot produce consecutive slots.
            return Err(AllocError::BadArraySize {
                info,
                passed: total,
                supported: 0,
            });
        }

        let inner = &mut *self.inner.borrow_mut();
        let ptr = match inner.list.allocate_array(total) {
            Some(ptr) => ptr,
            None => {
                // One fresh block is contiguous; retry exactly once.
                inner.refill()?;
                inner
                    .list
                    .allocate_array(total)
                    .ok_or(AllocError::BadArraySize {
                        info,
                        passed: total,
                        supported: inner.list.usable_size(inner.arena.next_block_size()),
                    })?
            }
        };
        self.leaks.on_allocate(total);
        Ok(ptr)
    }

    unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        _alignment: usize,
    ) {
        let inner = &mut *self.inner.borrow_mut();
        self.leaks.on_deallocate(count * size);
        // SAFETY: forwarded caller contract.
        unsafe { inner.list.deallocate_array(ptr, count * size) };
    }

    fn max_node_size(&self) -> usize {
        self.node_size()
    }

    fn max_array_size(&self) -> usize {
        if K::List::SUPPORTS_ARRAYS {
            let inner = self.inner.borrow();
            (inner.list.capacity() * inner.list.node_size())
                .max(inner.list.usable_size(inner.arena.next_block_size()))
        } else {
            0
        }
    }

    fn max_alignment(&self) -> usize {
        self.alignment()
    }
}

// SAFETY: the try paths never raise; failed tries leave the pool unchanged.
unsafe impl<K: PoolKind, B: BlockAllocator> ComposableAllocator for MemoryPool<K, B> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if self.check_node(size, alignment).is_err() {
            return None;
        }
        let inner = &mut *self.inner.borrow_mut();
        let ptr = inner.list.allocate()?;
        self.leaks.on_allocate(inner.list.node_size());
        Some(ptr)
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        if self.check_node(size, alignment).is_err() {
            return None;
        }
        let total = count.checked_mul(size)?;
        let inner = &mut *self.inner.borrow_mut();
        let ptr = inner.list.allocate_array(total)?;
        self.leaks.on_allocate(total);
        Some(ptr)
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        if !self.owns(ptr.as_ptr()) {
            return false;
        }
        // SAFETY: the arena owns ptr, so it came from this pool.
        unsafe { self.deallocate_node(ptr, size, alignment) };
        true
    }

    unsafe fn try_deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> bool {
        if !K::List::SUPPORTS_ARRAYS || !self.owns(ptr.as_ptr()) {
            return false;
        }
        // SAFETY: the arena owns ptr, so it came from this pool.
        unsafe { self.deallocate_array(ptr, count, size, alignment) };
        true
    }
}

// SAFETY: the free list's pointers reference arena-owned blocks that move
// together with the pool.
unsafe impl<K: PoolKind, B: BlockAllocator + Send> Send for MemoryPool<K, B> {}

impl<K: PoolKind, B: BlockAllocator> Drop for MemoryPool<K, B> {
    fn drop(&mut self) {
        self.leaks.report(self.pool_info());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ArrayPool, NodePool, SmallNodePool};

    #[test]
    fn node_pool_roundtrip() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 8)).unwrap();
        assert_eq!(pool.node_size(), 16);
        assert_eq!(pool.block_count(), 1);

        let a = pool.allocate_node(16, 8).unwrap();
        let b = pool.allocate_node(16, 8).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        unsafe {
            pool.deallocate_node(a, 16, 8);
            pool.deallocate_node(b, 16, 8);
        }
        assert_eq!(pool.capacity_left(), 8 * 16);
    }

    #[test]
    fn rejects_oversized_nodes_and_alignment() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 8)).unwrap();
        assert!(matches!(
            pool.allocate_node(64, 8),
            Err(AllocError::BadNodeSize { .. })
        ));
        assert!(matches!(
            pool.allocate_node(16, 64),
            Err(AllocError::BadAlignment { .. })
        ));
    }

    #[test]
    fn node_pool_has_no_arrays() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 8)).unwrap();
        assert!(matches!(
            pool.allocate_array(4, 16, 8),
            Err(AllocError::BadArraySize { .. })
        ));
        assert_eq!(pool.max_array_size(), 0);
    }

    #[test]
    fn array_pool_serves_contiguous_runs() {
        let pool =
            MemoryPool::<ArrayPool>::new(8, MemoryPool::<ArrayPool>::min_block_size(8, 32))
                .unwrap();
        let run = pool.allocate_array(5, 8, 8).unwrap();
        unsafe {
            core::ptr::write_bytes(run.as_ptr(), 0x11, 5 * 8);
            pool.deallocate_array(run, 5, 8, 8);
        }
    }

    #[test]
    fn small_pool_serves_tiny_nodes() {
        let pool = MemoryPool::<SmallNodePool>::new(
            2,
            MemoryPool::<SmallNodePool>::min_block_size(2, 64),
        )
        .unwrap();
        assert_eq!(pool.node_size(), 2);

        let a = pool.allocate_node(2, 1).unwrap();
        let b = pool.allocate_node(1, 1).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        unsafe {
            pool.deallocate_node(a, 2, 1);
            pool.deallocate_node(b, 1, 1);
        }
    }

    #[test]
    fn try_paths_never_grow() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 2)).unwrap();
        let a = pool.try_allocate_node(16, 8).unwrap();
        let b = pool.try_allocate_node(16, 8).unwrap();
        assert!(pool.try_allocate_node(16, 8).is_none());
        assert_eq!(pool.block_count(), 1);

        unsafe {
            assert!(pool.try_deallocate_node(a, 16, 8));
            assert!(pool.try_deallocate_node(b, 16, 8));
        }

        let outside = [0u8; 16];
        assert!(!unsafe {
            pool.try_deallocate_node(NonNull::new(outside.as_ptr() as *mut u8).unwrap(), 16, 8)
        });
    }

    #[test]
    fn exhaustion_grows_arena() {
        let pool =
            MemoryPool::<NodePool>::new(16, MemoryPool::<NodePool>::min_block_size(16, 4)).unwrap();
        let mut nodes = Vec::new();
        for _ in 0..8 {
            nodes.push(pool.allocate_node(16, 8).unwrap());
        }
        assert!(pool.block_count() >= 2);
        for node in nodes {
            unsafe { pool.deallocate_node(node, 16, 8) };
        }
    }
}
