//! Bucketed multi-size pool
//!
//! One free list per size bucket, all refilled from a shared arena. Unused
//! bytes of the current block form a *reservoir*; a bucket that runs dry
//! carves its share out of the reservoir instead of taking a whole block.

use core::cell::RefCell;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::arena::MemoryArena;
use crate::block::{BlockAllocator, GrowingBlockAllocator};
use crate::debug::LeakCounter;
use crate::error::{AllocError, AllocResult, AllocatorInfo};
use crate::free_list::{FreeList, OrderedFreeList};
use crate::lowlevel::HeapAllocator;
use crate::traits::{ComposableAllocator, RawAllocator};
use crate::utils::{align_up, ilog2_ceil, MAX_ALIGNMENT};

/// Maps node sizes onto free-list buckets
pub trait BucketPolicy {
    /// Number of buckets needed to cover sizes `1..=max_node_size`
    fn bucket_count(max_node_size: usize) -> usize;

    /// Bucket serving `size`-byte nodes
    fn bucket_index(size: usize) -> usize;

    /// Node size the bucket at `index` issues
    fn bucket_node_size(index: usize) -> usize;
}

/// One bucket per size: no internal fragmentation, many lists
#[derive(Debug)]
pub enum IdentityBuckets {}

impl BucketPolicy for IdentityBuckets {
    fn bucket_count(max_node_size: usize) -> usize {
        max_node_size
    }

    fn bucket_index(size: usize) -> usize {
        size - 1
    }

    fn bucket_node_size(index: usize) -> usize {
        index + 1
    }
}

/// One bucket per power-of-two ceiling: few lists, bounded waste
#[derive(Debug)]
pub enum Log2Buckets {}

impl BucketPolicy for Log2Buckets {
    fn bucket_count(max_node_size: usize) -> usize {
        ilog2_ceil(max_node_size) + 1
    }

    fn bucket_index(size: usize) -> usize {
        ilog2_ceil(size)
    }

    fn bucket_node_size(index: usize) -> usize {
        1 << index
    }
}

/// Bump cursor over the unused tail of the current block
struct Reservoir {
    top: *mut u8,
    end: *mut u8,
}

impl Reservoir {
    const fn empty() -> Self {
        Self {
            top: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
        }
    }

    fn capacity_left(&self) -> usize {
        self.end as usize - self.top as usize
    }

    /// Takes up to `wanted` bytes, max-aligned; `None` when nothing is left
    fn carve(&mut self, wanted: usize) -> Option<(NonNull<u8>, usize)> {
        let aligned = align_up(self.top as usize, MAX_ALIGNMENT);
        if aligned >= self.end as usize {
            return None;
        }
        let available = self.end as usize - aligned;
        let take = wanted.min(available);
        self.top = (aligned + take) as *mut u8;
        Some((
            // SAFETY: aligned lies within the block, hence non-null.
            unsafe { NonNull::new_unchecked(aligned as *mut u8) },
            take,
        ))
    }
}

struct CollectionInner<B: BlockAllocator> {
    arena: MemoryArena<B>,
    reservoir: Reservoir,
    lists: Box<[OrderedFreeList]>,
}

impl<B: BlockAllocator> CollectionInner<B> {
    /// Refills bucket `index` with its share of the reservoir
    ///
    /// When the reservoir runs dry, its remainder goes into the requesting
    /// bucket and a fresh arena block becomes the new reservoir.
    fn refill(&mut self, index: usize) -> AllocResult<()> {
        let stride = crate::free_list::slot_stride(self.lists[index].node_size());
        let share = (self.arena.next_block_size() / self.lists.len()).max(stride);

        if let Some((mem, take)) = self.reservoir.carve(share) {
            // SAFETY: the carved range stays inside an arena-held block.
            unsafe { self.lists[index].insert(mem, take) };
            if !self.lists[index].is_empty() {
                return Ok(());
            }
        }

        // Reservoir exhausted (or its tail was too small for one slot):
        // drain the remainder into this bucket and start a fresh block.
        if let Some((mem, take)) = self.reservoir.carve(usize::MAX) {
            // SAFETY: as above.
            unsafe { self.lists[index].insert(mem, take) };
        }
        let block = self.arena.allocate_block()?;
        self.reservoir = Reservoir {
            top: block.memory.as_ptr(),
            end: block.end(),
        };
        let share = (block.size / self.lists.len()).max(stride);
        if let Some((mem, take)) = self.reservoir.carve(share) {
            // SAFETY: as above.
            unsafe { self.lists[index].insert(mem, take) };
        }
        Ok(())
    }
}

/// Pool serving every node size up to a configured maximum
///
/// The bucket policy decides how sizes map to free lists:
/// [`IdentityBuckets`] keeps one list per size, [`Log2Buckets`] one per
/// power-of-two ceiling.
///
/// ```
/// use rawmem::pool::{Log2Buckets, MemoryPoolCollection};
/// use rawmem::RawAllocator;
///
/// let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 4096).unwrap();
/// let small = pool.allocate_node(5, 1).unwrap();
/// let large = pool.allocate_node(48, 8).unwrap();
/// unsafe {
///     pool.deallocate_node(small, 5, 1);
///     pool.deallocate_node(large, 48, 8);
/// }
/// ```
pub struct MemoryPoolCollection<
    P: BucketPolicy = Log2Buckets,
    B: BlockAllocator = GrowingBlockAllocator<HeapAllocator>,
> {
    inner: RefCell<CollectionInner<B>>,
    max_node_size: usize,
    leaks: LeakCounter,
    _policy: PhantomData<P>,
}

impl<P: BucketPolicy> MemoryPoolCollection<P, GrowingBlockAllocator<HeapAllocator>> {
    /// Creates a heap-backed collection for nodes up to `max_node_size`
    pub fn new(max_node_size: usize, block_size: usize) -> AllocResult<Self> {
        Self::with_block_allocator(max_node_size, GrowingBlockAllocator::new(block_size))
    }
}

impl<P: BucketPolicy, B: BlockAllocator> MemoryPoolCollection<P, B> {
    /// Creates a collection over the given block allocator
    pub fn with_block_allocator(max_node_size: usize, block_alloc: B) -> AllocResult<Self> {
        assert!(max_node_size > 0, "maximum node size must be positive");
        let lists = (0..P::bucket_count(max_node_size))
            .map(|i| OrderedFreeList::new(P::bucket_node_size(i)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut inner = CollectionInner {
            arena: MemoryArena::new(block_alloc),
            reservoir: Reservoir::empty(),
            lists,
        };
        let block = inner.arena.allocate_block()?;
        inner.reservoir = Reservoir {
            top: block.memory.as_ptr(),
            end: block.end(),
        };

        Ok(Self {
            inner: RefCell::new(inner),
            max_node_size,
            leaks: LeakCounter::new(),
            _policy: PhantomData,
        })
    }

    /// Largest node size this collection serves
    pub fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    /// Free slots currently parked in the bucket serving `size`
    pub fn pool_capacity_left(&self, size: usize) -> usize {
        let inner = self.inner.borrow();
        let list = &inner.lists[P::bucket_index(size)];
        list.capacity() * list.node_size()
    }

    /// Bytes left in the reservoir of the current block
    pub fn reservoir_capacity_left(&self) -> usize {
        self.inner.borrow().reservoir.capacity_left()
    }

    /// Number of arena blocks in use
    pub fn block_count(&self) -> usize {
        self.inner.borrow().arena.size()
    }

    /// Whether `ptr` was issued from this collection's blocks
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.inner.borrow().arena.owns(ptr)
    }

    fn collection_info(&self) -> AllocatorInfo {
        AllocatorInfo::new("rawmem::MemoryPoolCollection", self)
    }

    fn check_request(&self, size: usize, alignment: usize) -> AllocResult<usize> {
        let info = self.collection_info();
        if size == 0 || size > self.max_node_size {
            return Err(AllocError::BadNodeSize {
                info,
                passed: size,
                supported: self.max_node_size,
            });
        }
        let index = P::bucket_index(size);
        let supported = self.inner.borrow().lists[index].alignment();
        if !crate::utils::is_power_of_two(alignment) || alignment > supported {
            return Err(AllocError::BadAlignment {
                info,
                passed: alignment,
                supported,
            });
        }
        Ok(index)
    }
}

// SAFETY: every issued node is a slot of the bucket list for its size;
// buckets never share slots.
unsafe impl<P: BucketPolicy, B: BlockAllocator> RawAllocator for MemoryPoolCollection<P, B> {
    fn info(&self) -> AllocatorInfo {
        self.collection_info()
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        let index = self.check_request(size, alignment)?;
        let inner = &mut *self.inner.borrow_mut();
        let ptr = match inner.lists[index].allocate() {
            Some(ptr) => ptr,
            None => {
                inner.refill(index)?;
                inner.lists[index].allocate().ok_or(AllocError::OutOfMemory {
                    info: self.collection_info(),
                    requested: size,
                })?
            }
        };
        self.leaks.on_allocate(inner.lists[index].node_size());
        Ok(ptr)
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        let index = P::bucket_index(size);
        let inner = &mut *self.inner.borrow_mut();
        self.leaks.on_deallocate(inner.lists[index].node_size());
        // SAFETY: forwarded caller contract; size selects the issuing bucket.
        unsafe { inner.lists[index].deallocate(ptr) };
    }

    fn allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        let index = self.check_request(size, alignment)?;
        let info = self.collection_info();
        let total = count.checked_mul(size).ok_or(AllocError::BadArraySize {
            info,
            passed: usize::MAX,
            supported: self.max_array_size(),
        })?;

        let inner = &mut *self.inner.borrow_mut();
        let ptr = match inner.lists[index].allocate_array(total) {
            Some(ptr) => ptr,
            None => {
                inner.refill(index)?;
                inner.lists[index]
                    .allocate_array(total)
                    .ok_or(AllocError::BadArraySize {
                        info,
                        passed: total,
                        supported: inner.arena.next_block_size(),
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
        let index = P::bucket_index(size);
        let inner = &mut *self.inner.borrow_mut();
        self.leaks.on_deallocate(count * size);
        // SAFETY: forwarded caller contract.
        unsafe { inner.lists[index].deallocate_array(ptr, count * size) };
    }

    fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    fn max_array_size(&self) -> usize {
        self.inner.borrow().arena.next_block_size()
    }

    fn max_alignment(&self) -> usize {
        MAX_ALIGNMENT
    }
}

// SAFETY: the try paths never raise; ownership is established through the
// arena before any slot is touched.
unsafe impl<P: BucketPolicy, B: BlockAllocator> ComposableAllocator for MemoryPoolCollection<P, B> {
    fn try_allocate_node(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let index = self.check_request(size, alignment).ok()?;
        let inner = &mut *self.inner.borrow_mut();
        let ptr = inner.lists[index].allocate()?;
        self.leaks.on_allocate(inner.lists[index].node_size());
        Some(ptr)
    }

    fn try_allocate_array(
        &self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let index = self.check_request(size, alignment).ok()?;
        let total = count.checked_mul(size)?;
        let inner = &mut *self.inner.borrow_mut();
        let ptr = inner.lists[index].allocate_array(total)?;
        self.leaks.on_allocate(total);
        Some(ptr)
    }

    unsafe fn try_deallocate_node(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> bool {
        if size == 0 || size > self.max_node_size || !self.owns(ptr.as_ptr()) {
            return false;
        }
        // SAFETY: the arena owns ptr, so it came from this collection.
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
        if size == 0 || size > self.max_node_size || !self.owns(ptr.as_ptr()) {
            return false;
        }
        // SAFETY: the arena owns ptr, so it came from this collection.
        unsafe { self.deallocate_array(ptr, count, size, alignment) };
        true
    }
}

// SAFETY: the bucket lists' pointers reference arena-owned blocks that move
// together with the collection.
unsafe impl<P: BucketPolicy, B: BlockAllocator + Send> Send for MemoryPoolCollection<P, B> {}

impl<P: BucketPolicy, B: BlockAllocator> Drop for MemoryPoolCollection<P, B> {
    fn drop(&mut self) {
        self.leaks.report(AllocatorInfo::new("rawmem::MemoryPoolCollection", self));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_bucket_math() {
        assert_eq!(Log2Buckets::bucket_index(1), 0);
        assert_eq!(Log2Buckets::bucket_index(8), 3);
        assert_eq!(Log2Buckets::bucket_index(9), 4);
        assert_eq!(Log2Buckets::bucket_node_size(4), 16);
        assert_eq!(Log2Buckets::bucket_count(64), 7);
    }

    #[test]
    fn identity_bucket_math() {
        assert_eq!(IdentityBuckets::bucket_index(1), 0);
        assert_eq!(IdentityBuckets::bucket_index(64), 63);
        assert_eq!(IdentityBuckets::bucket_node_size(63), 64);
        assert_eq!(IdentityBuckets::bucket_count(64), 64);
    }

    #[test]
    fn routes_sizes_to_their_bucket() {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 8192).unwrap();

        let a = pool.allocate_node(5, 1).unwrap();
        // Size 5 rounds up to the 8-byte bucket.
        assert!(pool.pool_capacity_left(8) > 0 || pool.pool_capacity_left(5) > 0);
        let b = pool.allocate_node(33, 8).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        unsafe {
            pool.deallocate_node(a, 5, 1);
            pool.deallocate_node(b, 33, 8);
        }
    }

    #[test]
    fn rejects_oversized_nodes() {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 8192).unwrap();
        assert!(matches!(
            pool.allocate_node(65, 8),
            Err(AllocError::BadNodeSize { .. })
        ));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 8192).unwrap();
        let outside = [0u8; 32];
        assert!(!unsafe {
            pool.try_deallocate_node(NonNull::new(outside.as_ptr() as *mut u8).unwrap(), 16, 8)
        });
    }

    #[test]
    fn arrays_come_from_the_bucket_list() {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(64, 8192).unwrap();
        let run = pool.allocate_array(6, 16, 8).unwrap();
        unsafe {
            core::ptr::write_bytes(run.as_ptr(), 0x3C, 6 * 16);
            pool.deallocate_array(run, 6, 16, 8);
        }
    }

    #[test]
    fn reservoir_drains_before_new_blocks() {
        let pool = MemoryPoolCollection::<Log2Buckets>::new(16, 4096).unwrap();
        assert_eq!(pool.block_count(), 1);
        let before = pool.reservoir_capacity_left();

        let node = pool.allocate_node(16, 8).unwrap();
        assert!(pool.reservoir_capacity_left() < before);
        assert_eq!(pool.block_count(), 1);
        unsafe { pool.deallocate_node(node, 16, 8) };
    }
}
