//! Free lists: the slot bookkeeping under the pools
//!
//! A free list manages equally sized *slots* carved out of inserted memory
//! regions. Free slots are linked through their own bytes, so the list needs
//! no storage besides a few cursors. Three variants share one surface:
//!
//! - [`UnorderedFreeList`] — single-linked LIFO, the fastest node pool
//! - [`OrderedFreeList`] — address-sorted, supports contiguous arrays
//! - [`SmallFreeList`] — chunked with 8-bit links, for nodes down to 1 byte
//!
//! In debug builds every slot carries fence bytes before and after its
//! payload; the stride accounts for them.

mod ordered;
mod small;
mod unordered;

pub use ordered::OrderedFreeList;
pub use small::SmallFreeList;
pub use unordered::UnorderedFreeList;

use core::ptr::NonNull;

/// Common surface of the free-list variants
///
/// Sizes passed to [`allocate_array`]/[`deallocate_array`] are in bytes, not
/// slots. The list never owns the memory it manages; callers keep the
/// backing blocks alive.
///
/// [`allocate_array`]: FreeList::allocate_array
pub trait FreeList {
    /// Smallest node size the variant can manage
    const MIN_ELEMENT_SIZE: usize;
    /// Alignment of the smallest node
    const MIN_ELEMENT_ALIGNMENT: usize;
    /// Whether [`allocate_array`](FreeList::allocate_array) can succeed
    const SUPPORTS_ARRAYS: bool;

    /// Creates an empty list for nodes of `node_size` bytes
    ///
    /// The effective node size is clamped to `MIN_ELEMENT_SIZE`.
    fn new(node_size: usize) -> Self;

    /// Smallest region able to hold `n_nodes` nodes of `node_size` bytes
    fn min_block_size(node_size: usize, n_nodes: usize) -> usize;

    /// Subdivides `[mem, mem + size)` into slots and adds them to the list
    ///
    /// # Safety
    /// The region must be valid for writes, disjoint from every region
    /// already inserted, aligned to [`alignment`](FreeList::alignment), and
    /// outlive the list's use of it.
    unsafe fn insert(&mut self, mem: NonNull<u8>, size: usize);

    /// Bytes of a `size`-byte region that `insert` would turn into slots
    fn usable_size(&self, size: usize) -> usize;

    /// Takes one slot from the list, `None` when empty
    fn allocate(&mut self) -> Option<NonNull<u8>>;

    /// Takes a contiguous region able to hold `n` bytes
    ///
    /// May fail even when `capacity` suffices, if no run of consecutive
    /// slots is long enough. Variants without array support always return
    /// `None`.
    fn allocate_array(&mut self, n: usize) -> Option<NonNull<u8>>;

    /// Returns a slot obtained from [`allocate`](FreeList::allocate)
    ///
    /// # Safety
    /// `ptr` must come from this list's `allocate` and must not be returned
    /// twice.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Returns a region obtained from `allocate_array` with the same `n`
    ///
    /// # Safety
    /// Same contract as [`deallocate`](FreeList::deallocate).
    unsafe fn deallocate_array(&mut self, ptr: NonNull<u8>, n: usize);

    /// The node size slots are issued for (fences excluded)
    fn node_size(&self) -> usize;

    /// Alignment every issued slot satisfies
    fn alignment(&self) -> usize;

    /// Number of free slots
    fn capacity(&self) -> usize;

    /// Whether no slot is available
    fn is_empty(&self) -> bool {
        self.capacity() == 0
    }
}

/// Stride between slots: payload plus both fence regions
#[inline(always)]
pub(crate) fn slot_stride(node_size: usize) -> usize {
    node_size + 2 * crate::debug::fence_size()
}

/// Slots needed for an `n`-byte array, fences around the whole run
#[inline(always)]
pub(crate) fn slots_for_array(n: usize, stride: usize) -> usize {
    let total = n + 2 * crate::debug::fence_size();
    total.div_ceil(stride)
}
