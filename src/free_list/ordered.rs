//! Address-ordered free list with array support
//!
//! Free slots form an XOR-linked list sorted by address: each slot stores
//! `prev ^ next` in its first bytes, so one pointer width suffices for
//! bidirectional links. Order makes runs of consecutive slots discoverable,
//! which is what array allocation needs, and lets deallocation detect double
//! frees.
//!
//! Deallocation keeps a `last_dealloc` hint; frees arriving in locally
//! ascending address order find their position in O(1).

use core::ptr::NonNull;

use super::{slot_stride, slots_for_array, FreeList};
use crate::debug::{
    debug_check_fence, debug_fill, debug_fill_fence, fence_size, issued_to_slot, on_invalid_pointer,
    slot_to_issued, FREED_MEMORY, NEW_MEMORY,
};
use crate::error::AllocatorInfo;

const LIST_INFO: AllocatorInfo = AllocatorInfo::stateless("rawmem::OrderedFreeList");

// ============================================================================
// XOR link primitives (null encodes as 0)
// ============================================================================

/// Reads the stored `prev ^ next` of a slot
///
/// # Safety
/// `slot` must be a live free slot of this list.
#[inline]
unsafe fn xor_stored(slot: *mut u8) -> usize {
    // Slots may sit at any multiple of the stride, so links are unaligned.
    unsafe { (slot as *mut usize).read_unaligned() }
}

/// Links `slot` between `prev` and `next`
///
/// # Safety
/// `slot` must be a live free slot of this list.
#[inline]
unsafe fn xor_link(slot: *mut u8, prev: *mut u8, next: *mut u8) {
    unsafe { (slot as *mut usize).write_unaligned(prev as usize ^ next as usize) }
}

/// The neighbor of `slot` on the other side of `one`
///
/// # Safety
/// `slot` must be a live free slot and `one` one of its neighbors.
#[inline]
unsafe fn xor_other(slot: *mut u8, one: *mut u8) -> *mut u8 {
    unsafe { (xor_stored(slot) ^ one as usize) as *mut u8 }
}

/// Replaces `slot`'s neighbor `old` with `new`
///
/// # Safety
/// `slot` must be a live free slot with `old` as one of its neighbors.
#[inline]
unsafe fn xor_exchange(slot: *mut u8, old: *mut u8, new: *mut u8) {
    unsafe {
        let stored = xor_stored(slot) ^ old as usize ^ new as usize;
        (slot as *mut usize).write_unaligned(stored);
    }
}

/// Address-sorted XOR-linked free list
#[derive(Debug)]
pub struct OrderedFreeList {
    first: *mut u8,
    last: *mut u8,
    node_size: usize,
    capacity: usize,
    last_dealloc: *mut u8,
    last_dealloc_prev: *mut u8,
}

impl OrderedFreeList {
    #[inline]
    fn stride(&self) -> usize {
        slot_stride(self.node_size)
    }

    /// Resets the deallocation hint to the list head
    #[inline]
    fn reset_hint(&mut self) {
        self.last_dealloc = self.first;
        self.last_dealloc_prev = core::ptr::null_mut();
    }

    /// Finds `(prev, next)` so that `prev < slot < next` (address order)
    ///
    /// Starts from the deallocation hint when the slot lies past it,
    /// otherwise from the head. Fires the invalid-pointer handler when the
    /// slot is already free (double deallocation).
    ///
    /// # Safety
    /// All linked slots must be live.
    unsafe fn find_pos(&self, slot: *mut u8) -> (*mut u8, *mut u8) {
        // Past the tail: append in O(1).
        if !self.last.is_null() && slot as usize > self.last as usize {
            return (self.last, core::ptr::null_mut());
        }

        let (mut prev, mut cur) =
            if !self.last_dealloc.is_null() && slot as usize > self.last_dealloc as usize {
                (self.last_dealloc_prev, self.last_dealloc)
            } else {
                (core::ptr::null_mut(), self.first)
            };

        while !cur.is_null() && (cur as usize) < (slot as usize) {
            // SAFETY: cur is a linked slot with prev as its lower neighbor.
            let next = unsafe { xor_other(cur, prev) };
            prev = cur;
            cur = next;
        }
        if cur == slot {
            on_invalid_pointer(LIST_INFO, slot);
        }
        (prev, cur)
    }

    /// Carves `size / stride` slots out of `mem` and splices them in sorted
    ///
    /// # Safety
    /// The region must be writable, disjoint from every linked slot, and
    /// outlive the list's use of it.
    unsafe fn insert_region(&mut self, mem: *mut u8, size: usize) {
        let stride = self.stride();
        let count = size / stride;
        if count == 0 {
            return;
        }

        // SAFETY: linked slots are live per the list invariant.
        let (prev, next) = unsafe { self.find_pos(mem) };

        // SAFETY: all slot addresses lie within the inserted region.
        unsafe {
            let last_slot = mem.add((count - 1) * stride);
            let mut slot = mem;
            for i in 0..count {
                let left = if i == 0 { prev } else { slot.sub(stride) };
                let right = if i + 1 == count { next } else { slot.add(stride) };
                xor_link(slot, left, right);
                slot = slot.add(stride);
            }

            if prev.is_null() {
                self.first = mem;
            } else {
                xor_exchange(prev, next, mem);
            }
            if next.is_null() {
                self.last = last_slot;
            } else {
                xor_exchange(next, prev, last_slot);
            }
        }

        self.capacity += count;
        self.last_dealloc = mem;
        self.last_dealloc_prev = prev;
    }

    /// Marks an issued run: fences at both ends, fresh-memory fill between
    ///
    /// # Safety
    /// The run must span `total` writable bytes.
    unsafe fn mark_issued(&self, run: *mut u8, total: usize) {
        unsafe {
            debug_fill_fence(run);
            debug_fill(
                run.add(fence_size()),
                total - 2 * fence_size(),
                NEW_MEMORY,
            );
            debug_fill_fence(run.add(total - fence_size()));
        }
    }
}

impl FreeList for OrderedFreeList {
    const MIN_ELEMENT_SIZE: usize = core::mem::size_of::<*mut u8>();
    const MIN_ELEMENT_ALIGNMENT: usize = core::mem::align_of::<*mut u8>();
    const SUPPORTS_ARRAYS: bool = true;

    fn new(node_size: usize) -> Self {
        Self {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            node_size: node_size.max(Self::MIN_ELEMENT_SIZE),
            capacity: 0,
            last_dealloc: core::ptr::null_mut(),
            last_dealloc_prev: core::ptr::null_mut(),
        }
    }

    fn min_block_size(node_size: usize, n_nodes: usize) -> usize {
        slot_stride(node_size.max(Self::MIN_ELEMENT_SIZE)) * n_nodes
    }

    unsafe fn insert(&mut self, mem: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.insert_region(mem.as_ptr(), size) };
    }

    fn usable_size(&self, size: usize) -> usize {
        (size / self.stride()) * self.stride()
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        if self.first.is_null() {
            return None;
        }
        let slot = self.first;
        // SAFETY: the head's lower neighbor is null.
        let next = unsafe { xor_other(slot, core::ptr::null_mut()) };
        if next.is_null() {
            self.last = core::ptr::null_mut();
        } else {
            // SAFETY: next is a linked slot whose lower neighbor was slot.
            unsafe { xor_exchange(next, slot, core::ptr::null_mut()) };
        }
        self.first = next;
        self.capacity -= 1;
        self.reset_hint();

        // SAFETY: the slot spans stride() bytes.
        unsafe {
            self.mark_issued(slot, self.stride());
            Some(slot_to_issued(slot))
        }
    }

    fn allocate_array(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 {
            return None;
        }
        let stride = self.stride();
        let wanted = slots_for_array(n, stride);
        if wanted > self.capacity {
            return None;
        }
        if wanted == 1 {
            return self.allocate();
        }

        let mut prev: *mut u8 = core::ptr::null_mut();
        let mut cur = self.first;
        let mut run_start = cur;
        let mut run_start_prev: *mut u8 = core::ptr::null_mut();
        let mut count = 0usize;

        while !cur.is_null() {
            if count == 0 || cur as usize != prev as usize + stride {
                run_start = cur;
                run_start_prev = prev;
                count = 1;
            } else {
                count += 1;
            }

            if count == wanted {
                // SAFETY: cur is linked with prev as its lower neighbor.
                let next = unsafe { xor_other(cur, prev) };
                // SAFETY: splicing rewires only live linked slots.
                unsafe {
                    if run_start_prev.is_null() {
                        self.first = next;
                    } else {
                        xor_exchange(run_start_prev, run_start, next);
                    }
                    if next.is_null() {
                        self.last = run_start_prev;
                    } else {
                        xor_exchange(next, cur, run_start_prev);
                    }
                }
                self.capacity -= wanted;
                self.reset_hint();

                // SAFETY: the run spans wanted * stride writable bytes.
                unsafe {
                    self.mark_issued(run_start, wanted * stride);
                    return Some(slot_to_issued(run_start));
                }
            }

            // SAFETY: cur is linked with prev as its lower neighbor.
            let next = unsafe { xor_other(cur, prev) };
            prev = cur;
            cur = next;
        }
        None
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // SAFETY: ptr was issued by allocate, so the slot starts one fence
        // earlier and spans stride() bytes.
        unsafe {
            let slot = issued_to_slot(ptr);
            debug_check_fence(ptr.as_ptr(), self.node_size, slot);
            debug_check_fence(
                ptr.as_ptr(),
                self.node_size,
                slot.add(self.stride() - fence_size()),
            );
            debug_fill(ptr.as_ptr(), self.node_size, FREED_MEMORY);
            self.insert_region(slot, self.stride());
        }
    }

    unsafe fn deallocate_array(&mut self, ptr: NonNull<u8>, n: usize) {
        let stride = self.stride();
        let count = slots_for_array(n, stride);
        let total = count * stride;
        // SAFETY: ptr was issued by allocate_array with the same n.
        unsafe {
            let run = issued_to_slot(ptr);
            debug_check_fence(ptr.as_ptr(), n, run);
            debug_check_fence(ptr.as_ptr(), n, run.add(total - fence_size()));
            debug_fill(ptr.as_ptr(), total - 2 * fence_size(), FREED_MEMORY);
            self.insert_region(run, total);
        }
    }

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn alignment(&self) -> usize {
        crate::utils::alignment_for(self.node_size)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_list(node_size: usize, nodes: usize) -> (OrderedFreeList, Vec<u8>) {
        let mut list = OrderedFreeList::new(node_size);
        let mut mem = vec![0u8; OrderedFreeList::min_block_size(node_size, nodes)];
        unsafe { list.insert(NonNull::new(mem.as_mut_ptr()).unwrap(), mem.len()) };
        (list, mem)
    }

    #[test]
    fn allocates_in_ascending_address_order() {
        let (mut list, _mem) = filled_list(8, 8);
        let mut previous: Option<usize> = None;
        while let Some(ptr) = list.allocate() {
            let addr = ptr.as_ptr() as usize;
            if let Some(prev) = previous {
                assert!(addr > prev, "allocation order must ascend");
            }
            previous = Some(addr);
        }
    }

    #[test]
    fn deallocate_restores_capacity_and_order() {
        let (mut list, _mem) = filled_list(8, 4);
        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        let c = list.allocate().unwrap();
        assert_eq!(list.capacity(), 1);

        // Free out of order; the list re-sorts by address.
        unsafe {
            list.deallocate(b);
            list.deallocate(a);
            list.deallocate(c);
        }
        assert_eq!(list.capacity(), 4);

        // Lowest address comes back first.
        let again = list.allocate().unwrap();
        assert_eq!(again.as_ptr(), a.as_ptr());
    }

    #[test]
    fn array_allocation_is_contiguous() {
        let (mut list, _mem) = filled_list(8, 16);
        let n = 5 * 8;
        let run = list.allocate_array(n).expect("run of 5 slots expected");

        // The whole span must be writable as one region.
        unsafe { core::ptr::write_bytes(run.as_ptr(), 0x7E, n) };
        assert_eq!(unsafe { *run.as_ptr().add(n - 1) }, 0x7E);

        unsafe { list.deallocate_array(run, n) };
        assert_eq!(list.capacity(), 16);
    }

    #[test]
    fn array_allocation_skips_holes() {
        let (mut list, _mem) = filled_list(8, 8);

        // Punch a hole: take three singles, free the outer two.
        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        let c = list.allocate().unwrap();
        unsafe {
            list.deallocate(a);
            list.deallocate(c);
        }

        // A 5-slot run exists past the hole at b.
        let n = 5 * 8;
        let run = list.allocate_array(n).expect("run exists past the hole");
        assert!(run.as_ptr() > b.as_ptr());

        unsafe {
            list.deallocate_array(run, n);
            list.deallocate(b);
        }
        assert_eq!(list.capacity(), 8);
    }

    #[test]
    fn array_may_fail_despite_capacity() {
        let (mut list, _mem) = filled_list(8, 6);

        // Fragment the region into alternating free/issued slots.
        let slots: Vec<_> = core::iter::from_fn(|| list.allocate()).collect();
        assert_eq!(slots.len(), 6);
        for pair in slots.chunks(2) {
            unsafe { list.deallocate(pair[0]) };
        }
        assert_eq!(list.capacity(), 3);

        assert!(list.allocate_array(3 * 8).is_none());

        for pair in slots.chunks(2) {
            unsafe { list.deallocate(pair[1]) };
        }
    }

    #[test]
    fn hint_survives_interleaved_frees() {
        let (mut list, _mem) = filled_list(16, 12);
        let mut taken: Vec<_> = core::iter::from_fn(|| list.allocate()).collect();
        assert_eq!(taken.len(), 12);

        // Free in ascending order (hint hit), then the rest descending.
        for ptr in taken.drain(..6) {
            unsafe { list.deallocate(ptr) };
        }
        for ptr in taken.into_iter().rev() {
            unsafe { list.deallocate(ptr) };
        }
        assert_eq!(list.capacity(), 12);

        // Everything is linked: a full drain sees every slot exactly once.
        let mut drained = 0;
        while list.allocate().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 12);
    }
}
