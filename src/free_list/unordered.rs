//! Single-linked free list, the fastest node pool backend

use core::ptr::NonNull;

use super::{slot_stride, FreeList};
use crate::debug::{
    debug_check_fence, debug_fill, debug_fill_fence, fence_size, issued_to_slot, slot_to_issued,
    FREED_MEMORY, NEW_MEMORY,
};

/// LIFO free list linked through an in-slot pointer
///
/// Insert subdivides a region into slots and chains them; allocate pops the
/// head, deallocate pushes it back. The order of freed slots is undefined
/// and arrays are not supported.
#[derive(Debug)]
pub struct UnorderedFreeList {
    first: *mut u8,
    node_size: usize,
    capacity: usize,
}

impl UnorderedFreeList {
    #[inline]
    fn stride(&self) -> usize {
        slot_stride(self.node_size)
    }

    /// Pops the head slot
    fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.first.is_null() {
            return None;
        }
        let slot = self.first;
        // SAFETY: free slots store the next link in their first bytes.
        self.first = unsafe { (slot as *mut *mut u8).read_unaligned() };
        self.capacity -= 1;

        let payload = self.node_size;
        // SAFETY: the slot spans stride() bytes: fence, payload, fence.
        unsafe {
            debug_fill_fence(slot);
            debug_fill(slot.add(fence_size()), payload, NEW_MEMORY);
            debug_fill_fence(slot.add(fence_size() + payload));
            Some(slot_to_issued(slot))
        }
    }

    /// Pushes `slot` as the new head
    ///
    /// # Safety
    /// `slot` must be an unissued slot of this list's stride.
    unsafe fn push(&mut self, slot: *mut u8) {
        // SAFETY: the slot is free again, its bytes are ours.
        unsafe {
            debug_fill(slot.add(fence_size()), self.node_size, FREED_MEMORY);
            (slot as *mut *mut u8).write_unaligned(self.first);
        }
        self.first = slot;
        self.capacity += 1;
    }
}

impl FreeList for UnorderedFreeList {
    const MIN_ELEMENT_SIZE: usize = core::mem::size_of::<*mut u8>();
    const MIN_ELEMENT_ALIGNMENT: usize = core::mem::align_of::<*mut u8>();
    const SUPPORTS_ARRAYS: bool = false;

    fn new(node_size: usize) -> Self {
        Self {
            first: core::ptr::null_mut(),
            node_size: node_size.max(Self::MIN_ELEMENT_SIZE),
            capacity: 0,
        }
    }

    fn min_block_size(node_size: usize, n_nodes: usize) -> usize {
        slot_stride(node_size.max(Self::MIN_ELEMENT_SIZE)) * n_nodes
    }

    unsafe fn insert(&mut self, mem: NonNull<u8>, size: usize) {
        let stride = self.stride();
        let count = size / stride;
        let mut slot = mem.as_ptr();
        for _ in 0..count {
            // SAFETY: each slot lies within the inserted region.
            unsafe {
                self.push(slot);
                slot = slot.add(stride);
            }
        }
    }

    fn usable_size(&self, size: usize) -> usize {
        (size / self.stride()) * self.stride()
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        self.pop()
    }

    fn allocate_array(&mut self, _n: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // SAFETY: ptr was issued by pop, so the slot starts one fence earlier.
        unsafe {
            let slot = issued_to_slot(ptr);
            debug_check_fence(ptr.as_ptr(), self.node_size, slot);
            debug_check_fence(
                ptr.as_ptr(),
                self.node_size,
                slot.add(fence_size() + self.node_size),
            );
            self.push(slot);
        }
    }

    unsafe fn deallocate_array(&mut self, _ptr: NonNull<u8>, _n: usize) {
        unreachable!("unordered free list never issues arrays")
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

    fn backing(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    #[test]
    fn insert_then_drain() {
        let mut list = UnorderedFreeList::new(16);
        let mut mem = backing(UnorderedFreeList::min_block_size(16, 8));
        unsafe { list.insert(NonNull::new(mem.as_mut_ptr()).unwrap(), mem.len()) };
        assert_eq!(list.capacity(), 8);
        assert_eq!(list.node_size(), 16);

        let mut taken = Vec::new();
        while let Some(ptr) = list.allocate() {
            taken.push(ptr);
        }
        assert_eq!(taken.len(), 8);
        assert!(list.is_empty());

        for ptr in taken {
            unsafe { list.deallocate(ptr) };
        }
        assert_eq!(list.capacity(), 8);
    }

    #[test]
    fn small_node_size_is_clamped() {
        let list = UnorderedFreeList::new(1);
        assert_eq!(list.node_size(), UnorderedFreeList::MIN_ELEMENT_SIZE);
    }

    #[test]
    fn no_array_support() {
        let mut list = UnorderedFreeList::new(8);
        let mut mem = backing(UnorderedFreeList::min_block_size(8, 4));
        unsafe { list.insert(NonNull::new(mem.as_mut_ptr()).unwrap(), mem.len()) };
        assert!(list.allocate_array(16).is_none());
    }

    #[test]
    fn issued_slots_do_not_overlap() {
        let mut list = UnorderedFreeList::new(8);
        let mut mem = backing(UnorderedFreeList::min_block_size(8, 4));
        unsafe { list.insert(NonNull::new(mem.as_mut_ptr()).unwrap(), mem.len()) };

        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        let distance = (a.as_ptr() as usize).abs_diff(b.as_ptr() as usize);
        assert!(distance >= 8);
        unsafe {
            list.deallocate(a);
            list.deallocate(b);
        }
    }
}
