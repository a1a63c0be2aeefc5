//! Chunked free list for small nodes
//!
//! Slots live in *chunks* of at most 255 nodes. A chunk's header keeps three
//! 8-bit fields: the index of the first free slot, the number of free slots,
//! and the total node count. Free slots within a chunk are linked by 8-bit
//! indices stored in the slot's first byte, so the per-node overhead is one
//! byte regardless of node size; nodes can be as small as a single byte.
//!
//! Chunks form a doubly-linked ring. Allocation and deallocation each keep a
//! cursor chunk and walk the ring on a miss; the deallocation walk alternates
//! between both directions until it finds the owning chunk.

use core::ptr::NonNull;

use super::{slot_stride, FreeList};
use crate::debug::{
    debug_check_fence, debug_fill, debug_fill_fence, fence_size, issued_to_slot, on_invalid_pointer,
    slot_to_issued, FREED_MEMORY, NEW_MEMORY,
};
use crate::error::AllocatorInfo;
use crate::utils::{align_up, MAX_ALIGNMENT};

const LIST_INFO: AllocatorInfo = AllocatorInfo::stateless("rawmem::SmallFreeList");

/// Header embedded at the start of every chunk
#[repr(C)]
struct ChunkHeader {
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
    /// Index of the first free slot in this chunk
    first_free: u8,
    /// Number of free slots; never exceeds `no_nodes`
    capacity: u8,
    /// Total slots in this chunk; fixed after insertion
    no_nodes: u8,
}

/// Bytes between a chunk's start and its first slot
const CHUNK_HEADER_SIZE: usize = align_up(core::mem::size_of::<ChunkHeader>(), MAX_ALIGNMENT);
/// Maximum slots addressable by the 8-bit index links
const CHUNK_MAX_NODES: usize = u8::MAX as usize;

/// First slot of a chunk
///
/// # Safety
/// `chunk` must point at a live chunk header.
#[inline]
unsafe fn chunk_memory(chunk: *mut ChunkHeader) -> *mut u8 {
    unsafe { (chunk as *mut u8).add(CHUNK_HEADER_SIZE) }
}

/// Whether `slot` lies within `chunk`'s slot area
///
/// # Safety
/// `chunk` must point at a live chunk header.
#[inline]
unsafe fn chunk_contains(chunk: *mut ChunkHeader, slot: *const u8, stride: usize) -> bool {
    unsafe {
        let begin = chunk_memory(chunk) as usize;
        let addr = slot as usize;
        addr >= begin && addr < begin + (*chunk).no_nodes as usize * stride
    }
}

/// Chunk-based free list for node sizes down to one byte
///
/// Arrays are not supported; allocation alignment is 1. The pool layer
/// guarantees byte granularity suffices because all slots within a chunk
/// share the same offset pattern.
#[derive(Debug)]
pub struct SmallFreeList {
    /// Some chunk of the ring, null when empty
    ring: *mut ChunkHeader,
    alloc_chunk: *mut ChunkHeader,
    dealloc_chunk: *mut ChunkHeader,
    node_size: usize,
    capacity: usize,
    chunk_count: usize,
}

impl SmallFreeList {
    #[inline]
    fn stride(&self) -> usize {
        slot_stride(self.node_size)
    }

    /// Bytes one full chunk occupies, header included
    fn full_chunk_size(stride: usize) -> usize {
        CHUNK_HEADER_SIZE + CHUNK_MAX_NODES * stride
    }

    /// Links `chunk` into the ring
    ///
    /// # Safety
    /// `chunk` must be a freshly written header outside the ring.
    unsafe fn ring_insert(&mut self, chunk: *mut ChunkHeader) {
        if self.ring.is_null() {
            // SAFETY: chunk is live; a single-element ring points at itself.
            unsafe {
                (*chunk).prev = chunk;
                (*chunk).next = chunk;
            }
            self.ring = chunk;
            self.alloc_chunk = chunk;
            self.dealloc_chunk = chunk;
        } else {
            // SAFETY: ring and its neighbors are live chunk headers.
            unsafe {
                let after = self.ring;
                let before = (*after).prev;
                (*chunk).next = after;
                (*chunk).prev = before;
                (*before).next = chunk;
                (*after).prev = chunk;
            }
        }
        self.chunk_count += 1;
    }

    /// Finds a chunk with a free slot, walking the ring from `alloc_chunk`
    fn find_alloc_chunk(&mut self) -> Option<*mut ChunkHeader> {
        if self.ring.is_null() {
            return None;
        }
        let start = self.alloc_chunk;
        let mut chunk = start;
        loop {
            // SAFETY: every ring member is a live chunk header.
            if unsafe { (*chunk).capacity } > 0 {
                self.alloc_chunk = chunk;
                return Some(chunk);
            }
            chunk = unsafe { (*chunk).next };
            if chunk == start {
                return None;
            }
        }
    }

    /// Finds the chunk owning `slot`, walking both directions alternately
    fn find_dealloc_chunk(&mut self, slot: *const u8) -> Option<*mut ChunkHeader> {
        if self.ring.is_null() {
            return None;
        }
        let stride = self.stride();
        // SAFETY: cursors always point at live ring members.
        unsafe {
            if chunk_contains(self.dealloc_chunk, slot, stride) {
                return Some(self.dealloc_chunk);
            }
            let mut backward = (*self.dealloc_chunk).prev;
            let mut forward = (*self.dealloc_chunk).next;
            for _ in 0..self.chunk_count {
                if chunk_contains(backward, slot, stride) {
                    self.dealloc_chunk = backward;
                    return Some(backward);
                }
                if chunk_contains(forward, slot, stride) {
                    self.dealloc_chunk = forward;
                    return Some(forward);
                }
                backward = (*backward).prev;
                forward = (*forward).next;
            }
        }
        None
    }
}

impl FreeList for SmallFreeList {
    const MIN_ELEMENT_SIZE: usize = 1;
    const MIN_ELEMENT_ALIGNMENT: usize = 1;
    const SUPPORTS_ARRAYS: bool = false;

    fn new(node_size: usize) -> Self {
        Self {
            ring: core::ptr::null_mut(),
            alloc_chunk: core::ptr::null_mut(),
            dealloc_chunk: core::ptr::null_mut(),
            node_size: node_size.max(Self::MIN_ELEMENT_SIZE),
            capacity: 0,
            chunk_count: 0,
        }
    }

    fn min_block_size(node_size: usize, n_nodes: usize) -> usize {
        let stride = slot_stride(node_size.max(Self::MIN_ELEMENT_SIZE));
        let chunks = n_nodes.div_ceil(CHUNK_MAX_NODES);
        chunks.max(1) * Self::full_chunk_size(stride)
    }

    unsafe fn insert(&mut self, mem: NonNull<u8>, size: usize) {
        let stride = self.stride();
        let mut ptr = mem.as_ptr();
        let mut remaining = size;

        while remaining >= CHUNK_HEADER_SIZE + stride {
            let nodes = ((remaining - CHUNK_HEADER_SIZE) / stride).min(CHUNK_MAX_NODES);
            let chunk = ptr as *mut ChunkHeader;
            // SAFETY: the region is writable and large enough for a header
            // plus `nodes` slots.
            unsafe {
                chunk.write(ChunkHeader {
                    prev: core::ptr::null_mut(),
                    next: core::ptr::null_mut(),
                    first_free: 0,
                    capacity: nodes as u8,
                    no_nodes: nodes as u8,
                });
                let memory = chunk_memory(chunk);
                for i in 0..nodes {
                    *memory.add(i * stride) = (i + 1) as u8;
                }
                self.ring_insert(chunk);
            }
            self.capacity += nodes;

            let used = CHUNK_HEADER_SIZE + nodes * stride;
            // SAFETY: used <= remaining by the loop condition.
            ptr = unsafe { ptr.add(used) };
            remaining -= used;
        }
    }

    fn usable_size(&self, size: usize) -> usize {
        let stride = self.stride();
        let full = Self::full_chunk_size(stride);
        let full_chunks = size / full;
        let rest = size % full;
        let rest_nodes = if rest > CHUNK_HEADER_SIZE {
            (rest - CHUNK_HEADER_SIZE) / stride
        } else {
            0
        };
        (full_chunks * CHUNK_MAX_NODES + rest_nodes) * self.node_size
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        let chunk = self.find_alloc_chunk()?;
        let stride = self.stride();
        // SAFETY: the chunk is live and has a free slot.
        unsafe {
            let index = (*chunk).first_free as usize;
            debug_assert!(index < (*chunk).no_nodes as usize);
            let slot = chunk_memory(chunk).add(index * stride);
            (*chunk).first_free = *slot;
            (*chunk).capacity -= 1;
            self.capacity -= 1;

            debug_fill_fence(slot);
            debug_fill(slot.add(fence_size()), self.node_size, NEW_MEMORY);
            debug_fill_fence(slot.add(fence_size() + self.node_size));
            Some(slot_to_issued(slot))
        }
    }

    fn allocate_array(&mut self, _n: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let stride = self.stride();
        // SAFETY: ptr was issued by allocate, so the slot starts one fence
        // earlier.
        let slot = unsafe { issued_to_slot(ptr) };
        let Some(chunk) = self.find_dealloc_chunk(slot) else {
            on_invalid_pointer(LIST_INFO, ptr.as_ptr());
            return;
        };

        // SAFETY: the chunk owns the slot; its header and slot bytes are live.
        unsafe {
            debug_check_fence(ptr.as_ptr(), self.node_size, slot);
            debug_check_fence(
                ptr.as_ptr(),
                self.node_size,
                slot.add(stride - fence_size()),
            );

            let index = (slot as usize - chunk_memory(chunk) as usize) / stride;
            debug_assert!(index < (*chunk).no_nodes as usize);

            debug_fill(ptr.as_ptr(), self.node_size, FREED_MEMORY);
            *slot = (*chunk).first_free;
            (*chunk).first_free = index as u8;
            (*chunk).capacity += 1;
            debug_assert!((*chunk).capacity <= (*chunk).no_nodes);
        }
        self.capacity += 1;
    }

    unsafe fn deallocate_array(&mut self, _ptr: NonNull<u8>, _n: usize) {
        unreachable!("small free list never issues arrays")
    }

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn alignment(&self) -> usize {
        1
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_list(node_size: usize, nodes: usize) -> (SmallFreeList, Vec<u8>) {
        let mut list = SmallFreeList::new(node_size);
        let mut mem = vec![0u8; SmallFreeList::min_block_size(node_size, nodes)];
        unsafe { list.insert(NonNull::new(mem.as_mut_ptr()).unwrap(), mem.len()) };
        (list, mem)
    }

    #[test]
    fn one_byte_nodes() {
        let (mut list, _mem) = filled_list(1, 64);
        assert_eq!(list.node_size(), 1);
        assert_eq!(list.alignment(), 1);
        assert!(list.capacity() >= 64);

        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        unsafe {
            list.deallocate(a);
            list.deallocate(b);
        }
    }

    #[test]
    fn chunk_capacity_is_bounded() {
        // More nodes than one chunk can hold forces multiple chunks.
        let (list, _mem) = filled_list(4, 600);
        assert!(list.chunk_count >= 3);
        assert!(list.capacity() >= 600);
    }

    #[test]
    fn drain_and_refill() {
        let (mut list, _mem) = filled_list(4, 100);
        let initial = list.capacity();

        let taken: Vec<_> = (0..initial).map(|_| list.allocate().unwrap()).collect();
        assert!(list.is_empty());
        assert!(list.allocate().is_none());

        for ptr in taken {
            unsafe { list.deallocate(ptr) };
        }
        assert_eq!(list.capacity(), initial);
    }

    #[test]
    fn dealloc_walks_to_other_chunks() {
        let (mut list, _mem) = filled_list(4, 510);
        let initial = list.capacity();
        let taken: Vec<_> = (0..initial).map(|_| list.allocate().unwrap()).collect();

        // Free in reverse so the cursor chunk is usually wrong.
        for ptr in taken.into_iter().rev() {
            unsafe { list.deallocate(ptr) };
        }
        assert_eq!(list.capacity(), initial);
    }

    #[test]
    fn no_array_support() {
        let (mut list, _mem) = filled_list(4, 16);
        assert!(list.allocate_array(8).is_none());
    }
}
