//! Page-granularity virtual memory primitives
//!
//! Contract: always [`reserve`] first, [`commit`] pages before touching
//! them, then [`decommit`] and finally [`release`]. Reserved-but-uncommitted
//! pages cost address space only.
//!
//! [`VirtualAllocator`] serves whole fresh reservations per request;
//! [`VirtualBlockAllocator`] pre-reserves a fixed range and commits it one
//! block at a time.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{BlockAllocator, MemoryBlock};
use crate::error::{check_node_request, AllocError, AllocResult, AllocatorInfo};
use crate::traits::{RawAllocator, ThreadSafeAllocator};
use crate::utils::align_up;

/// Size of a virtual memory page in bytes
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn query_page_size() -> usize {
            // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }

        /// Reserves `n_pages` of address space without committing them
        ///
        /// Returns `None` when the address space is exhausted.
        pub fn reserve(n_pages: usize) -> Option<NonNull<u8>> {
            let len = n_pages.checked_mul(page_size())?;
            // SAFETY: anonymous PROT_NONE mapping; no file descriptor involved.
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(ptr as *mut u8)
            }
        }

        /// Releases a reservation made by [`reserve`]
        ///
        /// # Safety
        /// `ptr` must come from `reserve(n_pages)` with the same page count,
        /// and all pages must have been decommitted.
        pub unsafe fn release(ptr: NonNull<u8>, n_pages: usize) {
            unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, n_pages * page_size()) };
        }

        /// Commits `n_pages` starting at `ptr`, making them accessible
        ///
        /// # Safety
        /// The range must lie within a live reservation.
        pub unsafe fn commit(ptr: NonNull<u8>, n_pages: usize) -> bool {
            let result = unsafe {
                libc::mprotect(
                    ptr.as_ptr() as *mut libc::c_void,
                    n_pages * page_size(),
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            result == 0
        }

        /// Decommits `n_pages` starting at `ptr`; contents are discarded
        ///
        /// # Safety
        /// The range must lie within a live reservation and be committed.
        pub unsafe fn decommit(ptr: NonNull<u8>, n_pages: usize) {
            let len = n_pages * page_size();
            unsafe {
                libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, libc::PROT_NONE);
                libc::madvise(ptr.as_ptr() as *mut libc::c_void, len, libc::MADV_DONTNEED);
            }
        }
    } else if #[cfg(windows)] {
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
        use winapi::um::sysinfoapi::GetSystemInfo;
        use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

        fn query_page_size() -> usize {
            let mut info = unsafe { core::mem::zeroed() };
            unsafe { GetSystemInfo(&mut info) };
            info.dwPageSize as usize
        }

        /// Reserves `n_pages` of address space without committing them
        pub fn reserve(n_pages: usize) -> Option<NonNull<u8>> {
            let len = n_pages.checked_mul(page_size())?;
            let ptr = unsafe {
                VirtualAlloc(core::ptr::null_mut(), len, MEM_RESERVE, PAGE_NOACCESS)
            };
            NonNull::new(ptr as *mut u8)
        }

        /// Releases a reservation made by [`reserve`]
        ///
        /// # Safety
        /// `ptr` must come from `reserve` and all pages must be decommitted.
        pub unsafe fn release(ptr: NonNull<u8>, _n_pages: usize) {
            unsafe { VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE) };
        }

        /// Commits `n_pages` starting at `ptr`, making them accessible
        ///
        /// # Safety
        /// The range must lie within a live reservation.
        pub unsafe fn commit(ptr: NonNull<u8>, n_pages: usize) -> bool {
            let result = unsafe {
                VirtualAlloc(
                    ptr.as_ptr() as *mut _,
                    n_pages * page_size(),
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            !result.is_null()
        }

        /// Decommits `n_pages` starting at `ptr`; contents are discarded
        ///
        /// # Safety
        /// The range must lie within a live reservation and be committed.
        pub unsafe fn decommit(ptr: NonNull<u8>, n_pages: usize) {
            unsafe {
                VirtualFree(ptr.as_ptr() as *mut _, n_pages * page_size(), MEM_DECOMMIT)
            };
        }
    }
}

/// Number of pages needed to hold `bytes`
#[inline]
pub fn pages_for(bytes: usize) -> usize {
    align_up(bytes, page_size()) / page_size()
}

/// Stateless allocator serving each request from its own reservation
///
/// Every node becomes a fresh reserve+commit; deallocation decommits and
/// releases. Only sensible for very large, long-lived allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualAllocator;

impl VirtualAllocator {
    /// Creates the allocator; a zero-cost operation
    #[inline]
    pub const fn new() -> Self {
        VirtualAllocator
    }
}

// SAFETY: each node is a private mapping, disjoint from every other.
unsafe impl RawAllocator for VirtualAllocator {
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::stateless("rawmem::VirtualAllocator")
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        check_node_request(
            self.info(),
            size,
            alignment,
            self.max_node_size(),
            self.max_alignment(),
        )?;

        let n_pages = pages_for(size.max(1));
        let ptr = reserve(n_pages).ok_or(AllocError::OutOfMemory {
            info: self.info(),
            requested: size,
        })?;
        // SAFETY: freshly reserved range of exactly n_pages.
        if unsafe { commit(ptr, n_pages) } {
            Ok(ptr)
        } else {
            // SAFETY: nothing was committed; the bare reservation goes back.
            unsafe { release(ptr, n_pages) };
            Err(AllocError::OutOfMemory {
                info: self.info(),
                requested: size,
            })
        }
    }

    unsafe fn deallocate_node(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        let n_pages = pages_for(size.max(1));
        // SAFETY: caller guarantees ptr came from allocate_node with size.
        unsafe {
            decommit(ptr, n_pages);
            release(ptr, n_pages);
        }
    }

    fn max_alignment(&self) -> usize {
        page_size()
    }
}

impl ThreadSafeAllocator for VirtualAllocator {}

/// Block allocator over one up-front reservation
///
/// Reserves `block_size * block_count` bytes of address space at
/// construction, commits one block per [`allocate_block`] call and decommits
/// on LIFO deallocation. Exhausting the reservation raises
/// `OutOfFixedMemory`.
///
/// [`allocate_block`]: BlockAllocator::allocate_block
#[derive(Debug)]
pub struct VirtualBlockAllocator {
    reservation: NonNull<u8>,
    block_size: usize,
    block_count: usize,
    committed: usize,
}

impl VirtualBlockAllocator {
    /// Reserves address space for `block_count` blocks of `block_size` bytes
    ///
    /// `block_size` is rounded up to whole pages.
    pub fn new(block_size: usize, block_count: usize) -> AllocResult<Self> {
        let block_size = align_up(block_size.max(1), page_size());
        let total_pages = pages_for(block_size) * block_count.max(1);
        let reservation = reserve(total_pages).ok_or(AllocError::OutOfMemory {
            info: AllocatorInfo::stateless("rawmem::VirtualBlockAllocator"),
            requested: total_pages * page_size(),
        })?;
        Ok(Self {
            reservation,
            block_size,
            block_count,
            committed: 0,
        })
    }

    /// Size of the whole reservation in bytes
    pub fn reservation_size(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Number of currently committed blocks
    pub fn committed_blocks(&self) -> usize {
        self.committed
    }
}

// SAFETY: blocks are disjoint slices of one reservation, committed before
// they are handed out.
unsafe impl BlockAllocator for VirtualBlockAllocator {
    fn allocate_block(&mut self) -> AllocResult<MemoryBlock> {
        let info = AllocatorInfo::new("rawmem::VirtualBlockAllocator", self);
        if self.committed == self.block_count {
            return Err(AllocError::OutOfFixedMemory {
                info,
                requested: self.block_size,
            });
        }

        // SAFETY: committed < block_count keeps the offset in the reservation.
        let ptr = unsafe {
            NonNull::new_unchecked(
                self.reservation.as_ptr().add(self.committed * self.block_size),
            )
        };
        // SAFETY: the block lies within our reservation.
        if !unsafe { commit(ptr, pages_for(self.block_size)) } {
            return Err(AllocError::OutOfMemory {
                info,
                requested: self.block_size,
            });
        }
        self.committed += 1;
        Ok(MemoryBlock::new(ptr, self.block_size))
    }

    unsafe fn deallocate_block(&mut self, block: MemoryBlock) {
        debug_assert!(self.committed > 0);
        debug_assert_eq!(
            block.memory.as_ptr() as usize,
            self.reservation.as_ptr() as usize + (self.committed - 1) * self.block_size,
            "virtual blocks must be deallocated in LIFO order"
        );
        // SAFETY: the block was committed by allocate_block.
        unsafe { decommit(block.memory, pages_for(self.block_size)) };
        self.committed -= 1;
    }

    fn next_block_size(&self) -> usize {
        self.block_size
    }
}

// SAFETY: the reservation is exclusively owned and moves with the value.
unsafe impl Send for VirtualBlockAllocator {}

impl Drop for VirtualBlockAllocator {
    fn drop(&mut self) {
        let total_pages = pages_for(self.block_size) * self.block_count.max(1);
        // SAFETY: the reservation came from reserve() in new().
        unsafe {
            if self.committed > 0 {
                decommit(self.reservation, pages_for(self.block_size) * self.committed);
            }
            release(self.reservation, total_pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn reserve_commit_roundtrip() {
        let ptr = reserve(2).expect("reservation failed");
        unsafe {
            assert!(commit(ptr, 2));
            // Committed pages must be writable.
            core::ptr::write_bytes(ptr.as_ptr(), 0x42, 2 * page_size());
            assert_eq!(*ptr.as_ptr(), 0x42);
            decommit(ptr, 2);
            release(ptr, 2);
        }
    }

    #[test]
    fn virtual_allocator_roundtrip() {
        let alloc = VirtualAllocator::new();
        let ptr = alloc.allocate_node(3 * page_size(), page_size()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 1, 3 * page_size());
            alloc.deallocate_node(ptr, 3 * page_size(), page_size());
        }
    }

    #[test]
    fn block_allocator_commits_one_block_at_a_time() {
        let mut alloc = VirtualBlockAllocator::new(page_size(), 2).unwrap();
        assert_eq!(alloc.committed_blocks(), 0);

        let first = alloc.allocate_block().unwrap();
        let second = alloc.allocate_block().unwrap();
        assert_eq!(alloc.committed_blocks(), 2);
        assert!(matches!(
            alloc.allocate_block(),
            Err(AllocError::OutOfFixedMemory { .. })
        ));

        unsafe {
            alloc.deallocate_block(second);
            alloc.deallocate_block(first);
        }
        assert_eq!(alloc.committed_blocks(), 0);
    }
}
