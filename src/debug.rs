//! Debug instrumentation: fill patterns, fences, and global failure handlers
//!
//! Debug builds fill memory with a distinct byte pattern on every
//! allocation-relevant state change and place fence bytes around each issued
//! region. Fence corruption, invalid-pointer deallocation and leaks are
//! reported through process-wide handler slots that can be swapped at
//! runtime.
//!
//! All instrumentation compiles to nothing in release builds.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocatorInfo;

// ============================================================================
// Fill patterns
// ============================================================================

/// Byte written over memory an allocator acquired for internal bookkeeping
pub const INTERNAL_MEMORY: u8 = 0xAB;
/// Byte written over internal memory that was handed back
pub const INTERNAL_FREED: u8 = 0xFB;
/// Byte written over memory freshly issued to the caller
pub const NEW_MEMORY: u8 = 0xCD;
/// Byte written over memory returned by the caller
pub const FREED_MEMORY: u8 = 0xDD;
/// Byte written over padding inserted to satisfy alignment
pub const ALIGNMENT_PADDING: u8 = 0xED;
/// Byte written into the fence regions around each issued allocation
pub const FENCE_MEMORY: u8 = 0xFD;

/// Number of fence bytes placed before and after every issued allocation
///
/// A full [`MAX_ALIGNMENT`](crate::utils::MAX_ALIGNMENT) unit so that fences
/// never weaken the alignment of the issued pointer. Zero in release builds.
#[inline(always)]
pub const fn fence_size() -> usize {
    if cfg!(debug_assertions) {
        crate::utils::MAX_ALIGNMENT
    } else {
        0
    }
}

/// Fills `size` bytes at `ptr` with `pattern` in debug builds
///
/// # Safety
/// `ptr` must be valid for writes of `size` bytes.
#[inline(always)]
pub(crate) unsafe fn debug_fill(ptr: *mut u8, size: usize, pattern: u8) {
    if cfg!(debug_assertions) && size != 0 {
        unsafe { core::ptr::write_bytes(ptr, pattern, size) };
    }
}

/// Writes the fence pattern into `[ptr, ptr + fence_size())`
///
/// # Safety
/// `ptr` must be valid for writes of `fence_size()` bytes.
#[inline(always)]
pub(crate) unsafe fn debug_fill_fence(ptr: *mut u8) {
    unsafe { debug_fill(ptr, fence_size(), FENCE_MEMORY) };
}

/// Checks the fence bytes at `fence` and fires the buffer-overflow handler
/// on corruption
///
/// `block` and `size` describe the issued allocation the fence guards.
///
/// # Safety
/// `fence` must be valid for reads of `fence_size()` bytes.
pub(crate) unsafe fn debug_check_fence(block: *const u8, size: usize, fence: *const u8) {
    if !cfg!(debug_assertions) {
        return;
    }
    for i in 0..fence_size() {
        let byte = unsafe { *fence.add(i) };
        if byte != FENCE_MEMORY {
            buffer_overflow_handler()(block, size, unsafe { fence.add(i) });
            return;
        }
    }
}

// ============================================================================
// Handler slots
// ============================================================================

/// Handler invoked when an allocator is destroyed with outstanding memory
///
/// Receives the allocator's info and the leaked byte amount (negative when
/// more was freed than allocated).
pub type LeakHandler = fn(AllocatorInfo, isize);

/// Handler invoked when a deallocation passes a pointer the allocator never
/// issued (or issued twice)
pub type InvalidPointerHandler = fn(AllocatorInfo, *const u8);

/// Handler invoked when fence bytes around an allocation were overwritten
///
/// Receives the allocation's address, its size and the corrupted write
/// position.
pub type BufferOverflowHandler = fn(*const u8, usize, *const u8);

fn default_leak_handler(info: AllocatorInfo, amount: isize) {
    tracing::error!(allocator = %info, amount, "allocator destroyed while owning live memory");
}

fn default_invalid_pointer_handler(info: AllocatorInfo, ptr: *const u8) {
    tracing::error!(allocator = %info, ptr = ?ptr, "deallocation of a pointer not issued by this allocator");
    std::process::abort();
}

fn default_buffer_overflow_handler(block: *const u8, size: usize, write_ptr: *const u8) {
    tracing::error!(block = ?block, size, at = ?write_ptr, "heap buffer overflow detected at deallocation");
    std::process::abort();
}

static LEAK_HANDLER: AtomicUsize = AtomicUsize::new(0);
static INVALID_POINTER_HANDLER: AtomicUsize = AtomicUsize::new(0);
static BUFFER_OVERFLOW_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Exchanges the process-wide leak handler, returning the previous one
///
/// The default handler logs the leak and continues.
pub fn set_leak_handler(handler: LeakHandler) -> LeakHandler {
    let old = LEAK_HANDLER.swap(handler as usize, Ordering::AcqRel);
    if old == 0 {
        default_leak_handler
    } else {
        // SAFETY: only `LeakHandler` values are ever stored in the slot.
        unsafe { core::mem::transmute::<usize, LeakHandler>(old) }
    }
}

/// The currently installed leak handler
pub fn leak_handler() -> LeakHandler {
    match LEAK_HANDLER.load(Ordering::Acquire) {
        0 => default_leak_handler,
        raw => unsafe { core::mem::transmute::<usize, LeakHandler>(raw) },
    }
}

/// Exchanges the process-wide invalid-pointer handler
///
/// The default handler logs and aborts.
pub fn set_invalid_pointer_handler(handler: InvalidPointerHandler) -> InvalidPointerHandler {
    let old = INVALID_POINTER_HANDLER.swap(handler as usize, Ordering::AcqRel);
    if old == 0 {
        default_invalid_pointer_handler
    } else {
        // SAFETY: only `InvalidPointerHandler` values are ever stored.
        unsafe { core::mem::transmute::<usize, InvalidPointerHandler>(old) }
    }
}

/// The currently installed invalid-pointer handler
pub fn invalid_pointer_handler() -> InvalidPointerHandler {
    match INVALID_POINTER_HANDLER.load(Ordering::Acquire) {
        0 => default_invalid_pointer_handler,
        raw => unsafe { core::mem::transmute::<usize, InvalidPointerHandler>(raw) },
    }
}

/// Exchanges the process-wide buffer-overflow handler
///
/// The default handler logs and aborts.
pub fn set_buffer_overflow_handler(handler: BufferOverflowHandler) -> BufferOverflowHandler {
    let old = BUFFER_OVERFLOW_HANDLER.swap(handler as usize, Ordering::AcqRel);
    if old == 0 {
        default_buffer_overflow_handler
    } else {
        // SAFETY: only `BufferOverflowHandler` values are ever stored.
        unsafe { core::mem::transmute::<usize, BufferOverflowHandler>(old) }
    }
}

/// The currently installed buffer-overflow handler
pub fn buffer_overflow_handler() -> BufferOverflowHandler {
    match BUFFER_OVERFLOW_HANDLER.load(Ordering::Acquire) {
        0 => default_buffer_overflow_handler,
        raw => unsafe { core::mem::transmute::<usize, BufferOverflowHandler>(raw) },
    }
}

/// Fires the invalid-pointer handler for `ptr` when pointer checks are on
#[inline]
pub(crate) fn on_invalid_pointer(info: AllocatorInfo, ptr: *const u8) {
    if cfg!(debug_assertions) {
        invalid_pointer_handler()(info, ptr);
    }
}

// ============================================================================
// Leak accounting
// ============================================================================

/// Per-allocator balance of allocated minus deallocated bytes
///
/// Fires the leak handler from the owning allocator's destructor when the
/// balance is non-zero. Accounting only runs in debug builds; the counter is
/// a zero-cost shell otherwise.
#[derive(Debug, Default)]
pub(crate) struct LeakCounter {
    balance: Cell<isize>,
}

impl LeakCounter {
    pub(crate) const fn new() -> Self {
        Self {
            balance: Cell::new(0),
        }
    }

    #[inline]
    pub(crate) fn on_allocate(&self, bytes: usize) {
        if cfg!(debug_assertions) {
            self.balance.set(self.balance.get() + bytes as isize);
        }
    }

    #[inline]
    pub(crate) fn on_deallocate(&self, bytes: usize) {
        if cfg!(debug_assertions) {
            self.balance.set(self.balance.get() - bytes as isize);
        }
    }

    /// Current balance in bytes
    pub(crate) fn leaked(&self) -> isize {
        self.balance.get()
    }

    /// Invoked from allocator destructors
    pub(crate) fn report(&self, info: AllocatorInfo) {
        if cfg!(debug_assertions) && self.leaked() != 0 {
            leak_handler()(info, self.leaked());
        }
    }
}

/// Issued-pointer view of a fenced allocation
///
/// The lists and the stack allocate `fence | payload | fence` and issue the
/// payload pointer; these helpers convert between the two views.
#[inline(always)]
pub(crate) unsafe fn issued_to_slot(ptr: NonNull<u8>) -> *mut u8 {
    unsafe { ptr.as_ptr().sub(fence_size()) }
}

#[inline(always)]
pub(crate) unsafe fn slot_to_issued(slot: *mut u8) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(slot.add(fence_size())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_swap_roundtrip() {
        fn quiet(_: AllocatorInfo, _: isize) {}

        let previous = set_leak_handler(quiet);
        assert_eq!(leak_handler() as usize, quiet as usize);
        set_leak_handler(previous);
    }

    #[test]
    fn leak_counter_balance() {
        let counter = LeakCounter::new();
        counter.on_allocate(128);
        counter.on_deallocate(64);
        if cfg!(debug_assertions) {
            assert_eq!(counter.leaked(), 64);
            counter.on_deallocate(64);
            assert_eq!(counter.leaked(), 0);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn fence_fill_and_check() {
        let mut buffer = [0u8; 64];
        unsafe {
            debug_fill_fence(buffer.as_mut_ptr());
        }
        assert!(buffer[..fence_size()].iter().all(|&b| b == FENCE_MEMORY));
    }
}
