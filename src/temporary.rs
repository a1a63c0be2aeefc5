//! Per-thread temporary allocations with scoped unwinding
//!
//! Each thread owns one lazily created [`MemoryStack`]. A
//! [`TemporaryAllocator`] records the stack top at construction and unwinds
//! on drop, so temporaries vanish with their scope. Scopes nest strictly:
//! only the most recently constructed live allocator may allocate, and drops
//! must happen in reverse construction order.
//!
//! The stack itself is destroyed by the thread-local destructor on thread
//! exit. Clients that cannot rely on that (exotic thread teardown) scope a
//! [`TemporaryStackInitializer`], whose drop clears the stack early.
//!
//! A process-wide growth tracker is consulted before the stack grows a new
//! block; returning an error vetoes the growth.

use core::cell::RefCell;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{BlockAllocator, GrowingBlockAllocator, MemoryBlock};
use crate::error::{AllocResult, AllocatorInfo};
use crate::lowlevel::HeapAllocator;
use crate::stack::{MemoryStack, StackMarker};
use crate::traits::RawAllocator;

/// Default first-block size of a thread's temporary stack
pub const DEFAULT_TEMPORARY_STACK_SIZE: usize = 4096;

// ============================================================================
// Growth tracker slot
// ============================================================================

/// Callback fired before the temporary stack grows by `usize` bytes
///
/// Returning an error prevents the growth and fails the triggering
/// allocation.
pub type GrowthTracker = fn(usize) -> AllocResult<()>;

fn default_growth_tracker(size: usize) -> AllocResult<()> {
    tracing::trace!(size, "temporary stack grows");
    Ok(())
}

static GROWTH_TRACKER: AtomicUsize = AtomicUsize::new(0);

/// Exchanges the process-wide growth tracker, returning the previous one
pub fn set_growth_tracker(tracker: GrowthTracker) -> GrowthTracker {
    let old = GROWTH_TRACKER.swap(tracker as usize, Ordering::AcqRel);
    if old == 0 {
        default_growth_tracker
    } else {
        // SAFETY: only `GrowthTracker` values are ever stored in the slot.
        unsafe { core::mem::transmute::<usize, GrowthTracker>(old) }
    }
}

/// The currently installed growth tracker
pub fn growth_tracker() -> GrowthTracker {
    match GROWTH_TRACKER.load(Ordering::Acquire) {
        0 => default_growth_tracker,
        raw => unsafe { core::mem::transmute::<usize, GrowthTracker>(raw) },
    }
}

/// Block allocator that consults the growth tracker before growing
struct TrackedGrowth {
    inner: GrowingBlockAllocator<HeapAllocator>,
}

// SAFETY: pure forwarding around the inner allocator.
unsafe impl BlockAllocator for TrackedGrowth {
    fn allocate_block(&mut self) -> AllocResult<MemoryBlock> {
        growth_tracker()(self.inner.next_block_size())?;
        self.inner.allocate_block()
    }

    unsafe fn deallocate_block(&mut self, block: MemoryBlock) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.deallocate_block(block) }
    }

    fn next_block_size(&self) -> usize {
        self.inner.next_block_size()
    }
}

// ============================================================================
// Thread-local stack
// ============================================================================

struct ThreadStack {
    stack: MemoryStack<TrackedGrowth>,
    bottom: StackMarker,
    /// Number of live `TemporaryAllocator` scopes
    depth: usize,
}

impl ThreadStack {
    fn new(initial_size: usize) -> Self {
        let stack = MemoryStack::with_block_allocator(TrackedGrowth {
            inner: GrowingBlockAllocator::new(MemoryStack::<TrackedGrowth>::min_block_size(
                initial_size,
            )),
        });
        let bottom = stack.top();
        Self {
            stack,
            bottom,
            depth: 0,
        }
    }
}

thread_local! {
    static THREAD_STACK: RefCell<Option<ThreadStack>> = const { RefCell::new(None) };
}

fn with_stack<R>(initial_size: usize, f: impl FnOnce(&mut ThreadStack) -> R) -> R {
    THREAD_STACK.with(|cell| {
        let mut slot = cell.borrow_mut();
        let state = slot.get_or_insert_with(|| ThreadStack::new(initial_size));
        f(state)
    })
}

/// Ensures this thread's temporary stack exists with `initial_size` bytes
///
/// Returns the stack's current block count, creating the stack on first
/// call. Later calls ignore the size argument.
pub fn get_temporary_stack(initial_size: usize) -> usize {
    with_stack(initial_size, |state| state.stack.block_count())
}

/// Scoped guard ensuring the temporary stack is set up and cleared
///
/// Construction creates the thread's stack if needed; drop unwinds it to
/// empty (but keeps it alive for later scopes). For clients that cannot rely
/// on thread-exit cleanup.
pub struct TemporaryStackInitializer {
    _not_send: PhantomData<*mut ()>,
}

impl TemporaryStackInitializer {
    /// Creates the guard, initializing the stack with `initial_size` bytes
    pub fn new(initial_size: usize) -> Self {
        get_temporary_stack(initial_size);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for TemporaryStackInitializer {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPORARY_STACK_SIZE)
    }
}

impl Drop for TemporaryStackInitializer {
    fn drop(&mut self) {
        // try_with: the guard may drop during thread teardown, after the
        // thread-local itself is gone.
        let _ = THREAD_STACK.try_with(|cell| {
            if let Some(state) = cell.borrow_mut().as_mut() {
                debug_assert_eq!(state.depth, 0, "temporary scopes outlive their initializer");
                // SAFETY: the bottom marker was captured on this stack and
                // nothing older exists.
                unsafe { state.stack.unwind(state.bottom) };
            }
        });
    }
}

/// Scoped allocator over the thread's temporary stack
///
/// Everything allocated through it is released when it drops. Scopes nest
/// LIFO; allocating through an outer scope while an inner one is live is a
/// bug and debug-asserts.
pub struct TemporaryAllocator {
    marker: StackMarker,
    depth: usize,
    shrink_on_drop: bool,
    _not_send: PhantomData<*mut ()>,
}

impl TemporaryAllocator {
    /// Opens a scope on this thread's temporary stack
    pub fn new() -> Self {
        with_stack(DEFAULT_TEMPORARY_STACK_SIZE, |state| {
            state.depth += 1;
            Self {
                marker: state.stack.top(),
                depth: state.depth,
                shrink_on_drop: false,
                _not_send: PhantomData,
            }
        })
    }

    /// Also release unused blocks back to the heap when the scope ends
    pub fn shrink_on_drop(mut self) -> Self {
        self.shrink_on_drop = true;
        self
    }

    /// Allocates `size` bytes aligned to `alignment` from the scope
    pub fn allocate(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        with_stack(DEFAULT_TEMPORARY_STACK_SIZE, |state| {
            debug_assert_eq!(
                state.depth, self.depth,
                "only the innermost temporary scope may allocate"
            );
            state.stack.allocate(size, alignment)
        })
    }
}

impl Default for TemporaryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TemporaryAllocator {
    fn drop(&mut self) {
        let _ = THREAD_STACK.try_with(|cell| {
            if let Some(state) = cell.borrow_mut().as_mut() {
                debug_assert_eq!(
                    state.depth, self.depth,
                    "temporary scopes must drop in reverse construction order"
                );
                state.depth -= 1;
                // SAFETY: the marker was captured on this stack, and LIFO
                // scope order keeps it no newer than the current position.
                unsafe { state.stack.unwind(self.marker) };
                if self.shrink_on_drop {
                    state.stack.shrink_to_fit();
                }
            }
        });
    }
}

// SAFETY: allocations are stack bumps released by scope drop; the scope
// discipline makes double handouts impossible.
unsafe impl RawAllocator for TemporaryAllocator {
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new("rawmem::TemporaryAllocator", self)
    }

    fn allocate_node(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.allocate(size, alignment)
    }

    unsafe fn deallocate_node(&self, _ptr: NonNull<u8>, _size: usize, _alignment: usize) {
        // Scope drop unwinds everything at once.
    }
}
