//! Memory arena: an ordered stack of blocks with a free-block cache
//!
//! The arena owns a [`BlockAllocator`] and keeps two intrusive stacks of
//! blocks, *used* and *cached*. Each block stores its own list node in its
//! first bytes, so the arena needs no allocation of its own. Deallocation is
//! strictly LIFO; freed blocks go to the cache and are reused before the
//! block allocator is asked again.

use core::ptr::NonNull;

use crate::block::{BlockAllocator, MemoryBlock};
use crate::debug::{debug_fill, INTERNAL_FREED, INTERNAL_MEMORY};
use crate::error::AllocResult;
use crate::utils::{align_up, MAX_ALIGNMENT};

/// Intrusive node embedded at the start of every arena-held block
#[repr(C)]
struct BlockNode {
    prev: *mut BlockNode,
    usable_size: usize,
}

/// Bytes reserved at the block start for the node, rounded so the usable
/// region stays max-aligned
const NODE_OVERHEAD: usize = align_up(core::mem::size_of::<BlockNode>(), MAX_ALIGNMENT);

/// Intrusive LIFO stack of blocks
struct BlockStack {
    top: *mut BlockNode,
    len: usize,
}

impl BlockStack {
    const fn new() -> Self {
        Self {
            top: core::ptr::null_mut(),
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.top.is_null()
    }

    /// Embeds a node into `block` and pushes it; returns the usable region
    ///
    /// # Safety
    /// `block` must be writable and at least `NODE_OVERHEAD` bytes.
    unsafe fn push(&mut self, block: MemoryBlock) -> MemoryBlock {
        debug_assert!(block.size > NODE_OVERHEAD);
        let node = block.memory.as_ptr() as *mut BlockNode;
        // SAFETY: the block start is max-aligned and large enough for a node.
        unsafe {
            node.write(BlockNode {
                prev: self.top,
                usable_size: block.size - NODE_OVERHEAD,
            });
        }
        self.top = node;
        self.len += 1;
        // SAFETY: NODE_OVERHEAD < block.size.
        let usable = unsafe { NonNull::new_unchecked(block.memory.as_ptr().add(NODE_OVERHEAD)) };
        MemoryBlock::new(usable, block.size - NODE_OVERHEAD)
    }

    /// Pops the top block, returning it in its original (whole) extent
    ///
    /// # Safety
    /// The stack must be non-empty.
    unsafe fn pop(&mut self) -> MemoryBlock {
        debug_assert!(!self.is_empty());
        let node = self.top;
        // SAFETY: node was written by push and is still live.
        let (prev, usable_size) = unsafe { ((*node).prev, (*node).usable_size) };
        self.top = prev;
        self.len -= 1;
        // SAFETY: node points at the original block start.
        MemoryBlock::new(unsafe { NonNull::new_unchecked(node as *mut u8) }, usable_size + NODE_OVERHEAD)
    }

    /// Usable view of the top block
    ///
    /// # Safety
    /// The stack must be non-empty.
    unsafe fn top_block(&self) -> MemoryBlock {
        debug_assert!(!self.is_empty());
        // SAFETY: top was written by push and is still live.
        let usable_size = unsafe { (*self.top).usable_size };
        let usable = unsafe { NonNull::new_unchecked((self.top as *mut u8).add(NODE_OVERHEAD)) };
        MemoryBlock::new(usable, usable_size)
    }

    /// Whether `ptr` lies in any block's usable region
    fn owns(&self, ptr: *const u8) -> bool {
        let mut node = self.top;
        while !node.is_null() {
            // SAFETY: every node in the chain was written by push.
            let usable_size = unsafe { (*node).usable_size };
            let begin = node as usize + NODE_OVERHEAD;
            let addr = ptr as usize;
            if addr >= begin && addr < begin + usable_size {
                return true;
            }
            node = unsafe { (*node).prev };
        }
        false
    }
}

/// Ordered sequence of blocks drawn from a block allocator
///
/// Higher-level allocators (stack, pools) ask the arena for blocks and
/// subdivide them. The arena caches freed blocks for reuse unless built
/// with [`uncached`](MemoryArena::uncached).
///
/// # Failure
/// When the block allocator fails, the arena state is unchanged.
pub struct MemoryArena<B: BlockAllocator> {
    block_alloc: B,
    used: BlockStack,
    cached: BlockStack,
    use_cache: bool,
}

impl<B: BlockAllocator> MemoryArena<B> {
    /// Extra bytes the arena needs per block for its bookkeeping
    pub const BLOCK_OVERHEAD: usize = NODE_OVERHEAD;

    /// Smallest block size able to hold `usable` bytes for the caller
    pub const fn min_block_size(usable: usize) -> usize {
        usable + NODE_OVERHEAD
    }

    /// Creates an arena that caches freed blocks
    pub fn new(block_alloc: B) -> Self {
        Self {
            block_alloc,
            used: BlockStack::new(),
            cached: BlockStack::new(),
            use_cache: true,
        }
    }

    /// Creates an arena that returns freed blocks immediately
    pub fn uncached(block_alloc: B) -> Self {
        Self {
            block_alloc,
            used: BlockStack::new(),
            cached: BlockStack::new(),
            use_cache: false,
        }
    }

    /// Pulls a block, preferring the cache over the block allocator
    pub fn allocate_block(&mut self) -> AllocResult<MemoryBlock> {
        let usable = if self.cached.is_empty() {
            let block = self.block_alloc.allocate_block()?;
            // SAFETY: freshly allocated block, exclusive to us.
            unsafe { self.used.push(block) }
        } else {
            // SAFETY: cache is non-empty.
            let block = unsafe { self.cached.pop() };
            // SAFETY: cached blocks remain valid until returned to the
            // block allocator.
            unsafe { self.used.push(block) }
        };
        // SAFETY: the usable region is writable and exclusive.
        unsafe { debug_fill(usable.memory.as_ptr(), usable.size, INTERNAL_MEMORY) };
        Ok(usable)
    }

    /// Returns the most recently allocated block
    ///
    /// With caching on, the block is parked for reuse; otherwise it goes
    /// straight back to the block allocator.
    ///
    /// # Panics
    /// Debug-asserts that a block is outstanding.
    pub fn deallocate_block(&mut self) {
        debug_assert!(!self.used.is_empty(), "no block to deallocate");
        // SAFETY: used is non-empty.
        let block = unsafe { self.used.pop() };
        // SAFETY: the block's full extent is writable.
        unsafe { debug_fill(block.memory.as_ptr(), block.size, INTERNAL_FREED) };
        if self.use_cache {
            // SAFETY: the block is live and large enough.
            unsafe { self.cached.push(block) };
        } else {
            // SAFETY: LIFO order is maintained by the used stack.
            unsafe { self.block_alloc.deallocate_block(block) };
        }
    }

    /// Usable view of the current (top) block
    ///
    /// # Panics
    /// Debug-asserts that a block is outstanding.
    pub fn current_block(&self) -> MemoryBlock {
        debug_assert!(!self.used.is_empty(), "arena has no current block");
        // SAFETY: used is non-empty.
        unsafe { self.used.top_block() }
    }

    /// Number of blocks in use
    pub fn size(&self) -> usize {
        self.used.len
    }

    /// Number of blocks parked in the cache
    pub fn cache_size(&self) -> usize {
        self.cached.len
    }

    /// Whether `ptr` lies within some used block
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.used.owns(ptr)
    }

    /// Usable size of the next block [`allocate_block`] will produce
    ///
    /// [`allocate_block`]: MemoryArena::allocate_block
    pub fn next_block_size(&self) -> usize {
        if self.cached.is_empty() {
            self.block_alloc
                .next_block_size()
                .saturating_sub(NODE_OVERHEAD)
        } else {
            // SAFETY: cache is non-empty.
            unsafe { self.cached.top_block() }.size
        }
    }

    /// Returns all cached blocks to the block allocator
    ///
    /// Blocks go back in reverse order so bounded allocators observe their
    /// LIFO contract.
    pub fn shrink_to_fit(&mut self) {
        let mut reversed = BlockStack::new();
        while !self.cached.is_empty() {
            // SAFETY: loop condition guarantees non-empty; blocks stay live
            // while relinked.
            let block = unsafe { self.cached.pop() };
            unsafe { reversed.push(block) };
        }
        while !reversed.is_empty() {
            // SAFETY: loop condition guarantees non-empty.
            let block = unsafe { reversed.pop() };
            // SAFETY: every cached block originated from this block allocator.
            unsafe { self.block_alloc.deallocate_block(block) };
        }
    }

    /// The wrapped block allocator
    pub fn allocator(&self) -> &B {
        &self.block_alloc
    }
}

// SAFETY: every stored pointer references memory owned through the block
// allocator, which moves together with the arena.
unsafe impl<B: BlockAllocator + Send> Send for MemoryArena<B> {}

impl<B: BlockAllocator> Drop for MemoryArena<B> {
    fn drop(&mut self) {
        self.shrink_to_fit();
        while !self.used.is_empty() {
            // SAFETY: loop condition guarantees non-empty; used pops in
            // reverse allocation order.
            let block = unsafe { self.used.pop() };
            unsafe { self.block_alloc.deallocate_block(block) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FixedBlockAllocator, GrowingBlockAllocator};

    #[test]
    fn block_reuse_through_cache() {
        let mut arena = MemoryArena::new(GrowingBlockAllocator::new(256));

        let first = arena.allocate_block().unwrap();
        let first_addr = first.memory.as_ptr() as usize;
        assert_eq!(arena.size(), 1);

        arena.deallocate_block();
        assert_eq!(arena.size(), 0);
        assert_eq!(arena.cache_size(), 1);

        // The cached block must be reused before the block allocator grows.
        let again = arena.allocate_block().unwrap();
        assert_eq!(again.memory.as_ptr() as usize, first_addr);
        assert_eq!(arena.cache_size(), 0);
    }

    #[test]
    fn uncached_returns_blocks_immediately() {
        let mut arena = MemoryArena::uncached(FixedBlockAllocator::new(256, 1));

        arena.allocate_block().unwrap();
        arena.deallocate_block();
        assert_eq!(arena.cache_size(), 0);

        // The single fixed block is available again.
        arena.allocate_block().unwrap();
    }

    #[test]
    fn owns_checks_used_blocks_only() {
        let mut arena = MemoryArena::new(GrowingBlockAllocator::new(256));
        let block = arena.allocate_block().unwrap();

        assert!(arena.owns(block.memory.as_ptr()));
        assert!(arena.owns(unsafe { block.memory.as_ptr().add(block.size - 1) }));
        assert!(!arena.owns(block.end()));

        let outside = 0usize;
        assert!(!arena.owns(&outside as *const usize as *const u8));

        arena.deallocate_block();
        assert!(!arena.owns(block.memory.as_ptr()));
    }

    #[test]
    fn failure_leaves_arena_unchanged() {
        let mut arena = MemoryArena::new(FixedBlockAllocator::new(256, 1));
        arena.allocate_block().unwrap();
        assert_eq!(arena.size(), 1);

        assert!(arena.allocate_block().is_err());
        assert_eq!(arena.size(), 1);
        assert_eq!(arena.cache_size(), 0);
    }

    #[test]
    fn shrink_to_fit_drains_cache() {
        let mut arena = MemoryArena::new(GrowingBlockAllocator::new(128));
        arena.allocate_block().unwrap();
        arena.allocate_block().unwrap();
        arena.deallocate_block();
        arena.deallocate_block();
        assert_eq!(arena.cache_size(), 2);

        arena.shrink_to_fit();
        assert_eq!(arena.cache_size(), 0);
    }

    #[test]
    fn usable_region_is_max_aligned() {
        let mut arena = MemoryArena::new(GrowingBlockAllocator::new(128));
        let block = arena.allocate_block().unwrap();
        assert_eq!(block.memory.as_ptr() as usize % MAX_ALIGNMENT, 0);
    }
}
