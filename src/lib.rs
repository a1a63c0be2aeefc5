//! # rawmem
//!
//! Raw memory allocators: primitive objects handing out uninitialized byte
//! regions with explicit size and alignment, decoupled from object
//! construction.
//!
//! The crate is built in layers:
//!
//! - [`lowlevel`] — heap, malloc, static-storage and virtual-memory
//!   providers
//! - [`block`] — block allocators producing whole-block reservations with
//!   growing and fixed policies
//! - [`arena`] — the block stack with a free-block cache feeding every
//!   higher strategy
//! - [`free_list`] — the slot bookkeeping under the pools
//! - [`stack`], [`pool`] — the concrete strategies: LIFO stacks with
//!   markers, fixed-size pools, bucketed pool collections
//! - [`storage`], [`adapters`] — references, type erasure, and the
//!   composition layer (alignment, fallback, segregation, tracking,
//!   locking, typed adaption)
//! - [`joint`] — co-locating an object with its members' allocations
//! - [`temporary`] — the thread-local scratch stack with scoped unwinding
//!
//! Every allocator implements [`RawAllocator`]; composition-friendly ones
//! additionally implement [`ComposableAllocator`], whose `try_*` shapes
//! fail by returning `None`/`false` instead of raising.
//!
//! ```
//! use rawmem::pool::{MemoryPool, NodePool};
//! use rawmem::RawAllocator;
//!
//! let pool = MemoryPool::<NodePool>::new(
//!     48,
//!     MemoryPool::<NodePool>::min_block_size(48, 1024),
//! )?;
//! let node = pool.allocate_node(48, 8)?;
//! // ... place data ...
//! unsafe { pool.deallocate_node(node, 48, 8) };
//! # Ok::<(), rawmem::AllocError>(())
//! ```

#![warn(missing_docs)]

pub mod adapters;
pub mod arena;
pub mod block;
pub mod debug;
pub mod error;
pub mod free_list;
pub mod joint;
pub mod lowlevel;
pub mod pool;
pub mod stack;
pub mod storage;
#[cfg(feature = "temporary")]
pub mod temporary;
pub mod traits;
pub mod utils;

pub use error::{AllocError, AllocResult, AllocatorInfo};
pub use traits::{ComposableAllocator, RawAllocator, ThreadSafeAllocator};

pub use block::{BlockAllocator, MemoryBlock};
pub use lowlevel::DefaultAllocator;
