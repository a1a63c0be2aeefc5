//! Low-level memory providers
//!
//! The leaf allocators every other component is built on:
//! - [`HeapAllocator`] and [`GlobalAllocator`] delegate to the operating
//!   system heap and the registered global allocator
//! - [`MallocAllocator`] goes through raw `libc::malloc` (unix)
//! - [`StaticStorage`]/[`StaticAllocator`] serve from an inline byte array
//! - [`virtual_memory`] exposes page-granularity reserve/commit primitives
//!   with [`VirtualAllocator`] and [`VirtualBlockAllocator`] on top
//!
//! All providers are stateless except the static and virtual ones, which own
//! a reservation.

mod heap;
mod static_storage;
pub mod virtual_memory;

pub use heap::{GlobalAllocator, HeapAllocator};
#[cfg(unix)]
pub use heap::MallocAllocator;
pub use static_storage::{StaticAllocator, StaticBlockAllocator, StaticStorage};
pub use virtual_memory::{VirtualAllocator, VirtualBlockAllocator};

/// The provider used by allocators when no block allocator is named
pub type DefaultAllocator = HeapAllocator;
