//! Composition adapters over raw allocators
//!
//! Every adapter wraps one or more raw allocators and is itself a raw
//! allocator, so they stack freely:
//!
//! - [`AlignedAllocator`] enforces a minimum alignment
//! - [`FallbackAllocator`] rescues failed allocations with a second source
//! - [`Segregator`] routes requests by size across a chain of allocators
//! - [`TrackedAllocator`] feeds observer hooks on every operation
//! - [`LockedAllocator`] serializes a single-threaded allocator behind a
//!   mutex
//! - [`TypedAllocator`] puts a value-typed face on any raw allocator

mod aligned;
mod fallback;
mod locked;
mod segregator;
mod tracked;
mod typed;

pub use aligned::AlignedAllocator;
pub use fallback::FallbackAllocator;
pub use locked::LockedAllocator;
pub use segregator::{NullAllocator, Segregatable, Segregator, ThresholdSegregatable};
pub use tracked::{
    AllocatorStats, DeepTracker, StatsTracker, TrackedAllocator, TrackedBlockAllocator, Tracker,
};
pub use typed::TypedAllocator;
