//! Memory Manager - Page allocator and garbage collector
//!
//! This component provides:
//! - A size-classed, page-backed allocator with refcounted blocks and
//!   free-list reuse (64 B .. 1 MiB power-of-two classes)
//! - Executable-page support for JIT code, behind an injected protection
//!   profile and a per-platform page backend
//! - A 3-generation mark-and-sweep collector over an explicit object/edge
//!   registry, with root discovery delegated to a `RootProvider`

pub mod allocator;
pub mod gc;
pub mod page;

// Re-export main types
pub use allocator::{AllocError, MemoryAllocator, UsageStats};
pub use gc::{
    CleanupHook, CollectStats, EmptyRoots, GarbageCollector, GcError, GcStats, RootProvider,
};
pub use page::{HostPages, PageBackend, ProtectionProfile};
