//! Core Types - Shared value and profiling types
//!
//! This component provides:
//! - The runtime `Value` representation shared by interpreter and JIT
//! - `ObjectId` handles for heap-managed objects
//! - `ReturnType` tags for compiled-function metadata
//! - `CallCounters`, the per-function hotness counter shared by the
//!   interpreter and the tiering controller

pub mod hotness;
pub mod value;

// Re-export main types
pub use hotness::CallCounters;
pub use value::{ObjectId, ReturnType, Value};
