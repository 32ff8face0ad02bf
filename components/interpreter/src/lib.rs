//! Interpreter - Bytecode virtual machine
//!
//! Main entry point for executing bytecode. The VM owns:
//! - The shared operand stack and the frame stack (root frame always
//!   present; root-frame locals are the global bindings)
//! - The function table and top-level constant pool
//! - The runtime heap bridging the allocator and the garbage collector
//! - The tiering controller, consulted on every call
//!
//! Execution is single-threaded and synchronous; calls are realized by
//! nested blocking recursion, and collection and compilation run to
//! completion before control returns.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heap;
pub mod vm;

// Re-export main types
pub use error::VmError;
pub use frame::Frame;
pub use heap::{Roots, RuntimeHeap};
pub use vm::{Vm, VmOptions};
