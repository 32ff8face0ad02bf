//! JIT Compiler - Tiering controller and native code generation
//!
//! This component provides:
//! - `JitCompiler`, the tiering controller: per-function call counting,
//!   promotion decisions, and an idempotent compiled-function cache
//! - Bytecode-to-native translation with a compile-time stack check
//! - The `CodegenBackend` capability with one hand-rolled backend per
//!   architecture (x86-64 System V and AArch64 AAPCS64)
//! - Native-call marshalling with a hardened argument-count check
//!
//! Emitted code lives in executable blocks obtained from the memory
//! manager and stays resident for the life of the allocator.

pub mod aarch64;
pub mod backend;
pub mod codebuf;
pub mod error;
pub mod native;
pub mod tiering;
pub mod translate;
pub mod x86_64;

// Re-export main types
pub use backend::{backend_for, CodegenBackend};
pub use codebuf::CodeBuffer;
pub use error::JitError;
pub use native::{NativeFunction, FAULT_SENTINEL};
pub use tiering::{JitCompiler, TieringStats};
pub use translate::{lower, TranslatedFunction};
