//! Integration test suite for the Ember execution core
//!
//! Verifies that the allocator, collector, interpreter and tiering
//! controller work together correctly across component boundaries.

/// Re-export components for test convenience
pub mod components {
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use jit_compiler;
    pub use memory_manager;
}
