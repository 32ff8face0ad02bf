//! Bytecode System - Instruction set and wire format
//!
//! This component provides:
//! - The closed opcode set executed by the VM and translated by the JIT
//! - `BytecodeReader`, the streaming decoder for the bit-exact wire format
//! - `BytecodeWriter`, the matching encoder used by loaders and tests
//! - `Function`, the immutable function-table entry
//!
//! Wire format: single opcode byte; `u8` small operands; big-endian `u16`
//! indices and lengths; big-endian signed `i16` jump offsets; embedded
//! names as `u16`-length-prefixed UTF-8.

pub mod function;
pub mod opcode;
pub mod reader;
pub mod writer;

// Re-export main types
pub use function::Function;
pub use opcode::Opcode;
pub use reader::{BytecodeReader, DecodeError};
pub use writer::BytecodeWriter;
