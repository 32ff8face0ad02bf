//! JIT error types.

use bytecode_system::{DecodeError, Opcode};
use memory_manager::AllocError;
use thiserror::Error;

/// Compilation and native-execution failures.
#[derive(Debug, Error)]
pub enum JitError {
    /// The host architecture identifier has no code generator
    #[error("JIT compilation is not supported on architecture `{0}`")]
    UnsupportedPlatform(String),
    /// `execute_native` was asked for a function that has no native code
    #[error("function `{0}` is not compiled")]
    NotCompiled(String),
    /// Argument count at the native boundary does not match the compiled
    /// entry
    #[error("native function `{name}` expects {expected} arguments, got {got}")]
    ArityMismatch {
        /// Function name
        name: String,
        /// Compiled argument count
        expected: usize,
        /// Arguments supplied
        got: usize,
    },
    /// The bytecode uses an opcode with no native translation
    #[error("opcode {0:?} has no native translation")]
    UnsupportedOpcode(Opcode),
    /// A constant cannot be embedded as a native immediate
    #[error("constant `{0}` cannot be embedded in native code")]
    InvalidConstant(String),
    /// The function's shape rules out native code (value-less return,
    /// outer-scope variable, oversized frame, too many arguments)
    #[error("function cannot be compiled: {0}")]
    UnsupportedShape(&'static str),
    /// The bytecode failed translation-time verification
    #[error("malformed bytecode: {0}")]
    Malformed(String),
    /// Native code signalled the fault sentinel (integer division by zero)
    #[error("native code faulted in `{0}`: integer division by zero")]
    NativeFault(String),
    /// Obtaining or filling the executable block failed
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// The bytecode stream itself failed to decode
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl JitError {
    /// Whether this error means the function can never be compiled, as
    /// opposed to a transient or environmental failure.
    ///
    /// Declined functions are pinned to the interpreter and never retried.
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            JitError::UnsupportedOpcode(_)
                | JitError::InvalidConstant(_)
                | JitError::UnsupportedShape(_)
                | JitError::Malformed(_)
                | JitError::Decode(_)
        )
    }
}
