//! The execution-error kind.
//!
//! Every handler failure, and every subsystem error crossing the VM
//! boundary, collapses into `VmError`: one kind with a message and, where
//! available, the function name and program counter. Execution aborts
//! immediately; nothing is caught and ignored.

use std::fmt;

use bytecode_system::DecodeError;
use jit_compiler::JitError;
use memory_manager::{AllocError, GcError};

/// A VM execution error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    /// What went wrong
    pub message: String,
    /// The function that was executing, if any
    pub function: Option<String>,
    /// Program counter of the failing instruction, if known
    pub pc: Option<usize>,
}

impl VmError {
    /// Create an error with no location context yet.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            function: None,
            pc: None,
        }
    }

    /// Attach location context if none has been recorded.
    ///
    /// The innermost location wins: context set where the error arose is
    /// kept as it propagates outward.
    pub fn locate(mut self, function: Option<&str>, pc: usize) -> Self {
        if self.pc.is_none() {
            self.pc = Some(pc);
            self.function = function.map(str::to_string);
        }
        self
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM execution error: {}", self.message)?;
        if let Some(function) = &self.function {
            write!(f, " in function `{}`", function)?;
        }
        if let Some(pc) = self.pc {
            write!(f, " at pc {}", pc)?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        VmError::new(err.to_string())
    }
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        VmError::new(err.to_string())
    }
}

impl From<GcError> for VmError {
    fn from(err: GcError) -> Self {
        VmError::new(err.to_string())
    }
}

impl From<JitError> for VmError {
    fn from(err: JitError) -> Self {
        VmError::new(err.to_string())
    }
}
