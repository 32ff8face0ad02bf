//! The code-generation capability.
//!
//! One backend exists per architecture and is chosen once, from the host
//! architecture identifier, when the tiering controller is constructed.
//! Unrecognized identifiers fail cleanly; wrong code is never emitted.

use crate::aarch64::AArch64Backend;
use crate::codebuf::CodeBuffer;
use crate::error::JitError;
use crate::translate::TranslatedFunction;
use crate::x86_64::X86_64Backend;

/// Per-architecture code generator.
///
/// `emit_prologue` establishes the frame and spills arguments,
/// `emit_body` translates every lowered instruction and patches its
/// branches, and `emit_epilogue` appends the shared fault handler when the
/// body needs one.
pub trait CodegenBackend: std::fmt::Debug {
    /// The architecture identifier this backend serves.
    fn architecture(&self) -> &'static str;

    /// Emit frame setup and argument spills.
    fn emit_prologue(
        &mut self,
        buf: &mut CodeBuffer,
        func: &TranslatedFunction,
    ) -> Result<(), JitError>;

    /// Emit the function body and resolve its internal branches.
    fn emit_body(
        &mut self,
        buf: &mut CodeBuffer,
        func: &TranslatedFunction,
    ) -> Result<(), JitError>;

    /// Emit the fault epilogue, if any fault edges were recorded.
    fn emit_epilogue(&mut self, buf: &mut CodeBuffer) -> Result<(), JitError>;
}

/// Select the backend for a host architecture identifier.
///
/// Supported identifiers are the `std::env::consts::ARCH` names
/// `"x86_64"` and `"aarch64"`.
pub fn backend_for(arch: &str) -> Result<Box<dyn CodegenBackend>, JitError> {
    match arch {
        "x86_64" => Ok(Box::new(X86_64Backend::new())),
        "aarch64" => Ok(Box::new(AArch64Backend::new())),
        other => Err(JitError::UnsupportedPlatform(other.to_string())),
    }
}

/// Drive a backend over a translated function and return the machine code.
pub fn generate(
    backend: &mut dyn CodegenBackend,
    func: &TranslatedFunction,
) -> Result<Vec<u8>, JitError> {
    let mut buf = CodeBuffer::new();
    backend.emit_prologue(&mut buf, func)?;
    backend.emit_body(&mut buf, func)?;
    backend.emit_epilogue(&mut buf)?;
    Ok(buf.into_bytes())
}
