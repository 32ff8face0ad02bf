//! Code buffer for building native code.
//!
//! Machine code is assembled into a plain byte buffer and copied into an
//! executable block once complete. Branch targets that are not yet known
//! are emitted as placeholders and patched by the backend when all offsets
//! are fixed.

/// A growable buffer of machine code bytes.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Current length in bytes (the offset of the next emitted byte).
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value, little-endian.
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value, little-endian.
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite 4 bytes at an earlier offset (branch patching).
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read back 4 bytes at an offset (for read-modify-write patching of
    /// fixed-width instruction words).
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ])
    }

    /// Borrow the bytes emitted so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }

    /// Finish and return the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }
}
