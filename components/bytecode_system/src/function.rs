//! Function-table entries.

use core_types::{ReturnType, Value};

/// An immutable function-table entry.
///
/// Created by the loader (or by `MakeFunction` at run time) and never
/// mutated afterwards. The constant pool is the pool that was current when
/// the function was defined.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name, the key in the VM's function table
    pub name: String,
    /// Declared number of positional parameters
    pub arity: u8,
    /// Body bytecode in wire format
    pub bytecode: Vec<u8>,
    /// Constant pool the body indexes into
    pub constants: Vec<Value>,
    /// Number of local slots the body uses
    pub local_count: u8,
    /// Declared return-type tag
    pub returns: ReturnType,
}

impl Function {
    /// Create an entry with the default `Dynamic` return tag.
    pub fn new(
        name: impl Into<String>,
        arity: u8,
        bytecode: Vec<u8>,
        constants: Vec<Value>,
        local_count: u8,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            bytecode,
            constants,
            local_count,
            returns: ReturnType::Dynamic,
        }
    }

    /// Attach a declared return-type tag.
    pub fn with_returns(mut self, returns: ReturnType) -> Self {
        self.returns = returns;
        self
    }
}
