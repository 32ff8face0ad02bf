//! Bytecode lowering and translation-time verification.
//!
//! Bytecode is decoded once into lowered ops that the per-architecture
//! backends emit directly. Lowering verifies the operand-stack discipline
//! at compile time (depth consistency at every branch target, no
//! underflow, a value on every return path), assigns frame slots to named
//! variables, and derives the argument count from the argument loads it
//! sees.
//!
//! Functions whose bytecode cannot be expressed in the fixed-arity integer
//! convention are declined, never miscompiled: the tiering controller pins
//! them to the interpreter.

use std::collections::HashMap;

use bytecode_system::{BytecodeReader, Opcode};
use core_types::Value;

use crate::error::JitError;

/// Binary arithmetic selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Wrapping addition
    Add,
    /// Wrapping subtraction
    Sub,
    /// Wrapping multiplication
    Mul,
    /// Truncating division (zero divisor routes to the fault epilogue)
    Div,
}

/// Comparison selector; results are 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equality
    Eq,
    /// Signed greater-than
    Gt,
    /// Signed less-than
    Lt,
}

/// One lowered operation over the virtual operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredOp {
    /// Push an immediate integer constant
    PushConst(i64),
    /// Push an argument spilled in the prologue
    PushArg(u8),
    /// Push a named-variable frame slot
    PushSlot(u16),
    /// Store the top of stack into a frame slot, leaving it on the stack
    StoreSlot(u16),
    /// Pop two, push the arithmetic result
    Binary(BinOp),
    /// Pop two, push the comparison result
    Compare(CmpOp),
    /// Unconditional branch to a bytecode offset
    Jump {
        /// Bytecode offset of the target instruction
        target: usize,
    },
    /// Pop one, branch if zero
    JumpIfFalse {
        /// Bytecode offset of the target instruction
        target: usize,
    },
    /// Pop the result and return it
    Return,
}

/// A lowered instruction with the bytecode offset it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweredInst {
    /// Offset of the opcode byte in the source bytecode
    pub offset: usize,
    /// The lowered operation
    pub op: LoweredOp,
}

/// A verified, lowered function ready for code generation.
#[derive(Debug, Clone)]
pub struct TranslatedFunction {
    /// Lowered instructions in bytecode order
    pub insts: Vec<LoweredInst>,
    /// Arguments the function reads (highest index + 1)
    pub arg_count: u8,
    /// Named-variable frame slots the function uses
    pub slot_count: u16,
}

/// Maximum arguments the fixed-arity native convention carries.
pub const MAX_NATIVE_ARGS: u8 = 6;

/// Lower a bytecode stream against its constant pool.
pub fn lower(bytecode: &[u8], constants: &[Value]) -> Result<TranslatedFunction, JitError> {
    let mut reader = BytecodeReader::new(bytecode);
    let mut insts = Vec::new();
    let mut slots: HashMap<String, u16> = HashMap::new();
    let mut arg_count: u8 = 0;

    while !reader.is_at_end() {
        let offset = reader.position();
        let op = reader.read_opcode()?;
        let lowered = match op {
            Opcode::LoadConst => {
                let index = reader.read_u16()? as usize;
                let value = constants
                    .get(index)
                    .ok_or_else(|| JitError::Malformed(format!("constant index {} out of range", index)))?;
                match value {
                    Value::Int(n) => LoweredOp::PushConst(*n),
                    other => return Err(JitError::InvalidConstant(other.to_string())),
                }
            }
            Opcode::LoadVar => {
                let name = reader.read_string()?;
                match slots.get(&name) {
                    Some(&slot) => LoweredOp::PushSlot(slot),
                    None => {
                        return Err(JitError::UnsupportedShape(
                            "reads a variable defined outside the function",
                        ))
                    }
                }
            }
            Opcode::StoreVar => {
                let name = reader.read_string()?;
                let next = slots.len() as u16;
                let slot = *slots.entry(name).or_insert(next);
                LoweredOp::StoreSlot(slot)
            }
            Opcode::LoadArg => {
                let index = reader.read_u8()?;
                if index >= MAX_NATIVE_ARGS {
                    return Err(JitError::UnsupportedShape(
                        "reads an argument beyond the native convention",
                    ));
                }
                arg_count = arg_count.max(index + 1);
                LoweredOp::PushArg(index)
            }
            Opcode::BinaryAdd => LoweredOp::Binary(BinOp::Add),
            Opcode::BinarySub => LoweredOp::Binary(BinOp::Sub),
            Opcode::BinaryMul => LoweredOp::Binary(BinOp::Mul),
            Opcode::BinaryDiv => LoweredOp::Binary(BinOp::Div),
            Opcode::CompareEq => LoweredOp::Compare(CmpOp::Eq),
            Opcode::CompareGt => LoweredOp::Compare(CmpOp::Gt),
            Opcode::CompareLt => LoweredOp::Compare(CmpOp::Lt),
            Opcode::Jump => {
                let target = branch_target(&mut reader, bytecode.len())?;
                LoweredOp::Jump { target }
            }
            Opcode::JumpIfFalse => {
                let target = branch_target(&mut reader, bytecode.len())?;
                LoweredOp::JumpIfFalse { target }
            }
            Opcode::Return => LoweredOp::Return,
            Opcode::CallFunction
            | Opcode::MakeFunction
            | Opcode::MakeArray
            | Opcode::ArrayGet
            | Opcode::ArraySet => return Err(JitError::UnsupportedOpcode(op)),
        };
        insts.push(LoweredInst { offset, op: lowered });
    }

    if insts.is_empty() {
        return Err(JitError::Malformed("empty function body".to_string()));
    }

    let translated = TranslatedFunction {
        insts,
        arg_count,
        slot_count: slots.len() as u16,
    };
    verify_stack(&translated, bytecode.len())?;
    Ok(translated)
}

fn branch_target(reader: &mut BytecodeReader<'_>, len: usize) -> Result<usize, JitError> {
    let offset = reader.read_i16()?;
    let target = reader.position() as isize + offset as isize;
    if target < 0 || target > len as isize {
        return Err(JitError::Malformed(format!(
            "jump target {} outside bytecode of length {}",
            target, len
        )));
    }
    Ok(target as usize)
}

/// Verify operand-stack discipline over every reachable path.
///
/// Walks the instruction graph tracking virtual stack depth; a depth
/// mismatch where paths merge, an underflow, a return without a value, or
/// control falling off the end all reject the function.
fn verify_stack(func: &TranslatedFunction, bytecode_len: usize) -> Result<(), JitError> {
    let index_of: HashMap<usize, usize> = func
        .insts
        .iter()
        .enumerate()
        .map(|(index, inst)| (inst.offset, index))
        .collect();

    let resolve = |target: usize| -> Result<usize, JitError> {
        index_of.get(&target).copied().ok_or_else(|| {
            JitError::Malformed(format!(
                "jump target {} is not an instruction boundary",
                target
            ))
        })
    };

    let mut depths: Vec<Option<i32>> = vec![None; func.insts.len()];
    let mut pending = vec![(0usize, 0i32)];

    while let Some((index, depth)) = pending.pop() {
        match depths[index] {
            Some(existing) if existing != depth => {
                return Err(JitError::Malformed(format!(
                    "inconsistent stack depth at offset {}",
                    func.insts[index].offset
                )));
            }
            Some(_) => continue,
            None => depths[index] = Some(depth),
        }

        let offset = func.insts[index].offset;
        let underflow = |needed: i32| {
            JitError::Malformed(format!(
                "operand stack underflow at offset {} (needs {}, has {})",
                offset, needed, depth
            ))
        };

        let mut successors: Vec<(usize, i32)> = Vec::new();
        let mut fallthrough: Option<i32> = None;

        match func.insts[index].op {
            LoweredOp::PushConst(_) | LoweredOp::PushArg(_) | LoweredOp::PushSlot(_) => {
                fallthrough = Some(depth + 1);
            }
            LoweredOp::StoreSlot(_) => {
                if depth < 1 {
                    return Err(underflow(1));
                }
                fallthrough = Some(depth);
            }
            LoweredOp::Binary(_) | LoweredOp::Compare(_) => {
                if depth < 2 {
                    return Err(underflow(2));
                }
                fallthrough = Some(depth - 1);
            }
            LoweredOp::Jump { target } => {
                if target == bytecode_len {
                    return Err(JitError::UnsupportedShape(
                        "control falls off the end of the function",
                    ));
                }
                successors.push((resolve(target)?, depth));
            }
            LoweredOp::JumpIfFalse { target } => {
                if depth < 1 {
                    return Err(underflow(1));
                }
                if target == bytecode_len {
                    return Err(JitError::UnsupportedShape(
                        "control falls off the end of the function",
                    ));
                }
                successors.push((resolve(target)?, depth - 1));
                fallthrough = Some(depth - 1);
            }
            LoweredOp::Return => {
                if depth < 1 {
                    return Err(JitError::UnsupportedShape(
                        "returns without a value on the stack",
                    ));
                }
            }
        }

        if let Some(next_depth) = fallthrough {
            if index + 1 >= func.insts.len() {
                return Err(JitError::UnsupportedShape(
                    "control falls off the end of the function",
                ));
            }
            successors.push((index + 1, next_depth));
        }
        pending.extend(successors);
    }

    Ok(())
}
