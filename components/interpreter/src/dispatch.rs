//! Opcode dispatch.
//!
//! One handler per opcode over the closed instruction set; every handler
//! consumes its operands directly from the stream, advancing the program
//! counter by exactly the consumed width. Handler failures collapse into
//! `VmError` and abort the current buffer.

use bytecode_system::{BytecodeReader, Function, Opcode};
use core_types::Value;

use crate::error::VmError;
use crate::frame::Frame;
use crate::vm::Vm;

/// Control-flow signal from a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Keep executing the current buffer
    Continue,
    /// The current activation is done; its result (if any) is on the stack
    Return,
}

impl Vm {
    pub(crate) fn dispatch(
        &mut self,
        op: Opcode,
        reader: &mut BytecodeReader<'_>,
        constants: &[Value],
    ) -> Result<Flow, VmError> {
        match op {
            Opcode::LoadConst => self.op_load_const(reader, constants),
            Opcode::LoadVar => self.op_load_var(reader),
            Opcode::StoreVar => self.op_store_var(reader),
            Opcode::LoadArg => self.op_load_arg(reader),
            Opcode::CallFunction => self.op_call_function(reader),
            Opcode::Return => Ok(Flow::Return),
            Opcode::BinaryAdd | Opcode::BinarySub | Opcode::BinaryMul | Opcode::BinaryDiv => {
                self.op_binary(op)
            }
            Opcode::CompareEq | Opcode::CompareGt | Opcode::CompareLt => self.op_compare(op),
            Opcode::Jump => self.op_jump(reader),
            Opcode::JumpIfFalse => self.op_jump_if_false(reader),
            Opcode::MakeFunction => self.op_make_function(reader, constants),
            Opcode::MakeArray => self.op_make_array(reader),
            Opcode::ArrayGet => self.op_array_get(),
            Opcode::ArraySet => self.op_array_set(),
        }
    }

    fn pop(&mut self, context: &str) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::new(format!("operand stack underflow in {}", context)))
    }

    fn op_load_const(
        &mut self,
        reader: &mut BytecodeReader<'_>,
        constants: &[Value],
    ) -> Result<Flow, VmError> {
        let index = reader.read_u16()? as usize;
        let value = constants
            .get(index)
            .cloned()
            .ok_or_else(|| VmError::new(format!("constant index {} out of range", index)))?;
        self.stack.push(value);
        Ok(Flow::Continue)
    }

    fn op_load_var(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let name = reader.read_string()?;
        // Innermost-to-outermost live search, not slot-indexed
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get_local(&name) {
                self.stack.push(value.clone());
                return Ok(Flow::Continue);
            }
        }
        Err(VmError::new(format!("undefined variable: {}", name)))
    }

    fn op_store_var(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let name = reader.read_string()?;
        let value = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| VmError::new("operand stack underflow in store-variable"))?;
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| VmError::new("frame stack is empty"))?;
        frame.set_local(name, value);
        Ok(Flow::Continue)
    }

    fn op_load_arg(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let index = reader.read_u8()? as usize;
        let frame = self
            .frames
            .last()
            .ok_or_else(|| VmError::new("frame stack is empty"))?;
        let value = frame
            .arg(index)
            .cloned()
            .ok_or_else(|| VmError::new(format!("argument index {} out of range", index)))?;
        self.stack.push(value);
        Ok(Flow::Continue)
    }

    fn op_call_function(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let name = reader.read_string()?;
        let argc = reader.read_u8()? as usize;

        // One shared counter drives promotion; it keeps counting after
        // compilation
        if let Some(jit) = self.jit.as_mut() {
            jit.record_call(&name);
        }

        let func = self
            .functions
            .get(&name)
            .cloned()
            .ok_or_else(|| VmError::new(format!("undefined function: {}", name)))?;

        // Native fast path: compiled entries bypass interpretation
        if let Some(jit) = self.jit.as_ref() {
            if let Some(entry) = jit.compiled_entry(&name) {
                if entry.arg_count != func.arity {
                    return Err(VmError::new(format!(
                        "compiled entry for `{}` expects {} arguments but the function declares {}",
                        name, entry.arg_count, func.arity
                    )));
                }
                if argc != func.arity as usize {
                    return Err(VmError::new(format!(
                        "function `{}` expects {} arguments, got {}",
                        name, func.arity, argc
                    )));
                }
                if self.stack.len() < argc {
                    return Err(VmError::new(format!(
                        "operand stack underflow calling `{}`",
                        name
                    )));
                }
                let at = self.stack.len() - argc;
                let args = self.stack.split_off(at);
                let result = jit.execute_native(&name, &args)?;
                self.stack.push(result);
                return Ok(Flow::Continue);
            }
        }

        // Promotion check; a declined function stays interpreted for good
        if let Some(jit) = self.jit.as_mut() {
            if jit.should_compile(&name) {
                match jit.compile_function(&func) {
                    Ok(_) => {}
                    Err(err) if err.is_decline() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if argc != func.arity as usize {
            return Err(VmError::new(format!(
                "function `{}` expects {} arguments, got {}",
                name, func.arity, argc
            )));
        }
        if self.stack.len() < argc {
            return Err(VmError::new(format!(
                "operand stack underflow calling `{}`",
                name
            )));
        }
        let at = self.stack.len() - argc;
        let args = self.stack.split_off(at);

        // Fresh operand stack for the callee; the caller's stack is parked
        // where root enumeration can still see it
        self.frames.push(Frame::with_args(args));
        self.saved_stacks.push(std::mem::take(&mut self.stack));
        let caller = std::mem::replace(&mut self.current_function, Some(name));

        self.run_buffer(&func.bytecode, &func.constants)?;

        let result = self.stack.pop().unwrap_or(Value::Null);
        let mut restored = self
            .saved_stacks
            .pop()
            .ok_or_else(|| VmError::new("call bookkeeping corrupted"))?;
        restored.push(result);
        self.stack = restored;
        self.frames.pop();
        self.current_function = caller;
        Ok(Flow::Continue)
    }

    fn op_binary(&mut self, op: Opcode) -> Result<Flow, VmError> {
        let rhs = self.pop("binary operation")?;
        let lhs = self.pop("binary operation")?;
        let result = binary_arith(op, lhs, rhs)?;
        self.stack.push(result);
        Ok(Flow::Continue)
    }

    fn op_compare(&mut self, op: Opcode) -> Result<Flow, VmError> {
        let rhs = self.pop("comparison")?;
        let lhs = self.pop("comparison")?;
        let result = compare(op, lhs, rhs)?;
        self.stack.push(result);
        Ok(Flow::Continue)
    }

    fn op_jump(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let offset = reader.read_i16()?;
        reader.branch(offset)?;
        Ok(Flow::Continue)
    }

    fn op_jump_if_false(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let offset = reader.read_i16()?;
        let condition = self.pop("jump-if-false")?;
        if !condition.is_truthy() {
            reader.branch(offset)?;
        }
        Ok(Flow::Continue)
    }

    fn op_make_function(
        &mut self,
        reader: &mut BytecodeReader<'_>,
        constants: &[Value],
    ) -> Result<Flow, VmError> {
        let name = reader.read_string()?;
        let argc = reader.read_u8()?;
        let body_len = reader.read_u16()? as usize;
        let body = reader.read_bytes(body_len)?.to_vec();
        let local_count = reader.read_u8()?;

        // The new entry snapshots the pool that is current at definition
        let func = Function::new(name, argc, body, constants.to_vec(), local_count);
        self.functions.insert(func.name.clone(), func);
        Ok(Flow::Continue)
    }

    fn op_make_array(&mut self, reader: &mut BytecodeReader<'_>) -> Result<Flow, VmError> {
        let count = reader.read_u16()? as usize;
        if self.stack.len() < count {
            return Err(VmError::new(format!(
                "operand stack underflow making array of {}",
                count
            )));
        }
        let at = self.stack.len() - count;
        let elements = self.stack.split_off(at);

        // Collection stays suspended until the new array is rooted on the
        // operand stack
        let id = self.heap.create_array(elements)?;
        self.stack.push(Value::Array(id));
        let roots = self.gather_roots();
        self.heap.reenable(&roots)?;
        Ok(Flow::Continue)
    }

    fn op_array_get(&mut self) -> Result<Flow, VmError> {
        let index = self.pop("array-get")?;
        let array = self.pop("array-get")?;
        let (id, index) = array_access(&array, &index)?;
        let value = self.heap.array_get(id, index)?;
        self.stack.push(value);
        Ok(Flow::Continue)
    }

    fn op_array_set(&mut self) -> Result<Flow, VmError> {
        let value = self.pop("array-set")?;
        let index = self.pop("array-set")?;
        let array = self.pop("array-set")?;
        let (id, index) = array_access(&array, &index)?;
        self.heap.array_set(id, index, value.clone())?;
        self.stack.push(value);
        Ok(Flow::Continue)
    }
}

fn array_access(array: &Value, index: &Value) -> Result<(core_types::ObjectId, usize), VmError> {
    let id = match array {
        Value::Array(id) => *id,
        other => {
            return Err(VmError::new(format!(
                "cannot index into a value of type {}",
                other.type_name()
            )))
        }
    };
    match index {
        Value::Int(i) if *i >= 0 => Ok((id, *i as usize)),
        Value::Int(i) => Err(VmError::new(format!("array index {} out of range", i))),
        other => Err(VmError::new(format!(
            "array index must be an integer, got {}",
            other.type_name()
        ))),
    }
}

fn float_pair(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    let as_float = |value: &Value| match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    };
    Some((as_float(lhs)?, as_float(rhs)?))
}

/// Arithmetic over the fixed numeric representation: wrapping 64-bit
/// integers, truncating integer division, IEEE doubles for mixed or
/// float operands. String addition concatenates.
fn binary_arith(op: Opcode, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match (op, &lhs, &rhs) {
        (Opcode::BinaryAdd, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Opcode::BinarySub, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        (Opcode::BinaryMul, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
        (Opcode::BinaryDiv, Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(VmError::new("integer division by zero"))
            } else {
                Ok(Value::Int(a.wrapping_div(*b)))
            }
        }
        (Opcode::BinaryAdd, Value::Str(a), Value::Str(b)) => {
            Ok(Value::Str(format!("{}{}", a, b)))
        }
        _ => {
            let (x, y) = float_pair(&lhs, &rhs).ok_or_else(|| {
                VmError::new(format!(
                    "unsupported operand types for {:?}: {} and {}",
                    op,
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            Ok(Value::Float(match op {
                Opcode::BinaryAdd => x + y,
                Opcode::BinarySub => x - y,
                Opcode::BinaryMul => x * y,
                Opcode::BinaryDiv => x / y,
                _ => unreachable!("non-arithmetic opcode in binary_arith"),
            }))
        }
    }
}

fn compare(op: Opcode, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    if op == Opcode::CompareEq {
        return Ok(Value::Bool(lhs == rhs));
    }
    let ordering_gt = match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => match op {
            Opcode::CompareGt => a > b,
            _ => a < b,
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Opcode::CompareGt => a > b,
            _ => a < b,
        },
        _ => {
            let (x, y) = float_pair(&lhs, &rhs).ok_or_else(|| {
                VmError::new(format!(
                    "unsupported comparison between {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            match op {
                Opcode::CompareGt => x > y,
                _ => x < y,
            }
        }
    };
    Ok(Value::Bool(ordering_gt))
}
