//! Full pipeline integration tests
//!
//! Drives the complete tiering path: interpreted execution, call counting,
//! promotion at the threshold, native dispatch, and parity between the
//! interpreted and compiled tiers.

use bytecode_system::{BytecodeWriter, Function, Opcode};
use core_types::Value;
use interpreter::Vm;
use jit_compiler::{JitCompiler, JitError};
use memory_manager::MemoryAllocator;
use std::cell::RefCell;
use std::rc::Rc;

fn add_function() -> Function {
    let mut writer = BytecodeWriter::new();
    writer.load_arg(0);
    writer.load_arg(1);
    writer.emit_op(Opcode::BinaryAdd);
    writer.ret();
    Function::new("add", 2, writer.into_bytes(), vec![], 0)
}

fn call_add_program(vm: &mut Vm) -> Vec<u8> {
    let two = vm.add_constant(Value::Int(2));
    let three = vm.add_constant(Value::Int(3));
    let mut writer = BytecodeWriter::new();
    writer.load_const(two);
    writer.load_const(three);
    writer.call_function("add", 2);
    writer.ret();
    writer.into_bytes()
}

/// Test: should_compile is false through call 10 and true at call 11
#[test]
fn test_promotion_threshold_boundary() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut jit = JitCompiler::new("x86_64", allocator).unwrap();

    for _ in 0..10 {
        jit.record_call("add");
        assert!(!jit.should_compile("add"));
    }
    jit.record_call("add");
    assert!(jit.should_compile("add"));
}

/// Test: compile_function called twice returns the identical cached entry
#[test]
fn test_compilation_is_idempotent() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut jit = JitCompiler::new("x86_64", allocator).unwrap();
    let func = add_function();

    let first = jit.compile_function(&func).unwrap();
    let second = jit.compile_function(&func).unwrap();
    assert_eq!(first.code, second.code);
    assert_eq!(jit.stats().functions_compiled, 1);
}

/// Test: native code lands in executable allocator pages and is counted
/// by the usage stats
#[test]
fn test_native_code_lives_in_allocator_pages() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut jit = JitCompiler::new("x86_64", allocator.clone()).unwrap();
    let entry = jit.compile_function(&add_function()).unwrap();

    assert_eq!(allocator.borrow().is_executable(entry.code), Some(true));
    assert_eq!(allocator.borrow().usage_stats().active_blocks, 1);
}

/// Test: an uncompiled function executes correctly via interpretation,
/// with calls below the threshold never promoting
#[test]
fn test_below_threshold_stays_interpreted() {
    let mut vm = Vm::new();
    vm.register_function(add_function());
    let program = call_add_program(&mut vm);

    for _ in 0..10 {
        assert_eq!(vm.execute(&program).unwrap(), Some(Value::Int(5)));
    }
    assert_eq!(vm.call_count("add"), 10);
    assert!(!vm.is_compiled("add"));
}

/// Test: warmup precompiles a batch ahead of the counter trigger and
/// reports per-function failures
#[test]
fn test_warmup_batch() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut jit = JitCompiler::new("x86_64", allocator).unwrap();

    let mut calling = BytecodeWriter::new();
    calling.call_function("helper", 0);
    calling.ret();
    let calling = Function::new("caller", 0, calling.into_bytes(), vec![], 0);

    let failures = jit.warmup(&[add_function(), calling]);
    assert!(jit.is_compiled("add"));
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "caller");
    assert!(failures[0].1.is_decline());
}

/// Test: unrecognized architecture identifiers fail cleanly
#[test]
fn test_unknown_architecture_fails_cleanly() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let err = JitCompiler::new("wasm32", allocator).unwrap_err();
    assert!(matches!(err, JitError::UnsupportedPlatform(name) if name == "wasm32"));
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod native_tier {
    use super::*;

    /// Test: add(a, b) called 11 times triggers compilation; call 12 runs
    /// on the native path and returns the same result as interpretation
    #[test]
    fn test_hot_function_promotes_and_agrees() {
        let mut vm = Vm::new();
        assert!(vm.jit_enabled());
        vm.register_function(add_function());
        let program = call_add_program(&mut vm);

        for call in 1..=10 {
            assert_eq!(vm.execute(&program).unwrap(), Some(Value::Int(5)));
            assert_eq!(vm.call_count("add"), call);
            assert!(!vm.is_compiled("add"));
        }

        // Call 11 crosses the threshold and compiles synchronously
        assert_eq!(vm.execute(&program).unwrap(), Some(Value::Int(5)));
        assert!(vm.is_compiled("add"));
        assert_eq!(vm.tiering_stats().unwrap().functions_compiled, 1);

        // Call 12 dispatches to native code
        assert_eq!(vm.execute(&program).unwrap(), Some(Value::Int(5)));
        assert_eq!(vm.call_count("add"), 12);
    }

    /// Test: interpreted and native tiers agree across arithmetic,
    /// comparisons, and control flow
    #[test]
    fn test_tier_parity() {
        // bigger(a, b) = if a > b { a * 2 } else { b - a }
        let mut body = BytecodeWriter::new();
        body.load_arg(0); // offset 0
        body.load_arg(1); // offset 2
        body.emit_op(Opcode::CompareGt); // offset 4
        body.jump_if_false(7); // offset 5, else at 15
        body.load_arg(0); // offset 8
        body.load_const(0); // offset 10
        body.emit_op(Opcode::BinaryMul); // offset 13
        body.ret(); // offset 14
        body.load_arg(1); // offset 15
        body.load_arg(0); // offset 17
        body.emit_op(Opcode::BinarySub); // offset 19
        body.ret(); // offset 20
        let func = Function::new("bigger", 2, body.into_bytes(), vec![Value::Int(2)], 0);

        let cases = [(9i64, 4i64), (4, 9), (0, 0), (-3, 5)];

        // Interpreted results
        let mut interpreted = Vec::new();
        {
            let mut vm = interpreter::Vm::with_options(interpreter::VmOptions {
                jit_enabled: false,
                ..interpreter::VmOptions::default()
            })
            .unwrap();
            vm.register_function(func.clone());
            for (a, b) in cases {
                let x = vm.add_constant(Value::Int(a));
                let y = vm.add_constant(Value::Int(b));
                let mut writer = BytecodeWriter::new();
                writer.load_const(x);
                writer.load_const(y);
                writer.call_function("bigger", 2);
                writer.ret();
                interpreted.push(vm.execute(&writer.into_bytes()).unwrap());
            }
        }

        // Native results through the controller
        let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
        let mut jit = JitCompiler::host(allocator).unwrap();
        jit.compile_function(&func).unwrap();
        for ((a, b), expected) in cases.iter().zip(&interpreted) {
            let native = jit
                .execute_native("bigger", &[Value::Int(*a), Value::Int(*b)])
                .unwrap();
            assert_eq!(Some(native), *expected, "case ({}, {})", a, b);
        }
    }

    /// Test: the native divide-by-zero fault surfaces as an execution
    /// error through the VM, like the interpreted one
    #[test]
    fn test_native_divide_fault_surfaces() {
        let mut body = BytecodeWriter::new();
        body.load_arg(0);
        body.load_arg(1);
        body.emit_op(Opcode::BinaryDiv);
        body.ret();
        let func = Function::new("div", 2, body.into_bytes(), vec![], 0);

        let mut vm = Vm::new();
        vm.register_function(func);

        let ten = vm.add_constant(Value::Int(10));
        let zero = vm.add_constant(Value::Int(0));
        let mut writer = BytecodeWriter::new();
        writer.load_const(ten);
        writer.load_const(zero);
        writer.call_function("div", 2);
        writer.ret();
        let program = writer.into_bytes();

        // Interpreted failures up to promotion
        for _ in 0..11 {
            let err = vm.execute(&program).unwrap_err();
            assert!(err.message.contains("division by zero"));
        }
        assert!(vm.is_compiled("div"));

        // Native failure reads the same way
        let err = vm.execute(&program).unwrap_err();
        assert!(err.message.contains("division by zero"));
    }
}
