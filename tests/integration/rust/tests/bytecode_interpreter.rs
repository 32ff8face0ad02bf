//! Bytecode interpreter integration tests
//!
//! End-to-end programs through the wire format: arithmetic, control flow,
//! function definition and calls, recursion, arrays, and the stack-balance
//! and unwind guarantees.

use bytecode_system::{BytecodeWriter, Function, Opcode};
use core_types::Value;
use interpreter::{Vm, VmOptions};

fn interpreted_vm() -> Vm {
    Vm::with_options(VmOptions {
        jit_enabled: false,
        ..VmOptions::default()
    })
    .unwrap()
}

/// Test: 5 + 3 evaluates to 8
#[test]
fn test_addition_program() {
    let mut vm = interpreted_vm();
    let five = vm.add_constant(Value::Int(5));
    let three = vm.add_constant(Value::Int(3));

    let mut writer = BytecodeWriter::new();
    writer.load_const(five);
    writer.load_const(three);
    writer.emit_op(Opcode::BinaryAdd);
    writer.ret();

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(8)));
}

/// Test: 10 / 2 evaluates to 5 (integer division truncates toward zero)
#[test]
fn test_division_program() {
    let mut vm = interpreted_vm();
    let ten = vm.add_constant(Value::Int(10));
    let two = vm.add_constant(Value::Int(2));

    let mut writer = BytecodeWriter::new();
    writer.load_const(ten);
    writer.load_const(two);
    writer.emit_op(Opcode::BinaryDiv);
    writer.ret();

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(5)));
}

/// Test: conditional selects the correct branch
#[test]
fn test_conditional_branches() {
    let mut vm = interpreted_vm();
    let five = vm.add_constant(Value::Int(5));
    let three = vm.add_constant(Value::Int(3));
    let yes = vm.add_constant(Value::Int(111));
    let no = vm.add_constant(Value::Int(222));

    // if 5 > 3 { 111 } else { 222 }
    let mut writer = BytecodeWriter::new();
    writer.load_const(five); // offset 0
    writer.load_const(three); // offset 3
    writer.emit_op(Opcode::CompareGt); // offset 6
    writer.jump_if_false(4); // offset 7, else at 14
    writer.load_const(yes); // offset 10
    writer.ret(); // offset 13
    writer.load_const(no); // offset 14
    writer.ret(); // offset 17

    assert_eq!(
        vm.execute(&writer.into_bytes()).unwrap(),
        Some(Value::Int(111))
    );
}

/// Test: a function defined by MakeFunction is callable and sees its
/// arguments positionally
#[test]
fn test_function_call_round_trip() {
    let mut vm = interpreted_vm();
    let two = vm.add_constant(Value::Int(2));
    let three = vm.add_constant(Value::Int(3));

    // sub2(a, b) = a - b
    let mut body = BytecodeWriter::new();
    body.load_arg(0);
    body.load_arg(1);
    body.emit_op(Opcode::BinarySub);
    body.ret();
    let body = body.into_bytes();

    let mut writer = BytecodeWriter::new();
    writer.make_function("sub2", 2, &body, 0);
    writer.load_const(three);
    writer.load_const(two);
    writer.call_function("sub2", 2);
    writer.ret();

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(1)));
}

/// Test: recursive calls nest correctly (factorial through the frame
/// stack)
#[test]
fn test_recursive_factorial() {
    let mut vm = Vm::new();
    let one = vm.add_constant(Value::Int(1));
    let n = vm.add_constant(Value::Int(12));

    // fact(n) = if n > 1 { n * fact(n - 1) } else { 1 }
    let mut body = BytecodeWriter::new();
    body.load_arg(0); // offset 0
    body.load_const(one); // offset 2
    body.emit_op(Opcode::CompareGt); // offset 5
    body.jump_if_false(18); // offset 6, else at 27
    body.load_arg(0); // offset 9
    body.load_arg(0); // offset 11
    body.load_const(one); // offset 13
    body.emit_op(Opcode::BinarySub); // offset 16
    body.call_function("fact", 1); // offset 17 (8 bytes)
    body.emit_op(Opcode::BinaryMul); // offset 25
    body.ret(); // offset 26
    body.load_const(one); // offset 27
    body.ret(); // offset 30
    let body = body.into_bytes();

    vm.register_function(Function::new("fact", 1, body, vec![Value::Int(1)], 0));

    // The function's own pool was snapshotted at registration; the main
    // program uses the VM pool
    let mut writer = BytecodeWriter::new();
    writer.load_const(n);
    writer.call_function("fact", 1);
    writer.ret();

    assert_eq!(
        vm.execute(&writer.into_bytes()).unwrap(),
        Some(Value::Int(479_001_600))
    );
}

/// Test: execute leaves the operand stack balanced (pre-call depth plus
/// exactly the returned value)
#[test]
fn test_stack_balance_after_calls() {
    let mut vm = interpreted_vm();
    let two = vm.add_constant(Value::Int(2));

    let mut body = BytecodeWriter::new();
    body.load_arg(0);
    body.ret();
    let body = body.into_bytes();

    let mut writer = BytecodeWriter::new();
    writer.make_function("identity", 1, &body, 0);
    writer.load_const(two);
    writer.call_function("identity", 1);
    writer.ret();

    let result = vm.execute(&writer.into_bytes()).unwrap();
    assert_eq!(result, Some(Value::Int(2)));
    // The returned value was the only thing left; popping it emptied the
    // stack
    assert_eq!(vm.stack_depth(), 0);
}

/// Test: a callee that returns nothing yields null to its caller
#[test]
fn test_valueless_return_yields_null() {
    let mut vm = interpreted_vm();

    let mut body = BytecodeWriter::new();
    body.ret();
    let body = body.into_bytes();

    let mut writer = BytecodeWriter::new();
    writer.make_function("nothing", 0, &body, 0);
    writer.call_function("nothing", 0);
    writer.ret();

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Null));
}

/// Test: errors inside a callee surface with the callee's context and
/// leave the VM usable
#[test]
fn test_error_in_callee_reports_location() {
    let mut vm = interpreted_vm();

    let mut body = BytecodeWriter::new();
    body.load_var("missing");
    body.ret();
    let body = body.into_bytes();

    let mut writer = BytecodeWriter::new();
    writer.make_function("broken", 0, &body, 0);
    writer.call_function("broken", 0);
    let program = writer.into_bytes();

    let err = vm.execute(&program).unwrap_err();
    assert!(err.message.contains("undefined variable: missing"));
    assert_eq!(err.function.as_deref(), Some("broken"));

    // The VM recovers for the next statement
    let seven = vm.add_constant(Value::Int(7));
    let mut writer = BytecodeWriter::new();
    writer.load_const(seven);
    writer.ret();
    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(7)));
}

/// Test: arrays built, mutated and read through bytecode
#[test]
fn test_array_program() {
    let mut vm = interpreted_vm();
    let ten = vm.add_constant(Value::Int(10));
    let twenty = vm.add_constant(Value::Int(20));
    let zero = vm.add_constant(Value::Int(0));
    let ninety = vm.add_constant(Value::Int(90));

    // a = [10, 20]; a[0] = 90; a[0] + a... returns the stored value
    let mut writer = BytecodeWriter::new();
    writer.load_const(ten);
    writer.load_const(twenty);
    writer.make_array(2);
    writer.store_var("a");
    writer.load_const(zero);
    writer.load_const(ninety);
    writer.array_set();
    writer.ret();

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(90)));

    // Read it back in a second statement through the global
    let mut writer = BytecodeWriter::new();
    writer.load_var("a");
    writer.load_const(zero);
    writer.array_get();
    writer.ret();
    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(90)));
}

/// Test: array-get out of range raises an execution error, never returns
/// garbage
#[test]
fn test_array_out_of_range_is_error() {
    let mut vm = interpreted_vm();
    let one = vm.add_constant(Value::Int(1));
    let nine = vm.add_constant(Value::Int(9));

    let mut writer = BytecodeWriter::new();
    writer.load_const(one);
    writer.make_array(1);
    writer.load_const(nine);
    writer.array_get();

    let err = vm.execute(&writer.into_bytes()).unwrap_err();
    assert!(err.message.contains("out of range"));
}

/// Test: the wire format round-trips through writer and reader exactly
/// as the VM consumes it (negative jump offsets, embedded names)
#[test]
fn test_wire_format_loop() {
    let mut vm = interpreted_vm();
    let five = vm.add_constant(Value::Int(5));
    let zero = vm.add_constant(Value::Int(0));
    let one = vm.add_constant(Value::Int(1));

    // i = 5; while i > 0 { i = i - 1 }; result is i (0)
    let mut writer = BytecodeWriter::new();
    writer.load_const(five); // offset 0
    writer.store_var("i"); // offset 3
    writer.load_var("i"); // offset 7 (loop head)
    writer.load_const(zero); // offset 11
    writer.emit_op(Opcode::CompareGt); // offset 14
    writer.jump_if_false(15); // offset 15, exit at 33
    writer.load_var("i"); // offset 18
    writer.load_const(one); // offset 22
    writer.emit_op(Opcode::BinarySub); // offset 25
    writer.store_var("i"); // offset 26
    writer.jump(-26); // offset 30, back to 7
    writer.ret(); // offset 33

    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(0)));
    assert_eq!(vm.get_global("i"), Some(Value::Int(0)));
}
