//! Memory subsystem integration tests
//!
//! Exercises the allocator and collector together, and their integration
//! with the VM's heap: size-class reuse, baseline accounting, generational
//! promotion, and reachability through reference edges.

use bytecode_system::BytecodeWriter;
use core_types::{ObjectId, Value};
use interpreter::{Vm, VmOptions};
use memory_manager::{EmptyRoots, GarbageCollector, MemoryAllocator};
use std::cell::RefCell;
use std::rc::Rc;

fn interpreted_vm() -> Vm {
    Vm::with_options(VmOptions {
        jit_enabled: false,
        ..VmOptions::default()
    })
    .unwrap()
}

/// Test: allocate/free never fails for positive sizes, and the freed
/// block is reused for the next allocation of the same class
#[test]
fn test_allocate_free_reuse_cycle() {
    let mut allocator = MemoryAllocator::new();

    for size in [1, 64, 100, 1000, 65536] {
        let address = allocator.allocate(size, false).unwrap();
        allocator.free(address).unwrap();

        let reused = allocator.allocate(size, false).unwrap();
        assert_eq!(reused, address, "size {} should reuse the freed block", size);
        allocator.free(reused).unwrap();
    }
}

/// Test: total_allocated returns to baseline after matched pairs
#[test]
fn test_total_allocated_baseline() {
    let mut allocator = MemoryAllocator::new();
    let baseline = allocator.usage_stats().total_allocated;

    let addresses: Vec<usize> = (0..16)
        .map(|_| allocator.allocate(256, false).unwrap())
        .collect();
    assert!(allocator.usage_stats().total_allocated > baseline);

    for address in addresses {
        allocator.free(address).unwrap();
    }
    assert_eq!(allocator.usage_stats().total_allocated, baseline);
}

/// Test: an object surviving two full collection cascades ends in
/// generation 2 and never reverts
#[test]
fn test_survivor_reaches_generation_2() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut gc = GarbageCollector::new(allocator.clone());

    let id = ObjectId(allocator.borrow_mut().allocate(64, false).unwrap());
    gc.register_object(id, &EmptyRoots).unwrap();
    let roots = vec![id];

    // Tier-by-tier: one promotion per collection
    gc.collect(Some(0), &roots).unwrap();
    assert_eq!(gc.generation_of(id), Some(1));
    gc.collect(Some(1), &roots).unwrap();
    assert_eq!(gc.generation_of(id), Some(2));

    // Two full cascades leave it in generation 2; promotion never reverses
    gc.full_collect(&roots).unwrap();
    gc.full_collect(&roots).unwrap();
    assert_eq!(gc.generation_of(id), Some(2));
}

/// Test: objects reachable through edges from a root are never freed,
/// and removing an absent edge never raises
#[test]
fn test_edge_reachability() {
    let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
    let mut gc = GarbageCollector::new(allocator.clone());

    let root = ObjectId(allocator.borrow_mut().allocate(64, false).unwrap());
    let child = ObjectId(allocator.borrow_mut().allocate(64, false).unwrap());
    let grandchild = ObjectId(allocator.borrow_mut().allocate(64, false).unwrap());

    gc.register_object(root, &EmptyRoots).unwrap();
    gc.register_object(child, &EmptyRoots).unwrap();
    gc.register_object(grandchild, &EmptyRoots).unwrap();
    gc.add_reference(root, child);
    gc.add_reference(child, grandchild);

    // Absent edge removal is a no-op
    gc.remove_reference(grandchild, root);

    let roots = vec![root];
    let report = gc.collect(Some(0), &roots).unwrap();
    assert!(report.swept.is_empty());
    assert!(allocator.borrow().is_live(child.0));
    assert!(allocator.borrow().is_live(grandchild.0));
}

/// Test: arrays created by the VM become GC objects; unrooted arrays are
/// reclaimed, and a global binding keeps its array alive through full
/// collections until generation 2
#[test]
fn test_vm_arrays_are_collected_and_promoted() {
    let mut vm = interpreted_vm();
    let one = vm.add_constant(Value::Int(1));

    // keep = [1]; the global binding roots it
    let mut writer = BytecodeWriter::new();
    writer.load_const(one);
    writer.make_array(1);
    writer.store_var("keep");
    writer.ret();
    vm.execute(&writer.into_bytes()).unwrap();
    assert_eq!(vm.gc_stats().gen0_objects, 1);

    // A statement that drops its array on the floor
    let mut writer = BytecodeWriter::new();
    writer.load_const(one);
    writer.make_array(1);
    writer.ret();
    vm.execute(&writer.into_bytes()).unwrap();
    assert_eq!(vm.gc_stats().gen0_objects, 2);

    // The unrooted array goes; the global's array survives each tier's
    // sweep and a full collection walks it all the way to generation 2
    vm.full_collect().unwrap();
    let stats = vm.gc_stats();
    assert_eq!(stats.gen0_objects, 0);
    assert_eq!(stats.gen2_objects, 1);

    // The promoted array is still readable
    let mut writer = BytecodeWriter::new();
    writer.load_var("keep");
    let zero = vm.add_constant(Value::Int(0));
    writer.load_const(zero);
    writer.array_get();
    writer.ret();
    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(1)));
}

/// Test: nested arrays survive through element edges when only the outer
/// array is rooted
#[test]
fn test_nested_vm_arrays_survive() {
    let mut vm = interpreted_vm();
    let one = vm.add_constant(Value::Int(1));

    // nest = [[1]]
    let mut writer = BytecodeWriter::new();
    writer.load_const(one);
    writer.make_array(1);
    writer.make_array(1);
    writer.store_var("nest");
    writer.ret();
    vm.execute(&writer.into_bytes()).unwrap();
    assert_eq!(vm.gc_stats().gen0_objects, 2);

    vm.collect_garbage(Some(0)).unwrap();
    // Both arrays survive: the outer via the global, the inner via its edge
    let stats = vm.gc_stats();
    assert_eq!(stats.gen0_objects + stats.gen1_objects, 2);

    let zero = vm.add_constant(Value::Int(0));
    let mut writer = BytecodeWriter::new();
    writer.load_var("nest");
    writer.load_const(zero);
    writer.array_get();
    writer.load_const(zero);
    writer.array_get();
    writer.ret();
    assert_eq!(vm.execute(&writer.into_bytes()).unwrap(), Some(Value::Int(1)));
}

/// Test: executable blocks and data blocks share the allocator, and JIT
/// code pages show up in usage stats
#[test]
fn test_executable_and_data_blocks_coexist() {
    let mut allocator = MemoryAllocator::new();

    let data = allocator.allocate(128, false).unwrap();
    let code = allocator.allocate_executable(128).unwrap();
    assert_ne!(data, code);
    assert_eq!(allocator.is_executable(data), Some(false));
    assert_eq!(allocator.is_executable(code), Some(true));

    let stats = allocator.usage_stats();
    assert_eq!(stats.active_blocks, 2);

    allocator.free(data).unwrap();
    allocator.free(code).unwrap();
    assert_eq!(allocator.usage_stats().active_blocks, 0);
}
