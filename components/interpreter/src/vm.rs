//! Virtual machine for bytecode execution.
//!
//! Main entry point for executing bytecode streams against a function
//! table and constant pool supplied by the loader stage.

use std::collections::HashMap;

use bytecode_system::{BytecodeReader, Function};
use core_types::{ObjectId, Value};
use jit_compiler::{JitCompiler, TieringStats};
use memory_manager::{CollectStats, GcStats, RootProvider, UsageStats};

use crate::dispatch::Flow;
use crate::error::VmError;
use crate::frame::Frame;
use crate::heap::{Roots, RuntimeHeap};

/// VM construction options.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Whether to attach a tiering controller
    pub jit_enabled: bool,
    /// Architecture identifier for the JIT backend; `None` selects the
    /// host architecture
    pub architecture: Option<String>,
    /// Calls before a function is promoted (strictly-greater-than)
    pub compile_threshold: u64,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            jit_enabled: true,
            architecture: None,
            compile_threshold: core_types::hotness::DEFAULT_COMPILE_THRESHOLD,
        }
    }
}

/// Stack-based bytecode virtual machine.
///
/// # Examples
///
/// ```
/// use bytecode_system::BytecodeWriter;
/// use bytecode_system::Opcode;
/// use core_types::Value;
/// use interpreter::Vm;
///
/// let mut vm = Vm::new();
/// let a = vm.add_constant(Value::Int(5));
/// let b = vm.add_constant(Value::Int(3));
///
/// let mut writer = BytecodeWriter::new();
/// writer.load_const(a);
/// writer.load_const(b);
/// writer.emit_op(Opcode::BinaryAdd);
/// writer.ret();
///
/// let result = vm.execute(&writer.into_bytes()).unwrap();
/// assert_eq!(result, Some(Value::Int(8)));
/// ```
#[derive(Debug)]
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) saved_stacks: Vec<Vec<Value>>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) functions: HashMap<String, Function>,
    constants: Vec<Value>,
    pub(crate) heap: RuntimeHeap,
    pub(crate) jit: Option<JitCompiler>,
    pub(crate) current_function: Option<String>,
}

impl Vm {
    /// Create a VM with default options.
    ///
    /// The JIT attaches when the host architecture has a backend and is
    /// silently absent otherwise; execution then stays interpreted.
    pub fn new() -> Self {
        let heap = RuntimeHeap::new();
        let jit = JitCompiler::host(heap.allocator_handle()).ok();
        Self::assemble(heap, jit)
    }

    /// Create a VM with explicit options.
    ///
    /// An explicitly requested architecture that has no backend is an
    /// error; unrecognized identifiers never select a wrong generator.
    pub fn with_options(options: VmOptions) -> Result<Self, VmError> {
        let heap = RuntimeHeap::new();
        let jit = if options.jit_enabled {
            let mut jit = match &options.architecture {
                Some(arch) => JitCompiler::new(arch, heap.allocator_handle())?,
                None => match JitCompiler::host(heap.allocator_handle()) {
                    Ok(jit) => jit,
                    Err(_) => return Ok(Self::assemble(heap, None)),
                },
            };
            jit.set_compile_threshold(options.compile_threshold);
            Some(jit)
        } else {
            None
        };
        Ok(Self::assemble(heap, jit))
    }

    fn assemble(heap: RuntimeHeap, jit: Option<JitCompiler>) -> Self {
        Self {
            stack: Vec::with_capacity(64),
            saved_stacks: Vec::new(),
            frames: vec![Frame::new()],
            functions: HashMap::new(),
            constants: Vec::new(),
            heap,
            jit,
            current_function: None,
        }
    }

    /// Register a function-table entry, replacing any previous entry of
    /// the same name.
    pub fn register_function(&mut self, func: Function) {
        self.functions.insert(func.name.clone(), func);
    }

    /// Append a constant to the top-level pool and return its index.
    pub fn add_constant(&mut self, value: Value) -> u16 {
        let index = self.constants.len() as u16;
        self.constants.push(value);
        index
    }

    /// Bytecode of a registered function (used by the tiering controller
    /// and embedders).
    pub fn get_function_bytecode(&self, name: &str) -> Option<&[u8]> {
        self.functions.get(name).map(|func| func.bytecode.as_slice())
    }

    /// A global binding (root-frame local).
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.frames.first().and_then(|frame| frame.get_local(name).cloned())
    }

    /// Set a global binding.
    pub fn set_global(&mut self, name: String, value: Value) {
        if let Some(frame) = self.frames.first_mut() {
            frame.set_local(name, value);
        }
    }

    /// Execute a bytecode stream against the top-level constant pool.
    ///
    /// Returns the value left on top of the operand stack, if any. On
    /// error the VM fully unwinds: globals survive, but the operand and
    /// frame stacks are reset, so a failed statement never corrupts the
    /// next one.
    pub fn execute(&mut self, bytecode: &[u8]) -> Result<Option<Value>, VmError> {
        self.stack.clear();
        self.saved_stacks.clear();
        self.frames.truncate(1);
        self.current_function = None;

        let constants = self.constants.clone();
        self.run_buffer(bytecode, &constants)?;
        Ok(self.stack.pop())
    }

    /// Run one bytecode buffer to completion (or until `Return`).
    pub(crate) fn run_buffer(
        &mut self,
        bytecode: &[u8],
        constants: &[Value],
    ) -> Result<(), VmError> {
        let mut reader = BytecodeReader::new(bytecode);
        while !reader.is_at_end() {
            let pc = reader.position();
            let op = reader
                .read_opcode()
                .map_err(|err| VmError::from(err).locate(self.current_function.as_deref(), pc))?;
            match self.dispatch(op, &mut reader, constants) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => break,
                Err(err) => {
                    return Err(err.locate(self.current_function.as_deref(), pc));
                }
            }
        }
        Ok(())
    }

    /// Run a collection using the VM's own roots.
    pub fn collect_garbage(&mut self, generation: Option<usize>) -> Result<CollectStats, VmError> {
        let roots = self.gather_roots();
        self.heap.collect(generation, &roots)
    }

    /// Force collection of all three generations.
    pub fn full_collect(&mut self) -> Result<CollectStats, VmError> {
        let roots = self.gather_roots();
        self.heap.full_collect(&roots)
    }

    /// Adjust collection thresholds.
    pub fn set_gc_threshold(&mut self, gen0: Option<usize>, gen1: Option<usize>) {
        self.heap.set_gc_threshold(gen0, gen1);
    }

    /// Allocator statistics.
    pub fn memory_stats(&self) -> UsageStats {
        self.heap.memory_stats()
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.heap.gc_stats()
    }

    /// Tiering statistics, when a JIT is attached.
    pub fn tiering_stats(&self) -> Option<TieringStats> {
        self.jit.as_ref().map(|jit| jit.stats())
    }

    /// Whether a tiering controller is attached.
    pub fn jit_enabled(&self) -> bool {
        self.jit.is_some()
    }

    /// Call count recorded for a function.
    pub fn call_count(&self, name: &str) -> u64 {
        self.jit.as_ref().map_or(0, |jit| jit.call_count(name))
    }

    /// Whether a function has been promoted to native code.
    pub fn is_compiled(&self, name: &str) -> bool {
        self.jit.as_ref().is_some_and(|jit| jit.is_compiled(name))
    }

    /// Current operand-stack depth (for stack-balance checks).
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Snapshot the root set: every object handle reachable from global
    /// bindings, every frame's arguments and locals, the active operand
    /// stack, and all parked caller stacks. Stack temporaries count as
    /// roots.
    pub(crate) fn gather_roots(&self) -> Roots {
        let mut ids: Vec<ObjectId> = Vec::new();
        for frame in &self.frames {
            for value in frame.values() {
                if let Some(id) = value.object_id() {
                    ids.push(id);
                }
            }
        }
        for value in &self.stack {
            if let Some(id) = value.object_id() {
                ids.push(id);
            }
        }
        for stack in &self.saved_stacks {
            for value in stack {
                if let Some(id) = value.object_id() {
                    ids.push(id);
                }
            }
        }
        Roots(ids)
    }
}

impl RootProvider for Vm {
    fn roots(&self) -> Vec<ObjectId> {
        self.gather_roots().0
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
