//! Tiering controller.
//!
//! Watches per-function call counts on the shared `CallCounters`
//! capability, decides promotion, compiles through the architecture
//! backend, and caches the resulting native entries by name. Compilation
//! is idempotent; functions the translator declines are pinned to the
//! interpreter and never retried.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use bytecode_system::Function;
use core_types::{CallCounters, Value};
use memory_manager::MemoryAllocator;

use crate::backend::{backend_for, generate, CodegenBackend};
use crate::error::JitError;
use crate::native::{unmarshal_result, MarshalledArg, NativeFunction, MAX_ARGS};

/// Controller statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TieringStats {
    /// Functions successfully compiled
    pub functions_compiled: u64,
    /// Functions declined by translation and pinned to the interpreter
    pub functions_declined: u64,
    /// Total native code bytes emitted
    pub code_bytes: usize,
}

/// JIT compiler and tiering controller.
///
/// Owns the per-function hotness counter (shared capability between the
/// VM and the controller), the compiled-function cache, and the
/// architecture backend chosen at construction.
pub struct JitCompiler {
    allocator: Rc<RefCell<MemoryAllocator>>,
    backend: Box<dyn CodegenBackend>,
    counters: CallCounters,
    compiled: HashMap<String, NativeFunction>,
    declined: HashSet<String>,
    stats: TieringStats,
}

impl std::fmt::Debug for JitCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCompiler")
            .field("architecture", &self.backend.architecture())
            .field("compiled", &self.compiled.len())
            .field("declined", &self.declined.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl JitCompiler {
    /// Create a controller for an explicit architecture identifier.
    ///
    /// Unrecognized identifiers fail with `UnsupportedPlatform`.
    pub fn new(arch: &str, allocator: Rc<RefCell<MemoryAllocator>>) -> Result<Self, JitError> {
        Ok(Self {
            allocator,
            backend: backend_for(arch)?,
            counters: CallCounters::new(),
            compiled: HashMap::new(),
            declined: HashSet::new(),
            stats: TieringStats::default(),
        })
    }

    /// Create a controller for the host architecture.
    pub fn host(allocator: Rc<RefCell<MemoryAllocator>>) -> Result<Self, JitError> {
        Self::new(std::env::consts::ARCH, allocator)
    }

    /// The architecture this controller emits code for.
    pub fn architecture(&self) -> &'static str {
        self.backend.architecture()
    }

    /// Record one call; counts keep increasing after compilation.
    pub fn record_call(&mut self, name: &str) -> u64 {
        self.counters.record_call(name)
    }

    /// Current call count for a function.
    pub fn call_count(&self, name: &str) -> u64 {
        self.counters.count(name)
    }

    /// Whether a function should be compiled now: hot, not yet compiled,
    /// and not pinned to the interpreter.
    pub fn should_compile(&self, name: &str) -> bool {
        self.counters.is_hot(name)
            && !self.compiled.contains_key(name)
            && !self.declined.contains(name)
    }

    /// Whether a native entry exists for a function.
    pub fn is_compiled(&self, name: &str) -> bool {
        self.compiled.contains_key(name)
    }

    /// The cached native entry for a function, if any.
    pub fn compiled_entry(&self, name: &str) -> Option<&NativeFunction> {
        self.compiled.get(name)
    }

    /// Replace the promotion threshold (calls before compilation).
    pub fn set_compile_threshold(&mut self, threshold: u64) {
        self.counters.set_threshold(threshold);
    }

    /// Compile a function-table entry to native code.
    ///
    /// Idempotent: a cached entry is returned as-is. The compiled entry's
    /// argument count is the declared arity, so the native-boundary check
    /// holds even for functions that ignore trailing parameters.
    pub fn compile_function(&mut self, func: &Function) -> Result<NativeFunction, JitError> {
        if let Some(entry) = self.compiled.get(&func.name) {
            return Ok(*entry);
        }

        let result = self.compile_fresh(func);
        if let Err(err) = &result {
            if err.is_decline() && self.declined.insert(func.name.clone()) {
                self.stats.functions_declined += 1;
            }
        }
        result
    }

    fn compile_fresh(&mut self, func: &Function) -> Result<NativeFunction, JitError> {
        let translated = crate::translate::lower(&func.bytecode, &func.constants)?;
        if translated.arg_count > func.arity {
            return Err(JitError::Malformed(format!(
                "function `{}` reads argument {} beyond its arity {}",
                func.name,
                translated.arg_count - 1,
                func.arity
            )));
        }

        let code = generate(self.backend.as_mut(), &translated)?;

        let address = self.allocator.borrow_mut().allocate_executable(code.len())?;
        // SAFETY: the block is live, writable (rwx profile) and at least
        // code.len() bytes
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
        }

        let entry = NativeFunction {
            code: address,
            code_size: code.len(),
            arg_count: func.arity,
            returns: func.returns,
        };
        self.compiled.insert(func.name.clone(), entry);
        self.stats.functions_compiled += 1;
        self.stats.code_bytes += code.len();
        Ok(entry)
    }

    /// Execute a compiled function with runtime values.
    ///
    /// Fails `NotCompiled` when no entry exists and `ArityMismatch` unless
    /// exactly the compiled argument count is supplied — the native call
    /// boundary is never crossed with the wrong argument count.
    pub fn execute_native(&self, name: &str, args: &[Value]) -> Result<Value, JitError> {
        let entry = self
            .compiled
            .get(name)
            .ok_or_else(|| JitError::NotCompiled(name.to_string()))?;

        if args.len() != entry.arg_count as usize {
            return Err(JitError::ArityMismatch {
                name: name.to_string(),
                expected: entry.arg_count as usize,
                got: args.len(),
            });
        }

        let marshalled: Vec<MarshalledArg> = args.iter().map(MarshalledArg::from_value).collect();
        let mut raw = [0i64; MAX_ARGS];
        for (index, arg) in marshalled.iter().enumerate() {
            raw[index] = arg.raw;
        }

        // SAFETY: the entry was emitted by this controller's backend for
        // this host and its block is still executable
        let result = unsafe { entry.invoke(raw) };
        unmarshal_result(name, result, entry.returns)
        // `marshalled` drops here, reclaiming any boxed opaque arguments
    }

    /// Precompile a batch of functions ahead of the counter trigger.
    ///
    /// Failures are reported per function name rather than aborting the
    /// batch.
    pub fn warmup(&mut self, functions: &[Function]) -> Vec<(String, JitError)> {
        let mut failures = Vec::new();
        for func in functions {
            if let Err(err) = self.compile_function(func) {
                failures.push((func.name.clone(), err));
            }
        }
        failures
    }

    /// Controller statistics.
    pub fn stats(&self) -> TieringStats {
        self.stats
    }
}
