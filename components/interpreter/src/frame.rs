//! Call frames.

use std::collections::HashMap;

use core_types::Value;

/// One call's activation record: positional arguments and named local
/// bindings. Pushed on call, popped on return. The root frame is never
/// popped; its locals are the global bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    args: Vec<Value>,
    locals: HashMap<String, Value>,
}

impl Frame {
    /// Create an empty frame (the root frame).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame binding positional arguments.
    pub fn with_args(args: Vec<Value>) -> Self {
        Self {
            args,
            locals: HashMap::new(),
        }
    }

    /// A positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// A named binding in this frame.
    pub fn get_local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    /// Bind a name in this frame.
    pub fn set_local(&mut self, name: String, value: Value) {
        self.locals.insert(name, value);
    }

    /// All values held by this frame (arguments and locals), for root
    /// enumeration.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().chain(self.locals.values())
    }
}
