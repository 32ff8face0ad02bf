//! Runtime heap integration.
//!
//! Bridges the VM's array objects to the memory manager: each array is
//! backed by an allocator block whose address is its identity, registered
//! with the garbage collector, with element references tracked as edges.
//! Sweeping an array releases both the block and the element table entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use core_types::{ObjectId, Value};
use memory_manager::{
    CollectStats, EmptyRoots, GarbageCollector, GcStats, MemoryAllocator, RootProvider,
    UsageStats,
};

use crate::error::VmError;

/// Bytes reserved per array element slot.
const ELEMENT_SIZE: usize = 16;

/// A snapshot of the VM's root set.
///
/// The VM gathers every object handle reachable from its frames and
/// operand stacks into one of these before handing control to the
/// collector.
#[derive(Debug, Clone, Default)]
pub struct Roots(pub Vec<ObjectId>);

impl RootProvider for Roots {
    fn roots(&self) -> Vec<ObjectId> {
        self.0.clone()
    }
}

/// The VM's heap: allocator, collector, and the array table.
pub struct RuntimeHeap {
    allocator: Rc<RefCell<MemoryAllocator>>,
    gc: GarbageCollector,
    arrays: HashMap<ObjectId, Vec<Value>>,
}

impl std::fmt::Debug for RuntimeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHeap")
            .field("arrays", &self.arrays.len())
            .field("gc", &self.gc)
            .finish()
    }
}

impl RuntimeHeap {
    /// Create a heap with a fresh allocator and collector.
    pub fn new() -> Self {
        let allocator = Rc::new(RefCell::new(MemoryAllocator::new()));
        let gc = GarbageCollector::new(allocator.clone());
        Self {
            allocator,
            gc,
            arrays: HashMap::new(),
        }
    }

    /// A handle to the shared allocator (the JIT draws its executable
    /// blocks from the same allocator).
    pub fn allocator_handle(&self) -> Rc<RefCell<MemoryAllocator>> {
        self.allocator.clone()
    }

    /// Allocate and register a new array.
    ///
    /// Automatic collection is suspended while the object graph is
    /// half-built; the caller must root the returned handle (push it on
    /// the operand stack) and then call [`RuntimeHeap::reenable`].
    pub fn create_array(&mut self, elements: Vec<Value>) -> Result<ObjectId, VmError> {
        self.gc.disable();

        let size = ELEMENT_SIZE * elements.len().max(1);
        let address = self.allocator.borrow_mut().allocate(size, false)?;
        let id = ObjectId(address);

        self.gc.register_object(id, &EmptyRoots)?;
        for element in &elements {
            if let Some(target) = element.object_id() {
                self.gc.add_reference(id, target);
            }
        }
        self.arrays.insert(id, elements);
        Ok(id)
    }

    /// Resume automatic collection after a `create_array`, collecting
    /// immediately if the young generation crossed its threshold.
    pub fn reenable(&mut self, roots: &dyn RootProvider) -> Result<(), VmError> {
        if let Some(report) = self.gc.enable(roots)? {
            self.prune(&report.swept);
        }
        Ok(())
    }

    /// Number of elements in an array.
    pub fn array_len(&self, id: ObjectId) -> Option<usize> {
        self.arrays.get(&id).map(Vec::len)
    }

    /// Read an element.
    pub fn array_get(&self, id: ObjectId, index: usize) -> Result<Value, VmError> {
        let elements = self
            .arrays
            .get(&id)
            .ok_or_else(|| VmError::new(format!("dangling array reference {}", id)))?;
        elements
            .get(index)
            .cloned()
            .ok_or_else(|| {
                VmError::new(format!(
                    "array index {} out of range for length {}",
                    index,
                    elements.len()
                ))
            })
    }

    /// Write an element, maintaining reference edges for element arrays.
    pub fn array_set(&mut self, id: ObjectId, index: usize, value: Value) -> Result<(), VmError> {
        let elements = self
            .arrays
            .get_mut(&id)
            .ok_or_else(|| VmError::new(format!("dangling array reference {}", id)))?;
        let len = elements.len();
        let slot = elements.get_mut(index).ok_or_else(|| {
            VmError::new(format!("array index {} out of range for length {}", index, len))
        })?;

        let old = std::mem::replace(slot, value.clone());
        if let Some(target) = old.object_id() {
            self.gc.remove_reference(id, target);
        }
        if let Some(target) = value.object_id() {
            self.gc.add_reference(id, target);
        }
        Ok(())
    }

    /// Whether an array is still live.
    pub fn contains_array(&self, id: ObjectId) -> bool {
        self.arrays.contains_key(&id)
    }

    /// Run a collection and reclaim the table entries of swept arrays.
    pub fn collect(
        &mut self,
        generation: Option<usize>,
        roots: &dyn RootProvider,
    ) -> Result<CollectStats, VmError> {
        let report = self.gc.collect(generation, roots)?;
        self.prune(&report.swept);
        Ok(report)
    }

    /// Force collection of all three generations.
    pub fn full_collect(&mut self, roots: &dyn RootProvider) -> Result<CollectStats, VmError> {
        let report = self.gc.full_collect(roots)?;
        self.prune(&report.swept);
        Ok(report)
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    /// Allocator statistics.
    pub fn memory_stats(&self) -> UsageStats {
        self.allocator.borrow().usage_stats()
    }

    /// Adjust collection thresholds.
    pub fn set_gc_threshold(&mut self, gen0: Option<usize>, gen1: Option<usize>) {
        self.gc.set_threshold(gen0, gen1);
    }

    /// Which generation an array currently lives in.
    pub fn generation_of(&self, id: ObjectId) -> Option<usize> {
        self.gc.generation_of(id)
    }

    fn prune(&mut self, swept: &[ObjectId]) {
        for id in swept {
            self.arrays.remove(id);
        }
    }
}

impl Default for RuntimeHeap {
    fn default() -> Self {
        Self::new()
    }
}
