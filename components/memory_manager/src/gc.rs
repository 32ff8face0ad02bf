//! Generational mark-and-sweep garbage collector.
//!
//! The collector tracks three generations over an explicit object/edge
//! registry:
//! - Generation 0 (young): collected when its live count crosses a
//!   threshold
//! - Generation 1: collected when a cascade finds it over its own threshold
//! - Generation 2 (old): collected only on explicit request
//!
//! Survivors promote upward one tier per collection, never backward. Root
//! discovery is delegated to the embedder through the `RootProvider`
//! capability; the interpreter implements it over its frames and operand
//! stacks.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use core_types::ObjectId;
use thiserror::Error;

use crate::allocator::{AllocError, MemoryAllocator};

/// Default generation-0 live-count threshold.
const GEN0_THRESHOLD: usize = 1000;
/// Default generation-1 live-count threshold.
const GEN1_THRESHOLD: usize = 100;
/// Number of generations.
const GENERATION_COUNT: usize = 3;

/// Collection failures.
#[derive(Debug, Error)]
pub enum GcError {
    /// A cleanup hook reported an error during sweep
    #[error("cleanup hook failed for object {0}: {1}")]
    Finalizer(ObjectId, String),
    /// Releasing an object's block failed
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// `collect` was asked for a generation that does not exist
    #[error("invalid generation: {0}")]
    InvalidGeneration(usize),
}

/// Root-set discovery capability.
///
/// Implemented by the embedder (the VM enumerates global bindings, every
/// active frame's arguments and locals, and all live operand-stack
/// values). Objects returned here anchor the mark phase.
pub trait RootProvider {
    /// Every object handle that must be considered reachable.
    fn roots(&self) -> Vec<ObjectId>;
}

/// A provider with no roots, for collections over fully tracked graphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRoots;

impl RootProvider for EmptyRoots {
    fn roots(&self) -> Vec<ObjectId> {
        Vec::new()
    }
}

impl RootProvider for Vec<ObjectId> {
    fn roots(&self) -> Vec<ObjectId> {
        self.clone()
    }
}

/// Cleanup hook run when an object is swept. Errors propagate to the
/// `collect` caller; they are never swallowed.
pub type CleanupHook = Box<dyn FnMut() -> Result<(), GcError>>;

/// Report of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectStats {
    /// Objects swept, in the order they were visited
    pub swept: Vec<ObjectId>,
    /// Objects promoted to an older generation
    pub promoted: usize,
}

impl CollectStats {
    fn absorb(&mut self, other: CollectStats) {
        self.swept.extend(other.swept);
        self.promoted += other.promoted;
    }
}

/// Point-in-time collector statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcStats {
    /// Live objects in generation 0
    pub gen0_objects: usize,
    /// Live objects in generation 1
    pub gen1_objects: usize,
    /// Live objects in generation 2
    pub gen2_objects: usize,
    /// Total tracked forward references
    pub total_references: usize,
    /// Collections performed
    pub collections: usize,
    /// Whether automatic triggering is enabled
    pub enabled: bool,
}

/// One generation's live table, in registration order.
#[derive(Default)]
struct Generation {
    order: Vec<ObjectId>,
    members: HashSet<ObjectId>,
}

impl Generation {
    fn insert(&mut self, id: ObjectId) {
        if self.members.insert(id) {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: ObjectId) {
        if self.members.remove(&id) {
            if let Some(pos) = self.order.iter().position(|&x| x == id) {
                self.order.remove(pos);
            }
        }
    }

    fn contains(&self, id: ObjectId) -> bool {
        self.members.contains(&id)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// 3-generation mark-and-sweep collector over the allocator.
///
/// Objects are identified by the address of their backing block; sweeping
/// an object releases that block through the allocator.
pub struct GarbageCollector {
    allocator: Rc<RefCell<MemoryAllocator>>,
    generations: [Generation; GENERATION_COUNT],
    references: HashMap<ObjectId, HashSet<ObjectId>>,
    reverse_refs: HashMap<ObjectId, HashSet<ObjectId>>,
    hooks: HashMap<ObjectId, CleanupHook>,
    gen0_threshold: usize,
    gen1_threshold: usize,
    collections: usize,
    enabled: bool,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("gen0", &self.generations[0].len())
            .field("gen1", &self.generations[1].len())
            .field("gen2", &self.generations[2].len())
            .field("collections", &self.collections)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl GarbageCollector {
    /// Create a collector deallocating through the given allocator.
    pub fn new(allocator: Rc<RefCell<MemoryAllocator>>) -> Self {
        Self {
            allocator,
            generations: Default::default(),
            references: HashMap::new(),
            reverse_refs: HashMap::new(),
            hooks: HashMap::new(),
            gen0_threshold: GEN0_THRESHOLD,
            gen1_threshold: GEN1_THRESHOLD,
            collections: 0,
            enabled: true,
        }
    }

    /// Register a new object in generation 0 with empty edge sets.
    ///
    /// May trigger a generation-0 collection when automatic triggering is
    /// enabled and the threshold is reached; the report of that collection
    /// is returned so the embedder can reclaim its side tables.
    pub fn register_object(
        &mut self,
        id: ObjectId,
        roots: &dyn RootProvider,
    ) -> Result<Option<CollectStats>, GcError> {
        if self.contains(id) {
            return Ok(None);
        }
        self.generations[0].insert(id);
        self.references.insert(id, HashSet::new());
        self.reverse_refs.insert(id, HashSet::new());

        if self.enabled && self.generations[0].len() >= self.gen0_threshold {
            return self.collect(None, roots).map(Some);
        }
        Ok(None)
    }

    /// Track a reference between two registered objects.
    ///
    /// Referencing an unregistered object is a no-op, not an error.
    pub fn add_reference(&mut self, from: ObjectId, to: ObjectId) {
        if self.references.contains_key(&from) && self.reverse_refs.contains_key(&to) {
            if let Some(targets) = self.references.get_mut(&from) {
                targets.insert(to);
            }
            if let Some(sources) = self.reverse_refs.get_mut(&to) {
                sources.insert(from);
            }
        }
    }

    /// Remove a tracked reference. Removing an absent edge is a no-op.
    pub fn remove_reference(&mut self, from: ObjectId, to: ObjectId) {
        if let Some(targets) = self.references.get_mut(&from) {
            targets.remove(&to);
        }
        if let Some(sources) = self.reverse_refs.get_mut(&to) {
            sources.remove(&from);
        }
    }

    /// Install a cleanup hook run when the object is swept.
    ///
    /// Returns false if the object is not registered.
    pub fn set_cleanup_hook(&mut self, id: ObjectId, hook: CleanupHook) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.hooks.insert(id, hook);
        true
    }

    /// Run a collection.
    ///
    /// With `generation = None` the generational cascade runs: generation 0
    /// is always swept, generation 1 only if over its threshold, and
    /// generation 2 never. An explicit generation collects only that tier.
    /// Survivors promote one tier upward after their generation's sweep
    /// completes.
    pub fn collect(
        &mut self,
        generation: Option<usize>,
        roots: &dyn RootProvider,
    ) -> Result<CollectStats, GcError> {
        let mut stats = CollectStats::default();
        match generation {
            None => {
                stats.absorb(self.collect_tier(0, roots)?);
                if self.generations[1].len() >= self.gen1_threshold {
                    stats.absorb(self.collect_tier(1, roots)?);
                }
            }
            Some(tier) if tier < GENERATION_COUNT => {
                stats.absorb(self.collect_tier(tier, roots)?);
            }
            Some(tier) => return Err(GcError::InvalidGeneration(tier)),
        }
        self.collections += 1;
        Ok(stats)
    }

    /// Force collection of all three generations.
    pub fn full_collect(&mut self, roots: &dyn RootProvider) -> Result<CollectStats, GcError> {
        let mut stats = CollectStats::default();
        for tier in 0..GENERATION_COUNT {
            stats.absorb(self.collect(Some(tier), roots)?);
        }
        Ok(stats)
    }

    /// Suspend automatic triggering from `register_object`.
    ///
    /// Used to protect in-progress object-graph mutation; explicit
    /// `collect` calls still run.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Re-enable automatic triggering, collecting immediately if the
    /// generation-0 threshold is already exceeded.
    pub fn enable(&mut self, roots: &dyn RootProvider) -> Result<Option<CollectStats>, GcError> {
        self.enabled = true;
        if self.generations[0].len() >= self.gen0_threshold {
            return self.collect(None, roots).map(Some);
        }
        Ok(None)
    }

    /// Whether automatic triggering is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Adjust collection thresholds (clamped to 100 / 10 at minimum).
    pub fn set_threshold(&mut self, gen0: Option<usize>, gen1: Option<usize>) {
        if let Some(threshold) = gen0 {
            self.gen0_threshold = threshold.max(100);
        }
        if let Some(threshold) = gen1 {
            self.gen1_threshold = threshold.max(10);
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> GcStats {
        GcStats {
            gen0_objects: self.generations[0].len(),
            gen1_objects: self.generations[1].len(),
            gen2_objects: self.generations[2].len(),
            total_references: self.references.values().map(HashSet::len).sum(),
            collections: self.collections,
            enabled: self.enabled,
        }
    }

    /// Which generation an object currently lives in.
    pub fn generation_of(&self, id: ObjectId) -> Option<usize> {
        self.generations
            .iter()
            .position(|generation| generation.contains(id))
    }

    /// Whether an object is registered in any generation.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.generations
            .iter()
            .any(|generation| generation.contains(id))
    }

    fn collect_tier(
        &mut self,
        tier: usize,
        roots: &dyn RootProvider,
    ) -> Result<CollectStats, GcError> {
        // Younger generations anchor marking when sweeping an older tier
        let mut root_set: HashSet<ObjectId> = roots.roots().into_iter().collect();
        for younger in 0..tier {
            root_set.extend(self.generations[younger].members.iter().copied());
        }

        let marked = self.mark(root_set);
        let swept = self.sweep_generation(tier, &marked)?;
        let promoted = self.promote_generation(tier);

        Ok(CollectStats { swept, promoted })
    }

    /// Mark phase: everything reachable from the root set via forward edges.
    fn mark(&self, roots: HashSet<ObjectId>) -> HashSet<ObjectId> {
        let mut marked = HashSet::new();
        let mut pending: Vec<ObjectId> = roots.into_iter().collect();

        while let Some(id) = pending.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(targets) = self.references.get(&id) {
                for &target in targets {
                    if !marked.contains(&target) {
                        pending.push(target);
                    }
                }
            }
        }
        marked
    }

    /// Sweep phase: release every unmarked object of one generation, in
    /// registration order.
    fn sweep_generation(
        &mut self,
        tier: usize,
        marked: &HashSet<ObjectId>,
    ) -> Result<Vec<ObjectId>, GcError> {
        let snapshot = self.generations[tier].order.clone();
        let mut swept = Vec::new();

        for id in snapshot {
            if marked.contains(&id) {
                continue;
            }
            // Removal is irreversible: an object leaves the live table
            // before its hook runs, so it can never be swept twice.
            self.generations[tier].remove(id);
            swept.push(id);

            if let Some(mut hook) = self.hooks.remove(&id) {
                hook()?;
            }
            self.drop_edges(id);
            self.allocator.borrow_mut().free(id.0)?;
        }
        Ok(swept)
    }

    /// Move every survivor of a generation to the next tier, preserving
    /// registration order. Generation 2 survivors stay put.
    fn promote_generation(&mut self, tier: usize) -> usize {
        if tier + 1 >= GENERATION_COUNT {
            return 0;
        }
        let order = std::mem::take(&mut self.generations[tier].order);
        self.generations[tier].members.clear();

        let promoted = order.len();
        for id in order {
            self.generations[tier + 1].insert(id);
        }
        promoted
    }

    fn drop_edges(&mut self, id: ObjectId) {
        if let Some(targets) = self.references.remove(&id) {
            for target in targets {
                if let Some(sources) = self.reverse_refs.get_mut(&target) {
                    sources.remove(&id);
                }
            }
        }
        if let Some(sources) = self.reverse_refs.remove(&id) {
            for source in sources {
                if let Some(targets) = self.references.get_mut(&source) {
                    targets.remove(&id);
                }
            }
        }
    }
}
