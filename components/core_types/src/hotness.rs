//! Per-function call counting for tiering decisions
//!
//! This module is placed in core_types so the interpreter and the tiering
//! controller share a single counter per function instead of keeping
//! divergent copies.

use std::collections::HashMap;

/// Default number of calls a function may receive before it is considered
/// hot (promotion triggers strictly above this count).
pub const DEFAULT_COMPILE_THRESHOLD: u64 = 10;

/// Monotonic per-function call counters driving JIT promotion.
///
/// Counts only ever increase; `record_call` keeps incrementing after a
/// function has been promoted so the counter stays an accurate call total.
#[derive(Debug, Clone)]
pub struct CallCounters {
    counts: HashMap<String, u64>,
    threshold: u64,
}

impl CallCounters {
    /// Create counters with the default promotion threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_COMPILE_THRESHOLD)
    }

    /// Create counters with an explicit promotion threshold.
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    /// Record one call and return the updated count.
    pub fn record_call(&mut self, name: &str) -> u64 {
        let count = self.counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current call count for a function (0 if never called).
    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// Whether a function's call count has crossed the promotion threshold.
    ///
    /// False at exactly the threshold, true strictly above it.
    pub fn is_hot(&self, name: &str) -> bool {
        self.count(name) > self.threshold
    }

    /// The configured promotion threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Replace the promotion threshold.
    pub fn set_threshold(&mut self, threshold: u64) {
        self.threshold = threshold;
    }

    /// Number of distinct functions that have been called.
    pub fn tracked_functions(&self) -> usize {
        self.counts.len()
    }
}

impl Default for CallCounters {
    fn default() -> Self {
        Self::new()
    }
}
