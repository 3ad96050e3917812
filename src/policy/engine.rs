use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::policy::tree::{PolicyTree, ResolvedVerdict};

struct EngineState {
    tree: Arc<PolicyTree>,
    // resolved verdicts are cached per metric name for efficiency
    cache: HashMap<String, Arc<ResolvedVerdict>>,
}

/// Resolves pruning verdicts against the currently published [`PolicyTree`],
/// memoising results until the next [`reset`](PolicyEngine::reset).
///
/// Safe for concurrent readers; a reload swaps the whole tree and cache in
/// one step, so no verdict ever blends rules from two trees.
pub struct PolicyEngine {
    state: RwLock<EngineState>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(tree: PolicyTree) -> Self {
        PolicyEngine {
            state: RwLock::new(EngineState {
                tree: Arc::new(tree),
                cache: HashMap::new(),
            }),
        }
    }

    /// Returns the merged verdict for `metric`, computing and caching it on
    /// the first miss.
    ///
    /// Two racing callers may both compute the same verdict; the resolution
    /// is pure so whichever insert lands last wins harmlessly.
    pub fn resolve(&self, metric: &str) -> Arc<ResolvedVerdict> {
        let tree = {
            let state = self.state.read().expect("policy state lock poisoned");
            if let Some(verdict) = state.cache.get(metric) {
                return Arc::clone(verdict);
            }
            Arc::clone(&state.tree)
        };

        let verdict = Arc::new(tree.resolve(metric));

        let mut state = self.state.write().expect("policy state lock poisoned");
        // don't populate the cache with a verdict from a tree that got
        // swapped out while we were resolving
        if Arc::ptr_eq(&state.tree, &tree) {
            state
                .cache
                .insert(metric.to_string(), Arc::clone(&verdict));
        }
        verdict
    }

    /// Atomically adopts `tree` and empties the verdict cache.
    pub fn reset(&self, tree: PolicyTree) {
        let mut state = self.state.write().expect("policy state lock poisoned");
        state.tree = Arc::new(tree);
        state.cache = HashMap::new();
    }

    #[cfg(test)]
    fn cached(&self, metric: &str) -> Option<Arc<ResolvedVerdict>> {
        self.state
            .read()
            .expect("policy state lock poisoned")
            .cache
            .get(metric)
            .cloned()
    }
}
