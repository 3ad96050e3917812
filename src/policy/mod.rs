//! Pruning policy resolution.
//!
//! Policy files contribute rule fragments keyed by dotted path patterns
//! (`*` matches one segment, `**` swallows several). [`loader`] merges
//! files and globs into a [`PolicyTree`]; the [`PolicyEngine`] resolves
//! concrete metric names against the published tree and caches the
//! verdicts until the next reload.

pub mod engine;
pub mod loader;
pub mod tree;

pub use engine::PolicyEngine;
pub use tree::{NodeValue, PolicyTree, ResolvedVerdict};
