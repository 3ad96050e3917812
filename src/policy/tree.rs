use std::collections::{HashMap, HashSet};

/// One segment pattern matching exactly one metric-name segment.
pub const SINGLE_WILDCARD: &str = "*";
/// One segment pattern swallowing one or more metric-name segments.
pub const DOUBLE_WILDCARD: &str = "**";

const HOST_TAG: &str = "host";

/// The rules attached to one path pattern, before resolution.
///
/// Values merge by boolean OR on flags and set-union on the tag sets, so the
/// order in which rule fragments get inserted never matters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeValue {
    pub remove: bool,
    pub keep: bool,
    pub keep_host: bool,
    pub remove_tags: HashSet<String>,
    pub keep_tags: HashSet<String>,
}

impl NodeValue {
    pub fn removal() -> Self {
        NodeValue {
            remove: true,
            ..NodeValue::default()
        }
    }

    pub fn retention() -> Self {
        NodeValue {
            keep: true,
            ..NodeValue::default()
        }
    }

    pub fn host_retention() -> Self {
        NodeValue {
            keep_host: true,
            ..NodeValue::default()
        }
    }

    pub fn tag_removal(tags: impl IntoIterator<Item = String>) -> Self {
        NodeValue {
            remove_tags: tags.into_iter().collect(),
            ..NodeValue::default()
        }
    }

    pub fn tag_retention(tags: impl IntoIterator<Item = String>) -> Self {
        NodeValue {
            keep_tags: tags.into_iter().collect(),
            ..NodeValue::default()
        }
    }

    fn merge(&mut self, other: &NodeValue) {
        self.remove = self.remove || other.remove;
        self.keep = self.keep || other.keep;
        self.keep_host = self.keep_host || other.keep_host;
        self.remove_tags.extend(other.remove_tags.iter().cloned());
        self.keep_tags.extend(other.keep_tags.iter().cloned());
    }

    fn into_verdict(self) -> ResolvedVerdict {
        if self.remove && !self.keep {
            return ResolvedVerdict {
                remove: true,
                ..ResolvedVerdict::default()
            };
        }

        let remove_tags: HashSet<String> = self
            .remove_tags
            .into_iter()
            .filter(|tag| !self.keep_tags.contains(tag))
            .collect();
        let remove_host = remove_tags.contains(HOST_TAG);

        ResolvedVerdict {
            remove: false,
            remove_host,
            keep_host_tags: remove_host && self.keep_host,
            remove_tags,
        }
    }
}

/// The merged effect of every rule fragment matching one concrete metric name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedVerdict {
    /// Drop the metric entirely.
    pub remove: bool,
    /// Tag keys to strip from the metric.
    pub remove_tags: HashSet<String>,
    /// Strip the `host` field.
    pub remove_host: bool,
    /// After stripping the host, substitute the cached host-level tags.
    pub keep_host_tags: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PolicyNode {
    children: HashMap<String, PolicyNode>,
    value: Option<NodeValue>,
}

/// Trie of pruning rules keyed by dotted path patterns.
///
/// Append-only while a load builds it up; once published to a
/// [`PolicyEngine`](super::PolicyEngine) the only mutation is a wholesale
/// swap for a freshly built tree.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PolicyTree {
    root: PolicyNode,
}

impl PolicyTree {
    #[must_use]
    pub fn new() -> Self {
        PolicyTree::default()
    }

    /// Inserts one rule fragment at `pattern`, creating nodes as needed and
    /// merging into any value already present at the leaf.
    pub fn insert(&mut self, pattern: &str, value: &NodeValue) {
        let mut node = &mut self.root;
        for segment in pattern.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.value.get_or_insert_with(NodeValue::default).merge(value);
    }

    /// Resolves the merged verdict for a concrete metric name.
    ///
    /// Every matching branch contributes; the merge is order-independent.
    #[must_use]
    pub fn resolve(&self, metric: &str) -> ResolvedVerdict {
        let segments: Vec<&str> = metric.split('.').collect();
        let mut accumulator = NodeValue::default();
        resolve_into(&segments, 0, &self.root, &mut accumulator, false);
        accumulator.into_verdict()
    }
}

fn resolve_into(
    path: &[&str],
    index: usize,
    node: &PolicyNode,
    accumulator: &mut NodeValue,
    ongoing_double_wildcard: bool,
) {
    if index >= path.len() {
        if let Some(value) = &node.value {
            accumulator.merge(value);
        }
        return;
    }

    // double wildcards
    if let Some(child) = node.children.get(DOUBLE_WILDCARD) {
        resolve_into(path, index + 1, child, accumulator, true);
    }
    if ongoing_double_wildcard {
        resolve_into(path, index + 1, node, accumulator, true);
    }

    // then, single wildcard
    if let Some(child) = node.children.get(SINGLE_WILDCARD) {
        resolve_into(path, index + 1, child, accumulator, false);
    }

    // then exact match
    if let Some(child) = node.children.get(path[index]) {
        resolve_into(path, index + 1, child, accumulator, false);
    }
}
