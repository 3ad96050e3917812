use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::policy::tree::{NodeValue, PolicyTree};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyFileContent {
    metrics: MetricsSection,
    tags: TagsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsSection {
    remove: Vec<String>,
    keep: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagsSection {
    remove: Vec<MetricsAndTags>,
    keep: Vec<MetricsAndTags>,
    keep_host: Vec<MetricsSelector>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsAndTags {
    metrics: Vec<String>,
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsSelector {
    metrics: Vec<String>,
}

/// Parses one policy file and merges its rule fragments into `tree`.
///
/// Only ever called on a builder tree; published trees are immutable.
pub fn merge_file(tree: &mut PolicyTree, path: &Path) -> Result<(), LoadError> {
    let raw_content = fs::read_to_string(path)?;
    let content: PolicyFileContent = serde_yaml::from_str(&raw_content)?;
    merge_content(tree, &content);
    Ok(())
}

fn merge_content(tree: &mut PolicyTree, content: &PolicyFileContent) {
    for metric in &content.metrics.remove {
        tree.insert(metric, &NodeValue::removal());
    }
    for metric in &content.metrics.keep {
        tree.insert(metric, &NodeValue::retention());
    }

    for rule in &content.tags.remove {
        let value = NodeValue::tag_removal(rule.tags.iter().cloned());
        for metric in &rule.metrics {
            tree.insert(metric, &value);
        }
    }
    for rule in &content.tags.keep {
        let value = NodeValue::tag_retention(rule.tags.iter().cloned());
        for metric in &rule.metrics {
            tree.insert(metric, &value);
        }
    }
    for rule in &content.tags.keep_host {
        for metric in &rule.metrics {
            tree.insert(metric, &NodeValue::host_retention());
        }
    }
}

/// Merges the file at `filename_or_glob` into `tree`; when the path doesn't
/// exist, retries it as a glob pattern and merges every match.
///
/// Load failures are logged as warnings. Returns how many files merged
/// successfully so callers can tell a fruitless load from a fruitful one.
pub fn merge_file_or_glob(tree: &mut PolicyTree, filename_or_glob: &str) -> usize {
    let err = match merge_file(tree, Path::new(filename_or_glob)) {
        Ok(()) => return 1,
        Err(err) => err,
    };

    // maybe it's a glob?
    if matches!(&err, LoadError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound) {
        if let Ok(matches) = glob::glob(filename_or_glob) {
            let paths: Vec<_> = matches.filter_map(Result::ok).collect();
            if !paths.is_empty() {
                let mut loaded = 0;
                for path in paths {
                    match merge_file(tree, &path) {
                        Ok(()) => loaded += 1,
                        Err(err) => {
                            warn!(
                                "Unable to load pruning config from {}: {err}",
                                path.display()
                            );
                        }
                    }
                }
                return loaded;
            }
        }
    }

    warn!("Unable to load pruning config from {filename_or_glob}: {err}");
    0
}

/// Builds a fresh tree from every configured path or glob pattern.
///
/// Returns the tree together with the number of files that merged
/// successfully; zero means the caller should hold on to whatever tree it
/// already has (or give up, at startup).
pub fn build_tree(patterns: &[String]) -> (PolicyTree, usize) {
    let mut tree = PolicyTree::new();
    let mut loaded = 0;
    for pattern in patterns {
        loaded += merge_file_or_glob(&mut tree, pattern);
    }
    (tree, loaded)
}
