//! Host-level tags, fetched periodically from the upstream tag API.

pub mod host;

use std::collections::HashMap;
use std::sync::Arc;

/// Host tags grouped by key prefix; one key may carry several
/// fully-qualified `key:value` strings.
pub type HostTagSnapshot = HashMap<String, Vec<String>>;

/// Read-only view over the current host tags.
///
/// Implementations must return an already-published snapshot without doing
/// any I/O; the series transformer calls this on the request path.
pub trait HostTagSource: Send + Sync {
    fn snapshot(&self) -> Arc<HostTagSnapshot>;
}
