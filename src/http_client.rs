use std::time::Duration;

use tracing::error;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Pooled client used to forward requests upstream.
///
/// Keep-alive is off; every forwarded request dials a fresh connection,
/// bounded by the connect and global timeouts.
#[must_use]
pub fn upstream_client() -> reqwest::Client {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build();

    client.unwrap_or_else(|e| {
        error!("Unable to build the upstream client: {e}, using the default one");
        reqwest::Client::new()
    })
}

/// Client used by the host-tag refresher; the whole round-trip is bounded
/// by `timeout`.
#[must_use]
pub fn tags_client(timeout: Duration) -> reqwest::Client {
    let client = reqwest::Client::builder().timeout(timeout).build();

    client.unwrap_or_else(|e| {
        error!("Unable to build the host tags client: {e}, using the default one");
        reqwest::Client::new()
    })
}
