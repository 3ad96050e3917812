use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::http_client;
use crate::tags::{HostTagSnapshot, HostTagSource};

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
enum RefreshError {
    #[error("unable to determine the local hostname")]
    Hostname,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("status code: {0}")]
    Status(u16),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
}

/// Periodically refreshed cache of the host's own tags, added back to
/// metrics whose verdict strips the host field.
///
/// The snapshot is replaced wholesale on every successful refresh; readers
/// keep whichever snapshot was current when they asked.
pub struct HostTagCache {
    snapshot: Arc<RwLock<Arc<HostTagSnapshot>>>,
    shutdown: CancellationToken,
}

impl HostTagCache {
    /// Fetches the tags once, synchronously, then spawns the background
    /// refresher. An initial fetch failure publishes an empty snapshot.
    pub async fn start(
        dd_url: &str,
        api_key: &str,
        application_key: &str,
        interval: Duration,
    ) -> Self {
        let client = http_client::tags_client(interval.min(HTTP_TIMEOUT));

        let initial = match fetch_host_tags(&client, dd_url, api_key, application_key).await {
            Ok(tags) => tags,
            Err(err) => {
                error!("Unable to retrieve host tags, will be unable to add host tags: {err}");
                HostTagSnapshot::new()
            }
        };
        let snapshot = Arc::new(RwLock::new(Arc::new(initial)));
        let shutdown = CancellationToken::new();

        let state = Arc::clone(&snapshot);
        let token = shutdown.clone();
        let dd_url = dd_url.to_string();
        let api_key = api_key.to_string();
        let application_key = application_key.to_string();
        tokio::spawn(async move {
            loop {
                // each refresh arms the next; durations never accumulate
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                match fetch_host_tags(&client, &dd_url, &api_key, &application_key).await {
                    Ok(new_tags) => {
                        // a refresh that raced with a stop gets discarded
                        if token.is_cancelled() {
                            break;
                        }
                        *state.write().expect("host tags lock poisoned") = Arc::new(new_tags);
                    }
                    Err(err) => {
                        error!(
                            "Unable to retrieve host tags, keeping the previous ones: {err}"
                        );
                    }
                }
            }
        });

        HostTagCache { snapshot, shutdown }
    }

    /// Halts future refreshes. Idempotent; an in-flight refresh completes
    /// and its result is thrown away.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl HostTagSource for HostTagCache {
    fn snapshot(&self) -> Arc<HostTagSnapshot> {
        Arc::clone(&self.snapshot.read().expect("host tags lock poisoned"))
    }
}

// see https://docs.datadoghq.com/api/?lang=console#tags-get-host
async fn fetch_host_tags(
    client: &reqwest::Client,
    dd_url: &str,
    api_key: &str,
    application_key: &str,
) -> Result<HostTagSnapshot, RefreshError> {
    let hostname = detect_hostname().await.ok_or(RefreshError::Hostname)?;
    let url = format!(
        "{dd_url}/api/v1/tags/hosts/{hostname}?api_key={api_key}&application_key={application_key}"
    );

    let response = client.get(&url).send().await?;
    let status = response.status();
    if status.as_u16() >= 300 {
        return Err(RefreshError::Status(status.as_u16()));
    }

    let document: Value = serde_json::from_slice(&response.bytes().await?)?;
    parse_host_tags_response(&document)
}

fn parse_host_tags_response(document: &Value) -> Result<HostTagSnapshot, RefreshError> {
    let Some(raw_tags) = document.get("tags") else {
        return Err(RefreshError::MalformedResponse("missing the 'tags' field"));
    };
    let Some(raw_tags) = raw_tags.as_array() else {
        return Err(RefreshError::MalformedResponse("'tags' is not an array"));
    };

    let mut tags_map = HostTagSnapshot::new();
    for raw_tag in raw_tags {
        let Some(tag) = raw_tag.as_str().filter(|tag| !tag.is_empty()) else {
            warn!("Unexpected tag in the response from host tags: {raw_tag}");
            continue;
        };

        let key = tag.split_once(':').map_or(tag, |(key, _)| key);
        tags_map
            .entry(key.to_string())
            .or_insert_with(Vec::new)
            .push(tag.to_string());
    }

    Ok(tags_map)
}

async fn detect_hostname() -> Option<String> {
    let output = Command::new("hostname")
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())?;

    let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}
