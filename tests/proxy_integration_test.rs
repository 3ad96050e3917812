use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use k9::policy::{loader, PolicyEngine, PolicyTree};
use k9::proxy::transformer::SeriesTransformer;
use k9::proxy::ProxyServer;

#[derive(Debug)]
struct RecordedRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

type Recordings = Arc<Mutex<Vec<RecordedRequest>>>;

async fn record(State(recordings): State<Recordings>, request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("failed to read upstream body");
    recordings
        .lock()
        .expect("recordings lock poisoned")
        .push(RecordedRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(ToString::to_string),
            headers: parts.headers,
            body,
        });

    (
        StatusCode::ACCEPTED,
        [("x-upstream", "yes")],
        "upstream says hi",
    )
}

async fn spawn_upstream() -> (String, Recordings) {
    let recordings = Recordings::default();
    let app = Router::new()
        .fallback(record)
        .with_state(Arc::clone(&recordings));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind upstream");
    let addr = listener.local_addr().expect("no upstream address");
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("upstream server failed");
    });

    (format!("http://{addr}"), recordings)
}

fn policy_tree(policy: &str) -> PolicyTree {
    let file = tempfile::NamedTempFile::new().expect("failed to create policy file");
    std::fs::write(file.path(), policy).expect("failed to write policy file");

    let mut tree = PolicyTree::new();
    loader::merge_file(&mut tree, file.path()).expect("failed to load policy file");
    tree
}

async fn start_proxy(policy: &str, upstream: &str) -> (ProxyServer, String) {
    let engine = Arc::new(PolicyEngine::new(policy_tree(policy)));
    let transformer = SeriesTransformer::new(engine, None);

    let mut proxy = ProxyServer::new(upstream, Some(Arc::new(transformer)));
    proxy.start(0).await.expect("failed to start the proxy");
    let addr = proxy.local_addr().expect("no proxy address");

    (proxy, format!("http://127.0.0.1:{}", addr.port()))
}

fn compress(body: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).expect("failed to compress");
    encoder.finish().expect("failed to compress")
}

fn decompress(body: &[u8]) -> Vec<u8> {
    let mut decompressed = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut decompressed)
        .expect("failed to decompress");
    decompressed
}

const REMOVE_TIME_MAX_POLICY: &str = r#"
metrics:
  remove: [ "app.es.time.max" ]
"#;

fn scenario_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "series": [
            { "metric": "app.es.time.max", "tags": [ "role:x" ] },
            { "metric": "app.es.time.min", "tags": [ "role:x" ] },
        ]
    }))
    .expect("failed to serialize")
}

fn scenario_expected() -> Value {
    json!({
        "series": [ { "metric": "app.es.time.min", "tags": [ "role:x" ] } ]
    })
}

#[tokio::test]
async fn test_series_requests_are_pruned_end_to_end() {
    let (upstream, recordings) = spawn_upstream().await;
    let (mut proxy, proxy_url) = start_proxy(REMOVE_TIME_MAX_POLICY, &upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy_url}/api/v1/series/?api_key=secret"))
        .body(scenario_body())
        .send()
        .await
        .expect("request failed");

    // the upstream response comes back through, headers included
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get("x-upstream")
            .map(|value| value.as_bytes()),
        Some(&b"yes"[..])
    );
    assert_eq!(
        response.text().await.expect("failed to read response"),
        "upstream says hi"
    );

    let recordings = recordings.lock().expect("recordings lock poisoned");
    assert_eq!(recordings.len(), 1);
    let recorded = &recordings[0];
    assert_eq!(recorded.method, Method::POST);
    assert_eq!(recorded.path, "/api/v1/series/");
    assert_eq!(recorded.query.as_deref(), Some("api_key=secret"));
    let forwarded: Value =
        serde_json::from_slice(&recorded.body).expect("forwarded body should be JSON");
    assert_eq!(forwarded, scenario_expected());
    drop(recordings);

    proxy.stop().await.expect("failed to stop the proxy");
}

#[tokio::test]
async fn test_deflate_bodies_round_trip() {
    let (upstream, recordings) = spawn_upstream().await;
    let (mut proxy, proxy_url) = start_proxy(REMOVE_TIME_MAX_POLICY, &upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy_url}/api/v1/series/"))
        .header("Content-Encoding", "deflate")
        .body(compress(&scenario_body()))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let recordings = recordings.lock().expect("recordings lock poisoned");
    assert_eq!(recordings.len(), 1);
    let recorded = &recordings[0];
    assert_eq!(
        recorded
            .headers
            .get("content-encoding")
            .map(|value| value.as_bytes()),
        Some(&b"deflate"[..])
    );
    let forwarded: Value = serde_json::from_slice(&decompress(&recorded.body))
        .expect("forwarded body should be zlib-compressed JSON");
    assert_eq!(forwarded, scenario_expected());
    drop(recordings);

    proxy.stop().await.expect("failed to stop the proxy");
}

#[tokio::test]
async fn test_other_requests_pass_through_untouched() {
    let (upstream, recordings) = spawn_upstream().await;
    let (mut proxy, proxy_url) = start_proxy(REMOVE_TIME_MAX_POLICY, &upstream).await;

    let response = reqwest::Client::new()
        .get(format!("{proxy_url}/api/v0/series/"))
        .header("x-custom", "kept")
        .body("hey")
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let recordings = recordings.lock().expect("recordings lock poisoned");
    assert_eq!(recordings.len(), 1);
    let recorded = &recordings[0];
    assert_eq!(recorded.method, Method::GET);
    assert_eq!(recorded.path, "/api/v0/series/");
    assert_eq!(recorded.query, None);
    assert_eq!(recorded.body, Bytes::from_static(b"hey"));
    assert_eq!(
        recorded
            .headers
            .get("x-custom")
            .map(|value| value.as_bytes()),
        Some(&b"kept"[..])
    );
    drop(recordings);

    proxy.stop().await.expect("failed to stop the proxy");
}

#[tokio::test]
async fn test_unparseable_series_bodies_yield_a_500() {
    let (upstream, recordings) = spawn_upstream().await;
    let (mut proxy, proxy_url) = start_proxy(REMOVE_TIME_MAX_POLICY, &upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy_url}/api/v1/series/"))
        .body("hey you")
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.expect("failed to read response");
    assert!(
        body.starts_with("Internal k9 error: "),
        "unexpected error body: {body}"
    );

    // nothing made it upstream
    assert!(recordings
        .lock()
        .expect("recordings lock poisoned")
        .is_empty());

    proxy.stop().await.expect("failed to stop the proxy");
}

#[tokio::test]
async fn test_unreachable_upstreams_yield_a_500() {
    // nothing listens on this target
    let (mut proxy, proxy_url) = start_proxy(REMOVE_TIME_MAX_POLICY, "http://127.0.0.1:1").await;

    let response = reqwest::Client::new()
        .get(format!("{proxy_url}/status"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.expect("failed to read response");
    assert!(
        body.starts_with("Internal k9 error: "),
        "unexpected error body: {body}"
    );

    proxy.stop().await.expect("failed to stop the proxy");
}
