//! The reverse proxy itself: accepts agent traffic, runs the configured
//! transformer over it, and forwards the result upstream.

pub mod transformer;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::http_client;
use crate::proxy::transformer::RequestTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy already started")]
    AlreadyStarted,
    #[error("proxy not running")]
    NotRunning,
    #[error("unable to bind the listener: {0}")]
    Bind(#[from] std::io::Error),
}

struct ProxyState {
    target: String,
    transformer: Option<Arc<dyn RequestTransformer>>,
    client: reqwest::Client,
}

/// Listens on a local port and forwards every request to the configured
/// target, running the transformer over request bodies first.
///
/// The target includes the protocol, e.g. `https://app.datadoghq.com`.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    handle: Option<JoinHandle<()>>,
}

impl ProxyServer {
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        transformer: Option<Arc<dyn RequestTransformer>>,
    ) -> Self {
        ProxyServer {
            state: Arc::new(ProxyState {
                target: target.into(),
                transformer,
                client: http_client::upstream_client(),
            }),
            lifecycle: Lifecycle::Idle,
            shutdown: CancellationToken::new(),
            local_addr: None,
            handle: None,
        }
    }

    /// Binds the listener and starts serving in the background.
    pub async fn start(&mut self, port: u16) -> Result<(), ProxyError> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(ProxyError::AlreadyStarted);
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);

        let router = Router::new()
            .fallback(forward)
            .with_state(Arc::clone(&self.state));
        let token = self.shutdown.clone();

        info!("HttpProxy listening on {addr}");
        self.handle = Some(tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                error!("HttpProxy crashed: {err}");
            }
        }));
        self.lifecycle = Lifecycle::Running;

        Ok(())
    }

    /// Initiates a graceful shutdown and waits for in-flight requests.
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(ProxyError::NotRunning);
        }
        self.lifecycle = Lifecycle::Stopping;

        info!("HttpProxy shutting down...");
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!("HttpProxy shutdown error: {err}");
            }
        }
        self.lifecycle = Lifecycle::Stopped;
        info!("HttpProxy gracefully shut down");

        Ok(())
    }

    /// The address the listener ended up bound to, once running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    debug!(
        "Received {} request for {} with headers {:?}",
        request.method(),
        request.uri(),
        request.headers()
    );

    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => return internal_error("Could not read body", &parts, err),
    };

    // transform the request
    let body_bytes = if let Some(transformer) = &state.transformer {
        match transformer.transform(&parts, body_bytes) {
            Ok(bytes) => bytes,
            Err(err) => return internal_error("Could not transform body", &parts, err),
        }
    } else {
        body_bytes
    };

    // prepare the request; the query string survives verbatim, including a
    // bare trailing `?`
    let mut url = format!("{}{}", state.target, parts.uri.path());
    let query = parts.uri.query();
    let force_query = parts
        .uri
        .path_and_query()
        .is_some_and(|pq| pq.as_str().ends_with('?'));
    if query.is_some() || force_query {
        url.push('?');
        url.push_str(query.unwrap_or_default());
    }

    let mut headers = parts.headers.clone();
    // the client derives these from the new body and target
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    // make the request downstream
    let upstream_response = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await;
    let upstream_response = match upstream_response {
        Ok(response) => response,
        Err(err) => {
            return internal_error("Unable to make HTTP request downstream", &parts, err);
        }
    };

    // copy the response headers and status, then stream the body
    let mut response = Response::builder().status(upstream_response.status());
    if let Some(response_headers) = response.headers_mut() {
        *response_headers = upstream_response.headers().clone();
        // the body below is re-framed by the server
        response_headers.remove(header::TRANSFER_ENCODING);
    }

    match response.body(Body::from_stream(upstream_response.bytes_stream())) {
        Ok(response) => response,
        Err(err) => internal_error("Unable to copy response", &parts, err),
    }
}

fn internal_error(log_prefix: &str, parts: &Parts, err: impl fmt::Display) -> Response {
    error!("{log_prefix} on path {}: {err}", parts.uri.path());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Internal k9 error: {err}"),
    )
        .into_response()
}
