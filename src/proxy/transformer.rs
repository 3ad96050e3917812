use std::io::{Read, Write};
use std::sync::Arc;

use axum::http::{header::CONTENT_ENCODING, request::Parts, HeaderMap, Method};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::policy::PolicyEngine;
use crate::tags::HostTagSource;
use crate::SERIES_PATH;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rewrites a request body in flight, before it gets forwarded upstream.
pub trait RequestTransformer: Send + Sync {
    fn transform(&self, parts: &Parts, body: Bytes) -> Result<Bytes, TransformError>;
}

/// Prunes series-submission payloads according to the resolved verdicts:
/// drops metrics, strips tags and the host field, and substitutes cached
/// host tags where a verdict asks for them.
///
/// Requests other than POSTs to the series endpoint pass through untouched.
pub struct SeriesTransformer {
    engine: Arc<PolicyEngine>,
    host_tags: Option<Arc<dyn HostTagSource>>,
}

enum TagsField {
    Absent,
    Null,
    Values(Vec<Value>),
}

impl SeriesTransformer {
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>, host_tags: Option<Arc<dyn HostTagSource>>) -> Self {
        SeriesTransformer { engine, host_tags }
    }

    fn transform_series_request(
        &self,
        parts: &Parts,
        body: &Bytes,
    ) -> Result<Bytes, TransformError> {
        let encoded = is_encoded_request(&parts.headers);
        let decoded = if encoded {
            let mut decoded = Vec::new();
            ZlibDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;
            decoded
        } else {
            body.to_vec()
        };

        debug!(
            "Received a {} request for {} with body {}",
            parts.method,
            parts.uri.path(),
            String::from_utf8_lossy(&decoded)
        );

        let mut document: Map<String, Value> = serde_json::from_slice(&decoded)?;
        if !self.transform_series_document(&mut document) {
            return Ok(body.clone());
        }

        let new_body = serde_json::to_vec(&document)?;
        let new_body = if encoded {
            encode_body(&new_body)?
        } else {
            new_body
        };

        Ok(Bytes::from(new_body))
    }

    /// Returns false when the document doesn't have the expected shape, in
    /// which case it is left exactly as it was.
    fn transform_series_document(&self, document: &mut Map<String, Value>) -> bool {
        let series = match document.get_mut("series") {
            Some(Value::Array(series)) => std::mem::take(series),
            Some(_) => {
                warn!("'series' is not an array in a series document");
                return false;
            }
            None => {
                warn!("Missing the 'series' field in a series document");
                return false;
            }
        };

        let mut new_series = Vec::with_capacity(series.len());
        for raw_metric in series {
            if let Some(metric) = self.transform_metric(raw_metric) {
                new_series.push(metric);
            }
        }
        document.insert("series".to_string(), Value::Array(new_series));

        true
    }

    fn transform_metric(&self, raw_metric: Value) -> Option<Value> {
        let Value::Object(mut metric) = raw_metric else {
            warn!("Unexpected metric in a series document (not an object): {raw_metric}");
            return None;
        };

        let verdict = match metric.get("metric").and_then(Value::as_str) {
            Some(name) => self.engine.resolve(name),
            None => {
                warn!(
                    "Unexpected metric in a series document (name): {}",
                    serde_json::Value::Object(metric)
                );
                return None;
            }
        };

        if verdict.remove {
            return None;
        }

        // the agent does sometimes send a `null` value for tags; those pass
        // through as is, anything else non-array means a broken metric
        let tags_field = match metric.remove("tags") {
            None => TagsField::Absent,
            Some(Value::Null) => TagsField::Null,
            Some(Value::Array(tags)) => TagsField::Values(tags),
            Some(other) => {
                warn!(
                    "Unexpected metric in a series document (tags): {other} in {}",
                    serde_json::Value::Object(metric)
                );
                return None;
            }
        };

        if verdict.remove_host {
            metric.remove("host");
        }

        let mut new_tags = Vec::new();
        if let TagsField::Values(tags) = &tags_field {
            for raw_tag in tags {
                let Some(tag) = raw_tag.as_str().filter(|tag| !tag.is_empty()) else {
                    warn!("Unexpected tag in a series document: {raw_tag}");
                    continue;
                };

                let key = tag.split_once(':').map_or(tag, |(key, _)| key);
                if !verdict.remove_tags.contains(key) {
                    new_tags.push(tag.to_string());
                }
            }
        }

        if verdict.keep_host_tags {
            if let Some(host_tags) = &self.host_tags {
                for (key, values) in host_tags.snapshot().iter() {
                    if !verdict.remove_tags.contains(key) {
                        new_tags.extend(values.iter().cloned());
                    }
                }
            }
        }

        if new_tags.is_empty() {
            if let TagsField::Null = tags_field {
                metric.insert("tags".to_string(), Value::Null);
            }
        } else {
            metric.insert(
                "tags".to_string(),
                Value::Array(new_tags.into_iter().map(Value::String).collect()),
            );
        }

        Some(Value::Object(metric))
    }
}

impl RequestTransformer for SeriesTransformer {
    fn transform(&self, parts: &Parts, body: Bytes) -> Result<Bytes, TransformError> {
        if parts.method == Method::POST && parts.uri.path() == SERIES_PATH {
            return self.transform_series_request(parts, &body);
        }

        Ok(body)
    }
}

fn is_encoded_request(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .is_some_and(|value| value.as_bytes() == b"deflate")
}

fn encode_body(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}
