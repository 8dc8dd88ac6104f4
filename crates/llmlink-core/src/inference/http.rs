//! HTTP adapter for Ollama-compatible inference servers.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llmlink_config::InferenceConfig;

use super::{AdapterError, AdapterStatus, InferenceAdapter, RelayChunk};
use crate::BoxFuture;
use crate::codec::{RelayRequest, RelayResponse};

/// Request headers never forwarded to the local server.
const SKIPPED_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "authorization",
    "transfer-encoding",
];

const NDJSON: &str = "application/x-ndjson";

/// Relays requests to `base_url` over HTTP.
pub struct HttpInferenceAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AdapterError> {
        url::Url::parse(base_url)
            .map_err(|e| AdapterError::InvalidRequest(format!("bad base URL {base_url:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::build_info::user_agent())
            .build()
            .map_err(|e| AdapterError::Connect {
                url: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self, AdapterError> {
        Self::new(&config.base_url, config.timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> AdapterError {
        if e.is_timeout() {
            AdapterError::Timeout
        } else if e.is_connect() {
            AdapterError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            }
        } else {
            AdapterError::Stream(e.to_string())
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, AdapterError> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::Parse(format!("{path}: {e}")))
    }
}

impl InferenceAdapter for HttpInferenceAdapter {
    fn name(&self) -> &str {
        "http"
    }

    fn relay(
        &self,
        request: RelayRequest,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Result<RelayChunk, AdapterError>>, AdapterError>>
    {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| AdapterError::InvalidRequest(e.to_string()))?;
            let url = self.url(&request.path);
            debug!(%method, %url, "Relaying request to inference server");

            let mut builder = self.client.request(method, &url);
            for (name, value) in &request.headers {
                if SKIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| self.map_send_error(&url, e))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let headers = response_headers(&resp);
            let streaming = wants_stream(&request)
                || resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| ct.starts_with(NDJSON));

            let (tx, rx) = mpsc::channel(64);
            let status = status.as_u16();
            if streaming {
                tokio::spawn(forward_ndjson(resp, status, headers, tx));
            } else {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| AdapterError::Stream(e.to_string()))?;
                let response = RelayResponse {
                    status,
                    headers,
                    body: parse_body(&bytes),
                    done: true,
                };
                let _ = tx.send(Ok(RelayChunk::Complete(response))).await;
            }
            Ok(rx)
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<AdapterStatus, AdapterError>> {
        Box::pin(async move {
            let version: VersionResponse = self.get_json("/api/version").await?;
            let tags: TagsResponse = self.get_json("/api/tags").await?;
            Ok(AdapterStatus {
                version: version.version,
                models: tags.models.into_iter().map(|m| m.name).collect(),
            })
        })
    }
}

/// Split an NDJSON body into partial chunks, then send the final response.
async fn forward_ndjson(
    resp: reqwest::Response,
    status: u16,
    headers: BTreeMap<String, String>,
    tx: mpsc::Sender<Result<RelayChunk, AdapterError>>,
) {
    let mut stream = resp.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(AdapterError::Stream(e.to_string()))).await;
                return;
            }
        };
        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if !send_line(&tx, &line).await {
                return;
            }
        }
    }
    if !buffer.is_empty() && !send_line(&tx, &buffer).await {
        return;
    }

    let response = RelayResponse {
        status,
        headers,
        body: None,
        done: true,
    };
    let _ = tx.send(Ok(RelayChunk::Complete(response))).await;
}

/// Returns `false` when forwarding should stop.
async fn send_line(tx: &mpsc::Sender<Result<RelayChunk, AdapterError>>, line: &[u8]) -> bool {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return true;
    }
    match serde_json::from_slice::<Value>(trimmed) {
        Ok(value) => tx.send(Ok(RelayChunk::Partial(value))).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Inference server sent a non-JSON stream line");
            let _ = tx
                .send(Err(AdapterError::Parse(format!("stream line: {e}"))))
                .await;
            false
        }
    }
}

/// `"stream": true` in the request body.
fn wants_stream(request: &RelayRequest) -> bool {
    request
        .body
        .as_ref()
        .and_then(|body| body.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn response_headers(resp: &reqwest::Response) -> BTreeMap<String, String> {
    resp.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// JSON bodies stay structured; anything else is passed through as a string.
fn parse_body(bytes: &[u8]) -> Option<Value> {
    if bytes.trim_ascii().is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    )
}

// ── Ollama API types (private) ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_url_joins_without_double_slash() {
        let adapter =
            HttpInferenceAdapter::new("http://localhost:11434/", Duration::from_secs(5)).unwrap();
        assert_eq!(adapter.base_url(), "http://localhost:11434");
        assert_eq!(
            adapter.url("/api/generate"),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpInferenceAdapter::new("not a url", Duration::from_secs(5)),
            Err(AdapterError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b""), None);
        assert_eq!(parse_body(b"  \n"), None);
        assert_eq!(parse_body(br#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(parse_body(b"plain"), Some(json!("plain")));
    }

    #[test]
    fn test_wants_stream() {
        assert!(wants_stream(&RelayRequest::post(
            "/api/chat",
            json!({"model": "llama3", "stream": true})
        )));
        assert!(!wants_stream(&RelayRequest::post(
            "/api/chat",
            json!({"model": "llama3", "stream": false})
        )));
        assert!(!wants_stream(&RelayRequest::post("/api/tags", json!({}))));
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_connect_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let adapter =
            HttpInferenceAdapter::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2))
                .unwrap();
        let err = adapter
            .relay(RelayRequest::post("/api/generate", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let adapter =
            HttpInferenceAdapter::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let mut request = RelayRequest::post("/api/generate", json!({}));
        request.method = "BAD METHOD".to_string();
        assert!(matches!(
            adapter.relay(request).await,
            Err(AdapterError::InvalidRequest(_))
        ));
    }
}
