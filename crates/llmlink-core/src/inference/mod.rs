//! Local inference adapter — the HTTP service relayed requests end up at.
//!
//! The tunnel only talks to the [`InferenceAdapter`] trait. The production
//! implementation is [`HttpInferenceAdapter`], which speaks to an
//! Ollama-compatible server over HTTP.

pub mod http;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::BoxFuture;
use crate::codec::{RelayRequest, RelayResponse};

pub use http::HttpInferenceAdapter;

/// Errors from the local inference server. None of these affect the tunnel
/// connection; they end the one request they belong to.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("cannot reach inference server at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("inference server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference request timed out")]
    Timeout,

    #[error("inference stream failed: {0}")]
    Stream(String),

    #[error("invalid inference response: {0}")]
    Parse(String),

    #[error("invalid relay request: {0}")]
    InvalidRequest(String),

    #[error("inference stream ended without a final response")]
    Incomplete,
}

/// One item produced while relaying a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayChunk {
    /// A streamed fragment (one NDJSON line from the server).
    Partial(serde_json::Value),
    /// The final result; nothing follows it.
    Complete(RelayResponse),
}

/// What [`InferenceAdapter::probe`] reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub version: String,
    pub models: Vec<String>,
}

/// Backend that executes relayed requests.
///
/// Uses `BoxFuture` so the tunnel can hold an `Arc<dyn InferenceAdapter>`.
pub trait InferenceAdapter: Send + Sync {
    /// Display name for logs.
    fn name(&self) -> &str;

    /// Execute a request. The receiver yields zero or more
    /// [`RelayChunk::Partial`] items followed by one
    /// [`RelayChunk::Complete`], or an error.
    fn relay(
        &self,
        request: RelayRequest,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Result<RelayChunk, AdapterError>>, AdapterError>>;

    /// Check that the server is up and list its models.
    fn probe(&self) -> BoxFuture<'_, Result<AdapterStatus, AdapterError>>;
}
