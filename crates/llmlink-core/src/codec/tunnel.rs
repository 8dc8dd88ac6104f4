//! Tunnel wire messages exchanged with the cloud relay.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CodecError, MAX_TUNNEL_FRAME_BYTES, check_size, object_or_none};

/// Discriminator of a [`TunnelMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Auth,
    Request,
    Response,
    Ping,
    Pong,
    Error,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Request => "request",
            Self::Response => "response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "error" => Ok(Self::Error),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }
}

/// One message on the tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelMessage {
    pub kind: TunnelKind,
    /// Correlates a `request` with its `response`/`error`, and a `ping` with its `pong`.
    pub id: String,
    pub data: Option<Map<String, Value>>,
    /// Creation time on the sender's clock.
    pub timestamp: DateTime<Utc>,
}

impl TunnelMessage {
    pub fn new(kind: TunnelKind, id: impl Into<String>, data: Option<Map<String, Value>>) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// First message after the upgrade, carrying the bearer token.
    pub fn auth(id: impl Into<String>, token: &str) -> Self {
        let mut data = Map::new();
        data.insert("token".to_string(), Value::from(token));
        data.insert(
            "client".to_string(),
            Value::from(crate::build_info::CLIENT_NAME),
        );
        data.insert(
            "version".to_string(),
            Value::from(crate::build_info::VERSION),
        );
        Self::new(TunnelKind::Auth, id, Some(data))
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self::new(TunnelKind::Ping, id, None)
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::new(TunnelKind::Pong, id, None)
    }

    pub fn request(id: impl Into<String>, request: &RelayRequest) -> Self {
        Self::new(TunnelKind::Request, id, to_object(request))
    }

    /// Non-terminal streaming chunk for a relayed request.
    pub fn response_chunk(id: impl Into<String>, chunk: Value) -> Self {
        let mut data = Map::new();
        data.insert("chunk".to_string(), chunk);
        data.insert("done".to_string(), Value::Bool(false));
        Self::new(TunnelKind::Response, id, Some(data))
    }

    /// Terminal response for a relayed request.
    pub fn response(id: impl Into<String>, response: &RelayResponse) -> Self {
        Self::new(TunnelKind::Response, id, to_object(response))
    }

    /// Terminal error for a relayed request (or a protocol error).
    pub fn error(id: impl Into<String>, payload: &ErrorPayload) -> Self {
        Self::new(TunnelKind::Error, id, to_object(payload))
    }

    /// Whether this `response` ends the request (`done` absent counts as terminal).
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            TunnelKind::Error => true,
            TunnelKind::Response => self
                .data
                .as_ref()
                .and_then(|d| d.get("done"))
                .and_then(Value::as_bool)
                .unwrap_or(true),
            _ => false,
        }
    }

    pub fn relay_request(&self) -> Result<RelayRequest, CodecError> {
        let request: RelayRequest = self.payload()?;
        request.validate().map_err(|reason| self.invalid(reason))?;
        Ok(request)
    }

    pub fn relay_response(&self) -> Result<RelayResponse, CodecError> {
        self.payload()
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, CodecError> {
        self.payload()
    }

    pub fn auth_ack(&self) -> Result<AuthAck, CodecError> {
        self.payload()
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let value = Value::Object(self.data.clone().unwrap_or_default());
        serde_json::from_value(value).map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: String) -> CodecError {
        CodecError::InvalidPayload {
            kind: self.kind.to_string(),
            id: Some(self.id.clone()),
            reason,
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Option<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

// ── Payloads ────────────────────────────────────────────────────────────

/// `auth` reply from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// HTTP call the relay wants executed against the local inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

impl RelayRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: default_method(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !ALLOWED_METHODS.contains(&self.method.as_str()) {
            return Err(format!("unsupported method {:?}", self.method));
        }
        if !self.path.starts_with('/') {
            return Err(format!("path must start with '/', got {:?}", self.path));
        }
        if self.path.contains("://") {
            return Err(format!("path must be relative, got {:?}", self.path));
        }
        Ok(())
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_path() -> String {
    "/api/generate".to_string()
}

/// Terminal response for a relayed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default = "default_done")]
    pub done: bool,
}

fn default_done() -> bool {
    true
}

/// Machine-readable reason carried by an `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthRejected,
    AdapterError,
    Timeout,
    ConnectionLost,
    DuplicateRequest,
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRejected => "auth_rejected",
            Self::AdapterError => "adapter_error",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::DuplicateRequest => "duplicate_request",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    /// Id of the request this error refers to, when it differs from the message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            original_id: None,
        }
    }

    pub fn with_original_id(mut self, id: impl Into<String>) -> Self {
        self.original_id = Some(id.into());
        self
    }
}

// ── Framing ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Map<String, Value>>,
    timestamp: &'a DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Serialize a message into a WebSocket text frame.
pub fn encode_tunnel(message: &TunnelMessage) -> Result<String, CodecError> {
    let wire = WireOut {
        kind: message.kind.as_str(),
        id: &message.id,
        data: message.data.as_ref(),
        timestamp: &message.timestamp,
    };
    serde_json::to_string(&wire).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse a WebSocket text frame.
///
/// Besides the envelope, `request` and `error` payloads are checked against
/// their schema. A missing timestamp is filled with the receive time.
pub fn decode_tunnel(frame: &str) -> Result<TunnelMessage, CodecError> {
    check_size(frame, MAX_TUNNEL_FRAME_BYTES)?;
    let wire: WireIn =
        serde_json::from_str(frame).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let kind: TunnelKind = wire.kind.parse()?;

    let id = match wire.id {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Err(CodecError::InvalidPayload {
                kind: kind.to_string(),
                id: None,
                reason: "missing id".to_string(),
            });
        }
    };
    let data = object_or_none(kind.as_str(), Some(&id), wire.data)?;

    let message = TunnelMessage {
        kind,
        id,
        data,
        timestamp: wire.timestamp.unwrap_or_else(Utc::now),
    };

    match message.kind {
        TunnelKind::Request => {
            message.relay_request()?;
        }
        TunnelKind::Error => {
            message.error_payload()?;
        }
        _ => {}
    }

    Ok(message)
}
