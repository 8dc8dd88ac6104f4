//! Message codec — JSON framing for the tunnel and the local IPC transport.
//!
//! Both wire formats are JSON objects discriminated by a `type` field. The
//! tunnel sends one object per WebSocket text frame; IPC sends one object per
//! line over TCP. Decoding goes through a loose wire struct first so unknown
//! types and malformed payloads surface as distinct [`CodecError`] variants
//! instead of a generic serde failure.
//!
//! Nothing in here touches a socket.

pub mod ipc;
pub mod tunnel;

pub use ipc::{IpcKind, IpcMessage, decode_ipc, encode_ipc};
pub use tunnel::{
    AuthAck, ErrorCode, ErrorPayload, RelayRequest, RelayResponse, TunnelKind, TunnelMessage,
    decode_tunnel, encode_tunnel,
};

/// Largest IPC line accepted, newline excluded.
pub const MAX_IPC_FRAME_BYTES: usize = 64 * 1024;

/// Largest tunnel text frame accepted.
pub const MAX_TUNNEL_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors from encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: String,
        /// Correlation id of the offending message, when it had one.
        id: Option<String>,
        reason: String,
    },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Ensure a `data`/`payload` value is either absent or a JSON object.
fn object_or_none(
    kind: &str,
    id: Option<&str>,
    value: Option<serde_json::Value>,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, CodecError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(CodecError::InvalidPayload {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            reason: format!("expected an object, got {}", json_type_name(&other)),
        }),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn check_size(frame: &str, limit: usize) -> Result<(), CodecError> {
    if frame.len() > limit {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            limit,
        });
    }
    Ok(())
}
