//! IPC wire messages exchanged between local desktop processes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CodecError, MAX_IPC_FRAME_BYTES, check_size, object_or_none};

/// Discriminator of an [`IpcMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcKind {
    ShowWindow,
    HideWindow,
    ToggleWindow,
    OpenSettings,
    Quit,
    Ping,
    Pong,
    Ack,
    /// Announces the sender's role (`ui`, `tray`, `settings`, ...).
    Register,
    /// Asks the coordinator for the current tunnel state.
    StatusRequest,
    /// Tunnel state report, broadcast on every state change.
    ConnectionStatus,
    ConnectTunnel,
    DisconnectTunnel,
}

impl IpcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShowWindow => "show_window",
            Self::HideWindow => "hide_window",
            Self::ToggleWindow => "toggle_window",
            Self::OpenSettings => "open_settings",
            Self::Quit => "quit",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "ack",
            Self::Register => "register",
            Self::StatusRequest => "status_request",
            Self::ConnectionStatus => "connection_status",
            Self::ConnectTunnel => "connect_tunnel",
            Self::DisconnectTunnel => "disconnect_tunnel",
        }
    }

    /// Window-control signals the coordinator fans out to the other processes.
    pub fn is_window_control(&self) -> bool {
        matches!(
            self,
            Self::ShowWindow | Self::HideWindow | Self::ToggleWindow | Self::OpenSettings
        )
    }
}

impl fmt::Display for IpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpcKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "show_window" => Self::ShowWindow,
            "hide_window" => Self::HideWindow,
            "toggle_window" => Self::ToggleWindow,
            "open_settings" => Self::OpenSettings,
            "quit" => Self::Quit,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "ack" => Self::Ack,
            "register" => Self::Register,
            "status_request" => Self::StatusRequest,
            "connection_status" => Self::ConnectionStatus,
            "connect_tunnel" => Self::ConnectTunnel,
            "disconnect_tunnel" => Self::DisconnectTunnel,
            other => return Err(CodecError::UnknownType(other.to_string())),
        })
    }
}

/// One message on the IPC transport. The sender is never on the wire; the
/// server tags inbound messages with the connection's client id.
#[derive(Debug, Clone, PartialEq)]
pub struct IpcMessage {
    pub kind: IpcKind,
    pub payload: Option<Map<String, Value>>,
}

impl IpcMessage {
    pub fn new(kind: IpcKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: IpcKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload: Some(payload),
        }
    }

    pub fn ping() -> Self {
        Self::new(IpcKind::Ping)
    }

    pub fn pong() -> Self {
        Self::new(IpcKind::Pong)
    }

    /// Acknowledge a message of the given kind.
    pub fn ack(of: IpcKind) -> Self {
        let mut payload = Map::new();
        payload.insert("type".to_string(), Value::from(of.as_str()));
        Self::with_payload(IpcKind::Ack, payload)
    }

    pub fn register(role: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("role".to_string(), Value::from(role));
        Self::with_payload(IpcKind::Register, payload)
    }

    pub fn connection_status(state: &str, detail: Option<&str>) -> Self {
        let mut payload = Map::new();
        payload.insert("state".to_string(), Value::from(state));
        if let Some(detail) = detail {
            payload.insert("detail".to_string(), Value::from(detail));
        }
        Self::with_payload(IpcKind::ConnectionStatus, payload)
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }

    fn validate(&self) -> Result<(), CodecError> {
        let required = match self.kind {
            IpcKind::Register => Some("role"),
            IpcKind::ConnectionStatus => Some("state"),
            _ => None,
        };
        if let Some(field) = required
            && self.payload_str(field).is_none_or(str::is_empty)
        {
            return Err(CodecError::InvalidPayload {
                kind: self.kind.to_string(),
                id: None,
                reason: format!("missing string field {field:?}"),
            });
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Map<String, Value>>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// Serialize a message as one newline-terminated line. Anything
/// [`decode_ipc`] would reject is refused here too.
pub fn encode_ipc(message: &IpcMessage) -> Result<String, CodecError> {
    message.validate()?;
    let wire = WireOut {
        kind: message.kind.as_str(),
        payload: message.payload.as_ref(),
    };
    let mut line = serde_json::to_string(&wire).map_err(|e| CodecError::Encode(e.to_string()))?;
    check_size(&line, MAX_IPC_FRAME_BYTES)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line; surrounding whitespace, including the newline, is ignored.
pub fn decode_ipc(line: &str) -> Result<IpcMessage, CodecError> {
    let line = line.trim();
    check_size(line, MAX_IPC_FRAME_BYTES)?;
    let wire: WireIn =
        serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let kind: IpcKind = wire.kind.parse()?;
    let message = IpcMessage {
        kind,
        payload: object_or_none(kind.as_str(), None, wire.payload)?,
    };
    message.validate()?;
    Ok(message)
}
