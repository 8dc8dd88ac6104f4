//! Fake cloud relay for tunnel tests.
//!
//! [`FakeRelay`] listens on a loopback port, accepts WebSocket upgrades and
//! answers the client's `auth` message according to the current
//! [`AuthMode`]. Each authenticated connection is handed to the test as a
//! [`RelayConnection`] that can send requests and inspect replies.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use llmlink_core::codec::{
    ErrorCode, ErrorPayload, TunnelKind, TunnelMessage, decode_tunnel, encode_tunnel,
};

/// How long [`RelayConnection::recv`] waits before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How the fake relay answers new connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Acknowledge `auth` with `ok: true`.
    Accept,
    /// Acknowledge `auth` with `ok: false` and this reason.
    RejectAck(String),
    /// Reply to `auth` with an `error` carrying `auth_rejected`.
    RejectError,
    /// Refuse the upgrade with this HTTP status.
    RejectUpgrade(u16),
    /// Never acknowledge `auth`.
    Silent,
}

type Ws = WebSocketStream<TcpStream>;

/// One authenticated client connection, as seen by the relay.
pub struct RelayConnection {
    ws: Ws,
    /// The client's `auth` message.
    pub auth: TunnelMessage,
    /// `Authorization` header of the upgrade request.
    pub authorization: Option<String>,
}

impl RelayConnection {
    pub async fn send(&mut self, message: &TunnelMessage) {
        let text = encode_tunnel(message).expect("failed to encode relay message");
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("failed to send relay message");
    }

    /// Send a raw text frame, for malformed-input tests.
    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("failed to send raw frame");
    }

    /// Next decoded message from the client, or `None` on close or timeout.
    pub async fn recv(&mut self) -> Option<TunnelMessage> {
        let next = async {
            while let Some(frame) = self.ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        return Some(decode_tunnel(text.as_str()).expect("client sent bad frame"));
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        };
        tokio::time::timeout(RECV_TIMEOUT, next).await.ok().flatten()
    }

    /// Next message of `kind`, skipping everything else.
    pub async fn recv_kind(&mut self, kind: TunnelKind) -> Option<TunnelMessage> {
        loop {
            let message = self.recv().await?;
            if message.kind == kind {
                return Some(message);
            }
        }
    }

    /// Next message that is not a heartbeat `ping`.
    pub async fn recv_non_ping(&mut self) -> Option<TunnelMessage> {
        loop {
            let message = self.recv().await?;
            if message.kind != TunnelKind::Ping {
                return Some(message);
            }
        }
    }

    /// Close the WebSocket from the relay side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// A loopback WebSocket relay.
pub struct FakeRelay {
    addr: SocketAddr,
    mode: Arc<Mutex<AuthMode>>,
    connections: mpsc::UnboundedReceiver<RelayConnection>,
    task: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start(mode: AuthMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake relay");
        let addr = listener.local_addr().expect("no local addr");
        let mode = Arc::new(Mutex::new(mode));
        let (tx, connections) = mpsc::unbounded_channel();

        let task_mode = mode.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mode = task_mode.lock().expect("mode lock").clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(conn) = handshake(stream, mode).await {
                        let _ = tx.send(conn);
                    }
                });
            }
        });

        Self {
            addr,
            mode,
            connections,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/bridge", self.addr)
    }

    /// Applies to connections accepted from now on.
    pub fn set_mode(&self, mode: AuthMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    /// Wait for the next authenticated connection.
    pub async fn accept(&mut self) -> Option<RelayConnection> {
        tokio::time::timeout(RECV_TIMEOUT, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handshake(stream: TcpStream, mode: AuthMode) -> Option<RelayConnection> {
    let mut authorization = None;
    let upgrade_mode = mode.clone();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        authorization = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let AuthMode::RejectUpgrade(status) = &upgrade_mode {
            let mut refused = ErrorResponse::new(Some("unauthorized".to_string()));
            *refused.status_mut() =
                StatusCode::from_u16(*status).unwrap_or(StatusCode::UNAUTHORIZED);
            return Err(refused);
        }
        Ok(response)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .ok()?;

    let auth = loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => break decode_tunnel(text.as_str()).ok()?,
            Ok(_) => continue,
            Err(_) => return None,
        }
    };

    let reply = match &mode {
        AuthMode::Accept => Some(ack(&auth.id, true, None)),
        AuthMode::RejectAck(reason) => Some(ack(&auth.id, false, Some(reason))),
        AuthMode::RejectError => Some(TunnelMessage::error(
            auth.id.clone(),
            &ErrorPayload::new(ErrorCode::AuthRejected, "token expired"),
        )),
        AuthMode::Silent | AuthMode::RejectUpgrade(_) => None,
    };
    if let Some(reply) = reply {
        let text = encode_tunnel(&reply).ok()?;
        ws.send(Message::Text(text.into())).await.ok()?;
    }

    if mode != AuthMode::Accept {
        // Keep the socket open so the client decides what happens next.
        tokio::time::sleep(Duration::from_secs(30)).await;
        return None;
    }

    Some(RelayConnection {
        ws,
        auth,
        authorization,
    })
}

fn ack(id: &str, ok: bool, reason: Option<&str>) -> TunnelMessage {
    let mut data = Map::new();
    data.insert("ok".to_string(), Value::Bool(ok));
    if let Some(reason) = reason {
        data.insert("reason".to_string(), Value::from(reason));
    }
    TunnelMessage::new(TunnelKind::Auth, id, Some(data))
}
