//! Handshake and the connected-session loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::heartbeat::{Heartbeat, HeartbeatAction};
use super::pending::PendingTable;
use super::{Command, RequestOutcome, TunnelEvent, TunnelSettings};
use crate::codec::{
    CodecError, ErrorCode, ErrorPayload, RelayRequest, RelayResponse, TunnelKind, TunnelMessage,
    decode_tunnel, encode_tunnel,
};
use crate::inference::{AdapterError, InferenceAdapter, RelayChunk};
use crate::token::TokenSource;

pub(super) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Bound on farewell writes (synthetic errors, close frame) to a peer that
/// may have stopped reading.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);

pub(super) enum HandshakeError {
    /// Token missing or refused; needs a fresh token, not a retry.
    AuthRejected(String),
    /// Network or protocol failure; retried with backoff.
    Transport(String),
}

impl From<CodecError> for HandshakeError {
    fn from(e: CodecError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Open the WebSocket and authenticate.
pub(super) async fn establish(
    settings: &TunnelSettings,
    tokens: &dyn TokenSource,
) -> Result<WsStream, HandshakeError> {
    let token = tokens
        .token()
        .await
        .map_err(|e| HandshakeError::AuthRejected(e.to_string()))?;

    let mut request = settings
        .relay_url
        .as_str()
        .into_client_request()
        .map_err(|e| HandshakeError::Transport(format!("invalid relay URL: {e}")))?;
    let authorization = HeaderValue::from_str(&token.header_value()).map_err(|_| {
        HandshakeError::AuthRejected("token is not a valid header value".to_string())
    })?;
    request.headers_mut().insert(AUTHORIZATION, authorization);
    if let Ok(agent) = HeaderValue::from_str(&crate::build_info::user_agent()) {
        request.headers_mut().insert(USER_AGENT, agent);
    }

    debug!(url = %settings.relay_url, "Opening relay connection");
    let (mut ws, _response) = match timeout(settings.connect_timeout, connect_async(request)).await
    {
        Err(_) => {
            return Err(HandshakeError::Transport(format!(
                "connect timed out after {:?}",
                settings.connect_timeout
            )));
        }
        Ok(Err(WsError::Http(response)))
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            return Err(HandshakeError::AuthRejected(format!(
                "relay refused upgrade with {}",
                response.status()
            )));
        }
        Ok(Err(e)) => return Err(HandshakeError::Transport(e.to_string())),
        Ok(Ok(pair)) => pair,
    };

    let auth = TunnelMessage::auth(
        format!("auth-{}", chrono::Utc::now().timestamp_millis()),
        token.expose(),
    );
    ws.send(Message::Text(encode_tunnel(&auth)?.into()))
        .await
        .map_err(|e| HandshakeError::Transport(e.to_string()))?;

    match timeout(settings.handshake_timeout, await_auth_ack(&mut ws)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(HandshakeError::Transport(format!(
                "no auth acknowledgement within {:?}",
                settings.handshake_timeout
            )));
        }
    }

    info!(url = %settings.relay_url, "Tunnel authenticated");
    Ok(ws)
}

async fn await_auth_ack(ws: &mut WsStream) -> Result<(), HandshakeError> {
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(|e| HandshakeError::Transport(e.to_string()))? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(HandshakeError::Transport(format!(
                    "relay closed during handshake: {frame:?}"
                )));
            }
            _ => continue,
        };
        let message = match decode_tunnel(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping invalid frame during handshake");
                continue;
            }
        };
        match message.kind {
            TunnelKind::Auth => {
                let ack = message.auth_ack()?;
                if ack.ok {
                    return Ok(());
                }
                return Err(HandshakeError::AuthRejected(
                    ack.reason.unwrap_or_else(|| "rejected".to_string()),
                ));
            }
            TunnelKind::Error => {
                let payload = message.error_payload()?;
                if payload.code == ErrorCode::AuthRejected {
                    return Err(HandshakeError::AuthRejected(payload.message));
                }
                return Err(HandshakeError::Transport(format!(
                    "relay error during handshake ({}): {}",
                    payload.code, payload.message
                )));
            }
            TunnelKind::Ping => {
                let pong = encode_tunnel(&TunnelMessage::pong(message.id))?;
                ws.send(Message::Text(pong.into()))
                    .await
                    .map_err(|e| HandshakeError::Transport(e.to_string()))?;
            }
            other => debug!(kind = %other, "Ignoring message before authentication"),
        }
    }
    Err(HandshakeError::Transport(
        "relay closed the connection during handshake".to_string(),
    ))
}

// ── Connected session ───────────────────────────────────────────────────

pub(super) enum SessionEnd {
    Stopped,
    Shutdown,
    Lost(String),
    HeartbeatMissed,
    AuthRejected(String),
}

impl SessionEnd {
    /// Whether the socket may still accept writes.
    fn writable(&self) -> bool {
        !matches!(self, Self::Lost(_))
    }
}

/// Output of a relay task, tagged with the pending entry it belongs to.
struct RelayOutput {
    id: String,
    seq: u64,
    kind: RelayOutputKind,
}

enum RelayOutputKind {
    Chunk(Value),
    Done(Result<RelayResponse, AdapterError>),
}

pub(super) struct Session<'a> {
    settings: &'a TunnelSettings,
    adapter: Arc<dyn InferenceAdapter>,
    events: broadcast::Sender<TunnelEvent>,
    pending: PendingTable,
    heartbeat: Heartbeat,
    outputs: mpsc::Sender<RelayOutput>,
    outputs_rx: mpsc::Receiver<RelayOutput>,
    duplicates: u64,
}

impl<'a> Session<'a> {
    pub(super) fn new(
        settings: &'a TunnelSettings,
        adapter: Arc<dyn InferenceAdapter>,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        let (outputs, outputs_rx) = mpsc::channel(256);
        Self {
            settings,
            adapter,
            events,
            pending: PendingTable::new(),
            heartbeat: Heartbeat::new(
                Instant::now(),
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
            ),
            outputs,
            outputs_rx,
            duplicates: 0,
        }
    }

    pub(super) async fn run(
        mut self,
        ws: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let end = loop {
            let deadline = self.heartbeat.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => {}
                    Some(Command::Stop) => break SessionEnd::Stopped,
                    Some(Command::Shutdown) | None => break SessionEnd::Shutdown,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.on_frame(text.as_str(), &mut sink).await {
                            break end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Lost(format!("relay closed the connection: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("relay stream ended".to_string()),
                },
                Some(output) = self.outputs_rx.recv() => {
                    if let Err(reason) = self.on_output(output, &mut sink).await {
                        break SessionEnd::Lost(reason);
                    }
                }
                _ = sleep_until(deadline) => match self.heartbeat.poll(Instant::now()) {
                    HeartbeatAction::SendPing(id) => {
                        debug!(%id, "Sending heartbeat");
                        if let Err(reason) = send(&mut sink, &TunnelMessage::ping(id)).await {
                            break SessionEnd::Lost(reason);
                        }
                    }
                    HeartbeatAction::Expired => break SessionEnd::HeartbeatMissed,
                    HeartbeatAction::Idle => {}
                },
            }
        };

        self.fail_pending(&mut sink, end.writable()).await;
        if end.writable() {
            let _ = timeout(FAREWELL_TIMEOUT, sink.send(Message::Close(None))).await;
        }
        end
    }

    /// Handle one inbound text frame. `Some` ends the session.
    async fn on_frame(&mut self, text: &str, sink: &mut WsSink) -> Option<SessionEnd> {
        let message = match decode_tunnel(text) {
            Ok(message) => message,
            Err(CodecError::InvalidPayload {
                kind,
                id: Some(id),
                reason,
            }) if kind == TunnelKind::Request.as_str() => {
                return self
                    .reject_request(id, reason, sink)
                    .await
                    .err()
                    .map(SessionEnd::Lost);
            }
            Err(e) => {
                warn!(error = %e, "Dropping invalid tunnel frame");
                return None;
            }
        };

        let result = match message.kind {
            TunnelKind::Request => self.on_request(message, sink).await,
            TunnelKind::Ping => send(sink, &TunnelMessage::pong(message.id)).await,
            TunnelKind::Pong => {
                if !self.heartbeat.on_pong(&message.id) {
                    debug!(id = %message.id, "Ignoring unmatched pong");
                }
                Ok(())
            }
            TunnelKind::Error => match message.error_payload() {
                Ok(payload) if payload.code == ErrorCode::AuthRejected => {
                    return Some(SessionEnd::AuthRejected(payload.message));
                }
                Ok(payload) => {
                    warn!(
                        id = %message.id,
                        code = %payload.code,
                        detail = %payload.message,
                        "Relay reported an error"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed relay error");
                    Ok(())
                }
            },
            TunnelKind::Auth => {
                debug!("Ignoring auth message on an authenticated session");
                Ok(())
            }
            TunnelKind::Response => {
                warn!(id = %message.id, "Relay sent a response; dropping");
                Ok(())
            }
        };
        result.err().map(SessionEnd::Lost)
    }

    /// Answer a malformed request. An id that is still pending belongs to
    /// the original request, so the reply goes out under a fresh id.
    async fn reject_request(
        &mut self,
        id: String,
        reason: String,
        sink: &mut WsSink,
    ) -> Result<(), String> {
        if self.pending.contains(&id) {
            return self.reply_duplicate(&id, sink).await;
        }
        warn!(%id, %reason, "Rejecting invalid request");
        let payload = ErrorPayload::new(ErrorCode::InvalidRequest, reason);
        send(sink, &TunnelMessage::error(id, &payload)).await
    }

    async fn reply_duplicate(&mut self, original_id: &str, sink: &mut WsSink) -> Result<(), String> {
        warn!(id = %original_id, "Duplicate request id while pending");
        // A fresh id keeps the original request's terminal message unique.
        self.duplicates += 1;
        let payload = ErrorPayload::new(ErrorCode::DuplicateRequest, "request id already pending")
            .with_original_id(original_id);
        let reply_id = format!("dup-{}-{}", original_id, self.duplicates);
        send(sink, &TunnelMessage::error(reply_id, &payload)).await
    }

    async fn on_request(&mut self, message: TunnelMessage, sink: &mut WsSink) -> Result<(), String> {
        let request = match message.relay_request() {
            Ok(request) => request,
            Err(e) => return self.reject_request(message.id, e.to_string(), sink).await,
        };

        let id = message.id;
        let seq = match self.pending.insert(&id, &request.path) {
            Ok(seq) => seq,
            Err(duplicate) => return self.reply_duplicate(&duplicate.id, sink).await,
        };

        debug!(%id, path = %request.path, method = %request.method, "Relaying request");
        let task = tokio::spawn(relay(
            self.adapter.clone(),
            request,
            id.clone(),
            seq,
            self.settings.request_timeout,
            self.outputs.clone(),
        ));
        self.pending.attach(&id, seq, task.abort_handle());
        Ok(())
    }

    async fn on_output(&mut self, output: RelayOutput, sink: &mut WsSink) -> Result<(), String> {
        if !self.pending.is_current(&output.id, output.seq) {
            debug!(id = %output.id, "Dropping output of a finished request");
            return Ok(());
        }

        let result = match output.kind {
            RelayOutputKind::Chunk(chunk) => {
                return send(sink, &TunnelMessage::response_chunk(output.id, chunk)).await;
            }
            RelayOutputKind::Done(result) => result,
        };

        let entry = self.pending.complete(&output.id, output.seq);
        let (message, outcome) = match result {
            Ok(response) => {
                let outcome = RequestOutcome::Completed {
                    status: response.status,
                };
                (TunnelMessage::response(&output.id, &response), outcome)
            }
            Err(e) => {
                let code = error_code(&e);
                let payload = ErrorPayload::new(code, e.to_string());
                let outcome = RequestOutcome::Failed {
                    code,
                    message: e.to_string(),
                };
                (TunnelMessage::error(&output.id, &payload), outcome)
            }
        };

        let sent = send(sink, &message).await;
        let outcome = match &sent {
            Ok(()) => outcome,
            Err(reason) => RequestOutcome::Failed {
                code: ErrorCode::ConnectionLost,
                message: reason.clone(),
            },
        };
        if let Some(entry) = entry {
            debug!(
                id = %output.id,
                elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                ?outcome,
                "Request finished"
            );
        }
        let _ = self.events.send(TunnelEvent::RequestFinished {
            id: output.id,
            outcome,
        });
        sent
    }

    /// Fail every pending request with `connection_lost`.
    async fn fail_pending(&mut self, sink: &mut WsSink, writable: bool) {
        let drained = self.pending.drain();
        if !drained.is_empty() {
            warn!(count = drained.len(), "Failing pending requests on disconnect");
        }
        for (id, _) in drained {
            let message = "tunnel connection closed".to_string();
            if writable {
                let payload = ErrorPayload::new(ErrorCode::ConnectionLost, message.clone());
                let _ = timeout(
                    FAREWELL_TIMEOUT,
                    send(sink, &TunnelMessage::error(&id, &payload)),
                )
                .await;
            }
            let _ = self.events.send(TunnelEvent::RequestFinished {
                id,
                outcome: RequestOutcome::Failed {
                    code: ErrorCode::ConnectionLost,
                    message,
                },
            });
        }
    }
}

fn error_code(error: &AdapterError) -> ErrorCode {
    match error {
        AdapterError::Timeout => ErrorCode::Timeout,
        AdapterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        _ => ErrorCode::AdapterError,
    }
}

async fn send(sink: &mut WsSink, message: &TunnelMessage) -> Result<(), String> {
    let text = encode_tunnel(message).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Run one request against the adapter, bounded by the request timeout.
async fn relay(
    adapter: Arc<dyn InferenceAdapter>,
    request: RelayRequest,
    id: String,
    seq: u64,
    request_timeout: Duration,
    outputs: mpsc::Sender<RelayOutput>,
) {
    let work = async {
        let mut chunks = adapter.relay(request).await?;
        while let Some(chunk) = chunks.recv().await {
            match chunk? {
                RelayChunk::Partial(value) => {
                    let output = RelayOutput {
                        id: id.clone(),
                        seq,
                        kind: RelayOutputKind::Chunk(value),
                    };
                    if outputs.send(output).await.is_err() {
                        return Err(AdapterError::Stream("session closed".to_string()));
                    }
                }
                RelayChunk::Complete(response) => return Ok(response),
            }
        }
        Err(AdapterError::Incomplete)
    };

    let result = timeout(request_timeout, work)
        .await
        .unwrap_or(Err(AdapterError::Timeout));
    let _ = outputs
        .send(RelayOutput {
            id,
            seq,
            kind: RelayOutputKind::Done(result),
        })
        .await;
}
