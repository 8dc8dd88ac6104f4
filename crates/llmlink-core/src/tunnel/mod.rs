//! Tunnel client — the persistent WebSocket connection to the cloud relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  connect/stop   ┌─────────────┐   WebSocket   ┌─────────┐
//! │ TunnelClient │────────────────▶│ tunnel task │◀─────────────▶│  relay  │
//! │   (handle)   │◀── state/events─│ (machine)   │               └─────────┘
//! └──────────────┘                 └──────┬──────┘
//!                                         │ one task per request
//!                                  ┌──────▼──────┐
//!                                  │  inference  │
//!                                  │   adapter   │
//!                                  └─────────────┘
//! ```
//!
//! A single task owns the socket, the [`ConnectionMachine`] and the
//! pending-request table. The [`TunnelClient`] handle talks to it over a
//! command channel and observes it through a `watch` for the current state
//! and a broadcast [`EventStream`] for transitions and request results.

pub mod backoff;
pub mod heartbeat;
pub mod machine;
pub mod pending;
mod session;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use llmlink_config::TunnelConfig;

use crate::codec::ErrorCode;
use crate::events::{EVENT_CHANNEL_CAPACITY, EventStream};
use crate::inference::InferenceAdapter;
use crate::token::TokenSource;

pub use backoff::Backoff;
pub use machine::{ConnectionMachine, ConnectionState, Transition, Trigger};

use session::{HandshakeError, Session, SessionEnd};

/// Errors from the tunnel handle.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel task is not running")]
    Closed,
}

/// Runtime settings of the tunnel, derived from `[tunnel]` config.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub relay_url: String,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff: Backoff,
}

impl TunnelSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            relay_url: config.relay_url.clone(),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            request_timeout: config.request_timeout(),
            backoff: Backoff::from_config(config),
        }
    }
}

/// How a relayed request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed { status: u16 },
    Failed { code: ErrorCode, message: String },
}

/// Published by the tunnel task.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        attempts: u32,
    },
    /// The relay refused the bearer token; the tunnel is now in `error`.
    AuthRejected { reason: String },
    /// Terminal result of a relayed request, including synthetic failures.
    RequestFinished { id: String, outcome: RequestOutcome },
}

#[derive(Debug)]
enum Command {
    Connect,
    Stop,
    Shutdown,
}

/// Handle to a running tunnel task.
pub struct TunnelClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<TunnelEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Start the tunnel task in `disconnected`. Must be called inside a Tokio runtime.
    pub fn spawn(
        settings: TunnelSettings,
        tokens: Arc<dyn TokenSource>,
        adapter: Arc<dyn InferenceAdapter>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = TunnelTask {
            machine: ConnectionMachine::new(settings.backoff),
            settings,
            tokens,
            adapter,
            commands: command_rx,
            state_tx,
            events: events.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            commands,
            state,
            events,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Start connecting. From `error` this resets the attempt counter; from
    /// `reconnecting` it skips the remaining backoff delay.
    pub fn connect(&self) -> Result<(), TunnelError> {
        self.send(Command::Connect)
    }

    /// Close the connection and return to `disconnected`. Safe in any state.
    pub fn stop(&self) -> Result<(), TunnelError> {
        self.send(Command::Stop)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> EventStream<TunnelEvent> {
        EventStream::new(self.events.subscribe(), "tunnel")
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Tunnel task ended abnormally");
        }
    }

    fn send(&self, command: Command) -> Result<(), TunnelError> {
        self.commands.send(command).map_err(|_| TunnelError::Closed)
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ── Tunnel task ─────────────────────────────────────────────────────────

enum Flow {
    Continue,
    Exit,
}

struct TunnelTask {
    settings: TunnelSettings,
    tokens: Arc<dyn TokenSource>,
    adapter: Arc<dyn InferenceAdapter>,
    machine: ConnectionMachine,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelTask {
    async fn run(mut self) {
        info!(url = %self.settings.relay_url, "Tunnel task started");
        loop {
            let flow = match self.machine.state() {
                ConnectionState::Disconnected | ConnectionState::Error => self.idle().await,
                ConnectionState::Reconnecting => self.wait_backoff().await,
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.connect_once().await
                }
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        self.apply(Trigger::Stop);
        info!("Tunnel task stopped");
    }

    fn apply(&mut self, trigger: Trigger) {
        let Some(transition) = self.machine.handle(trigger) else {
            return;
        };
        self.state_tx.send_replace(transition.to);
        info!(
            from = %transition.from,
            to = %transition.to,
            attempts = transition.attempts,
            ?trigger,
            "Tunnel state changed"
        );
        let _ = self.events.send(TunnelEvent::StateChanged {
            from: transition.from,
            to: transition.to,
            attempts: transition.attempts,
        });
    }

    fn reject_auth(&mut self, reason: String) {
        warn!(%reason, "Relay rejected authentication");
        self.apply(Trigger::AuthRejected);
        let _ = self.events.send(TunnelEvent::AuthRejected { reason });
    }

    /// Apply a command received outside of an established session.
    fn on_command(&mut self, command: Option<Command>) -> Flow {
        match command {
            Some(Command::Connect) => {
                self.apply(Trigger::Connect);
                Flow::Continue
            }
            Some(Command::Stop) => {
                self.apply(Trigger::Stop);
                Flow::Continue
            }
            Some(Command::Shutdown) | None => Flow::Exit,
        }
    }

    async fn idle(&mut self) -> Flow {
        let command = self.commands.recv().await;
        self.on_command(command)
    }

    async fn wait_backoff(&mut self) -> Flow {
        let delay = self.machine.retry_delay().unwrap_or_default();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.machine.attempts(),
            "Reconnecting after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                self.apply(Trigger::BackoffElapsed);
                Flow::Continue
            }
            command = self.commands.recv() => self.on_command(command),
        }
    }

    async fn connect_once(&mut self) -> Flow {
        let established = tokio::select! {
            result = session::establish(&self.settings, self.tokens.as_ref()) => result,
            command = self.commands.recv() => {
                // Connect while connecting restarts the attempt.
                return self.on_command(command);
            }
        };

        let ws = match established {
            Ok(ws) => ws,
            Err(HandshakeError::AuthRejected(reason)) => {
                self.reject_auth(reason);
                return Flow::Continue;
            }
            Err(HandshakeError::Transport(reason)) => {
                warn!(%reason, "Tunnel handshake failed");
                self.apply(Trigger::HandshakeFailed);
                return Flow::Continue;
            }
        };

        self.apply(Trigger::HandshakeSucceeded);
        let session = Session::new(&self.settings, self.adapter.clone(), self.events.clone());
        match session.run(ws, &mut self.commands).await {
            SessionEnd::Stopped => {
                self.apply(Trigger::Stop);
                Flow::Continue
            }
            SessionEnd::Shutdown => Flow::Exit,
            SessionEnd::Lost(reason) => {
                warn!(%reason, "Tunnel connection lost");
                self.apply(Trigger::ConnectionLost);
                Flow::Continue
            }
            SessionEnd::HeartbeatMissed => {
                warn!("Relay did not answer heartbeat");
                self.apply(Trigger::HeartbeatMissed);
                Flow::Continue
            }
            SessionEnd::AuthRejected(reason) => {
                self.reject_auth(reason);
                Flow::Continue
            }
        }
    }
}
