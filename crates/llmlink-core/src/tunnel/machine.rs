//! Tunnel connection state machine.
//!
//! ```text
//! disconnected --Connect--> connecting
//! connecting   --HandshakeSucceeded--> connected
//! connecting   --HandshakeFailed / ConnectionLost--> reconnecting | error
//! connected    --ConnectionLost / HeartbeatMissed--> reconnecting | error
//! reconnecting --BackoffElapsed--> connecting
//! any          --AuthRejected--> error
//! any          --Stop--> disconnected
//! error        --Connect--> connecting
//! ```
//!
//! The machine is pure: the tunnel task feeds it triggers and acts on the
//! returned [`Transition`]. Failures move to `reconnecting` while the
//! [`Backoff`] allows another attempt and to `error` once it does not.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::Backoff;

/// Observable state of the tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed,
    AuthRejected,
    ConnectionLost,
    HeartbeatMissed,
    BackoffElapsed,
    Stop,
}

/// A state change produced by [`ConnectionMachine::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Reconnect attempts made since the last successful connect.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    backoff: Backoff,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait in `reconnecting` before the next attempt.
    pub fn retry_delay(&self) -> Option<Duration> {
        (self.state == ConnectionState::Reconnecting).then(|| self.backoff.delay(self.attempts))
    }

    /// Apply a trigger. `None` means the trigger does not apply in the current
    /// state and nothing changed.
    pub fn handle(&mut self, trigger: Trigger) -> Option<Transition> {
        use ConnectionState::*;

        let from = self.state;
        let to = match (from, trigger) {
            (Disconnected | Error, Trigger::Connect) => {
                self.attempts = 0;
                Connecting
            }
            (Reconnecting, Trigger::Connect | Trigger::BackoffElapsed) => Connecting,
            (Connecting, Trigger::HandshakeSucceeded) => {
                self.attempts = 0;
                Connected
            }
            (Connecting, Trigger::HandshakeFailed | Trigger::ConnectionLost)
            | (Connected, Trigger::ConnectionLost | Trigger::HeartbeatMissed) => self.fail(),
            (Connecting | Connected | Reconnecting, Trigger::AuthRejected) => Error,
            (Connecting | Connected | Reconnecting | Error, Trigger::Stop) => {
                self.attempts = 0;
                Disconnected
            }
            _ => return None,
        };

        self.state = to;
        Some(Transition {
            from,
            to,
            attempts: self.attempts,
        })
    }

    fn fail(&mut self) -> ConnectionState {
        if self.backoff.allows(self.attempts) {
            self.attempts += 1;
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Error
        }
    }
}
