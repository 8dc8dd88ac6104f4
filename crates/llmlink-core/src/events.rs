//! Cancellable event subscriptions.
//!
//! Components publish on a `tokio::sync::broadcast` channel; consumers hold an
//! [`EventStream`]. A slow consumer that falls behind the channel capacity
//! skips the oldest events and gets a warning rather than blocking the
//! publisher. The number skipped is kept so the consumer can resync from
//! current state.

use tokio::sync::broadcast;
use tracing::warn;

/// Default capacity of event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A subscription to a broadcast event channel.
pub struct EventStream<T> {
    rx: Option<broadcast::Receiver<T>>,
    name: &'static str,
    skipped: u64,
}

impl<T: Clone> EventStream<T> {
    pub fn new(rx: broadcast::Receiver<T>, name: &'static str) -> Self {
        Self {
            rx: Some(rx),
            name,
            skipped: 0,
        }
    }

    /// Wait for the next event. `None` once the publisher is gone or the
    /// stream was cancelled.
    pub async fn next(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(stream = self.name, skipped, "Event subscriber lagged");
                    self.skipped += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Events skipped since the last call.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Drop the subscription; later calls to [`next`](Self::next) return `None`.
    pub fn cancel(&mut self) {
        self.rx = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }
}
