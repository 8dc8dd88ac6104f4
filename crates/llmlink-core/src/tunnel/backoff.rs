//! Exponential reconnect backoff.

use std::time::Duration;

use llmlink_config::TunnelConfig;

/// Reconnect delay policy: `base * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    /// Reconnect attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_attempts,
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_max_delay(),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based). Attempt 0 has no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another reconnect attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}
