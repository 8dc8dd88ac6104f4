//! Configuration builders for tests.

use std::path::Path;
use std::time::Duration;

use llmlink_config::AppConfig;
use llmlink_core::tunnel::{Backoff, TunnelSettings};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .relay_url(&relay.url())
///     .ipc_port(0)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn relay_url(mut self, url: &str) -> Self {
        self.config.tunnel.relay_url = url.to_string();
        self
    }

    pub fn heartbeat(mut self, interval_secs: u64, timeout_secs: u64) -> Self {
        self.config.tunnel.heartbeat_interval_secs = interval_secs;
        self.config.tunnel.heartbeat_timeout_secs = timeout_secs;
        self
    }

    pub fn reconnect(mut self, base_delay_ms: u64, max_delay_secs: u64, max_attempts: u32) -> Self {
        self.config.tunnel.reconnect_base_delay_ms = base_delay_ms;
        self.config.tunnel.reconnect_max_delay_secs = max_delay_secs;
        self.config.tunnel.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.tunnel.request_timeout_secs = secs;
        self
    }

    pub fn inference_url(mut self, url: &str) -> Self {
        self.config.inference.base_url = url.to_string();
        self
    }

    pub fn ipc_host(mut self, host: &str) -> Self {
        self.config.ipc.host = host.to_string();
        self
    }

    pub fn ipc_port(mut self, port: u16) -> Self {
        self.config.ipc.port = port;
        self
    }

    pub fn ipc_port_file(mut self, path: &Path) -> Self {
        self.config.ipc.port_file = Some(path.to_path_buf());
        self
    }

    pub fn liveness_window_secs(mut self, secs: u64) -> Self {
        self.config.ipc.liveness_window_secs = secs;
        self
    }

    pub fn token_env(mut self, var: &str) -> Self {
        self.config.auth.token_env = var.to_string();
        self
    }

    pub fn token_file(mut self, path: &Path) -> Self {
        self.config.auth.token_file = Some(path.to_path_buf());
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tunnel settings with millisecond timings, for tests that exercise
/// reconnects and heartbeats without waiting whole seconds.
pub fn fast_tunnel_settings(relay_url: &str) -> TunnelSettings {
    TunnelSettings {
        relay_url: relay_url.to_string(),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(10),
        request_timeout: Duration::from_secs(5),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200), 3),
    }
}
