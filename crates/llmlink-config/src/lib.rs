#![deny(unsafe_code)]

//! Configuration loading and validation for llmlink.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure; each section has its own type with
//! serde defaults so an empty file yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cloud tunnel configuration.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Local inference server configuration.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Local IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Bearer token sources.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Tunnel ──────────────────────────────────────────────────────────────

/// Configuration for the WebSocket tunnel to the cloud relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// WebSocket URL of the relay endpoint (`ws://` or `wss://`).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Timeout for the TCP/TLS/WebSocket upgrade.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for the relay to acknowledge the `auth` message.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Interval between heartbeat pings while connected.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// How long to wait for the matching pong.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Delay before the first reconnect attempt; doubles per attempt.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound on the reconnect delay.
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    /// Reconnect attempts before the tunnel gives up and enters `error`.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Upper bound on a single relayed request, including streaming.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_relay_url() -> String {
    "wss://app.cloudtolocalllm.online/ws/bridge".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

// ── Inference ───────────────────────────────────────────────────────────

/// Configuration for the local inference server (Ollama-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL requests are forwarded to.
    #[serde(default = "default_inference_base_url")]
    pub base_url: String,

    /// HTTP client timeout for a single call to the inference server.
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_base_url(),
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_inference_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    60
}

// ── IPC ─────────────────────────────────────────────────────────────────

/// Configuration for the local TCP IPC transport between desktop processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Address the IPC server binds (loopback only in practice).
    #[serde(default = "default_ipc_host")]
    pub host: String,

    /// Port the IPC server binds; `0` lets the OS pick one.
    #[serde(default = "default_ipc_port")]
    pub port: u16,

    /// File the bound port is published to for discovery by other processes.
    #[serde(default)]
    pub port_file: Option<PathBuf>,

    /// Evict clients silent for longer than this; `0` disables the sweep.
    #[serde(default)]
    pub liveness_window_secs: u64,

    /// Delay between IPC client reconnect attempts.
    #[serde(default = "default_client_reconnect_interval_ms")]
    pub client_reconnect_interval_ms: u64,

    /// Interval of client-driven pings; `0` disables them.
    #[serde(default = "default_client_ping_interval_secs")]
    pub client_ping_interval_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            port: default_ipc_port(),
            port_file: None,
            liveness_window_secs: 0,
            client_reconnect_interval_ms: default_client_reconnect_interval_ms(),
            client_ping_interval_secs: default_client_ping_interval_secs(),
        }
    }
}

impl IpcConfig {
    pub fn liveness_window(&self) -> Option<Duration> {
        (self.liveness_window_secs > 0).then(|| Duration::from_secs(self.liveness_window_secs))
    }

    pub fn client_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.client_reconnect_interval_ms)
    }

    pub fn client_ping_interval(&self) -> Option<Duration> {
        (self.client_ping_interval_secs > 0)
            .then(|| Duration::from_secs(self.client_ping_interval_secs))
    }
}

fn default_ipc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ipc_port() -> u16 {
    8183
}

fn default_client_reconnect_interval_ms() -> u64 {
    1000
}

fn default_client_ping_interval_secs() -> u64 {
    10
}

// ── Auth ────────────────────────────────────────────────────────────────

/// Where the bearer token for the relay comes from.
///
/// Token acquisition is handled by the desktop login flow; llmlink only reads
/// what it produced. A token file takes precedence over the environment.
///
/// ## TOML Example
///
/// ```toml
/// [auth]
/// token_env = "LLMLINK_TOKEN"
/// token_file = "/home/alice/.config/llmlink/tokens.json"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding a raw bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// JSON file with an `access_token` field, rewritten by the login flow.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token_file: None,
        }
    }
}

fn default_token_env() -> String {
    "LLMLINK_TOKEN".to_string()
}

// ── Logging ─────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let relay = url::Url::parse(&self.tunnel.relay_url).map_err(|e| {
            ConfigError::Validation(format!(
                "tunnel.relay_url is not a valid URL ({e}): {:?}",
                self.tunnel.relay_url
            ))
        })?;
        if relay.scheme() != "ws" && relay.scheme() != "wss" {
            return Err(ConfigError::Validation(format!(
                "tunnel.relay_url must use ws:// or wss://, got {:?}",
                relay.scheme()
            )));
        }
        if self.tunnel.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "tunnel.heartbeat_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.tunnel.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tunnel.heartbeat_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.tunnel.reconnect_base_delay() > self.tunnel.reconnect_max_delay() {
            return Err(ConfigError::Validation(format!(
                "tunnel.reconnect_base_delay_ms ({}) exceeds tunnel.reconnect_max_delay_secs ({})",
                self.tunnel.reconnect_base_delay_ms, self.tunnel.reconnect_max_delay_secs
            )));
        }
        if self.tunnel.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tunnel.request_timeout_secs must be non-zero".to_string(),
            ));
        }

        let inference = url::Url::parse(&self.inference.base_url).map_err(|e| {
            ConfigError::Validation(format!(
                "inference.base_url is not a valid URL ({e}): {:?}",
                self.inference.base_url
            ))
        })?;
        if inference.scheme() != "http" && inference.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "inference.base_url must use http:// or https://, got {:?}",
                inference.scheme()
            )));
        }

        if self.ipc.host.is_empty() {
            return Err(ConfigError::Validation(
                "ipc.host must not be empty".to_string(),
            ));
        }
        if self.ipc.client_reconnect_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "ipc.client_reconnect_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.auth.token_env.is_empty() && self.auth.token_file.is_none() {
            return Err(ConfigError::Validation(
                "auth needs either token_env or token_file".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(
            config.tunnel.relay_url,
            "wss://app.cloudtolocalllm.online/ws/bridge"
        );
        assert_eq!(config.tunnel.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.tunnel.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(config.tunnel.max_reconnect_attempts, 10);
        assert_eq!(config.inference.base_url, "http://localhost:11434");
        assert_eq!(config.ipc.host, "127.0.0.1");
        assert_eq!(config.ipc.port, 8183);
        assert_eq!(config.ipc.liveness_window(), None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.ipc.port, 8183);
        assert!(config.auth.token_file.is_none());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [tunnel]
            relay_url = "ws://127.0.0.1:9000/ws/bridge"
            heartbeat_interval_secs = 5
            heartbeat_timeout_secs = 2
            reconnect_base_delay_ms = 250
            reconnect_max_delay_secs = 8
            max_reconnect_attempts = 3
            request_timeout_secs = 30

            [inference]
            base_url = "http://127.0.0.1:11500"
            timeout_secs = 15

            [ipc]
            host = "127.0.0.1"
            port = 0
            port_file = "/tmp/llmlink/ipc_port"
            liveness_window_secs = 45

            [auth]
            token_file = "/tmp/llmlink/tokens.json"

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.tunnel.relay_url, "ws://127.0.0.1:9000/ws/bridge");
        assert_eq!(
            config.tunnel.reconnect_base_delay(),
            Duration::from_millis(250)
        );
        assert_eq!(config.tunnel.max_reconnect_attempts, 3);
        assert_eq!(config.tunnel.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.inference.timeout(), Duration::from_secs(15));
        assert_eq!(config.ipc.port, 0);
        assert_eq!(
            config.ipc.port_file.as_deref(),
            Some(Path::new("/tmp/llmlink/ipc_port"))
        );
        assert_eq!(config.ipc.liveness_window(), Some(Duration::from_secs(45)));
        assert_eq!(config.auth.token_env, "LLMLINK_TOKEN");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_http_relay_url() {
        let toml = r#"
            [tunnel]
            relay_url = "https://app.example.com/ws/bridge"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validation_rejects_garbage_relay_url() {
        let toml = r#"
            [tunnel]
            relay_url = "not a url"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_heartbeat() {
        let toml = r#"
            [tunnel]
            heartbeat_interval_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_base_delay_above_max() {
        let toml = r#"
            [tunnel]
            reconnect_base_delay_ms = 120000
            reconnect_max_delay_secs = 60
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("reconnect_base_delay_ms"));
    }

    #[test]
    fn test_validation_rejects_non_http_inference_url() {
        let toml = r#"
            [inference]
            base_url = "ftp://localhost:11434"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_ipc_host() {
        let toml = r#"
            [ipc]
            host = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_requires_a_token_source() {
        let toml = r#"
            [auth]
            token_env = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_client_ping_can_be_disabled() {
        let toml = r#"
            [ipc]
            client_ping_interval_secs = 0
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.ipc.client_ping_interval(), None);
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let mut config = AppConfig::default();
        config.ipc.port_file = Some(PathBuf::from("/tmp/ipc_port"));
        config.tunnel.max_reconnect_attempts = 4;
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::parse(&serialized).unwrap();
        assert_eq!(parsed.tunnel.max_reconnect_attempts, 4);
        assert_eq!(parsed.ipc.port_file, config.ipc.port_file);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmlink.toml");
        tokio::fs::write(&path, "[ipc]\nport = 9001\n").await.unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.ipc.port, 9001);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
