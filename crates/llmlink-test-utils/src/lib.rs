#![deny(unsafe_code)]

//! Shared test utilities for the llmlink workspace.
//!
//! Provides config builders, tracing helpers and two fakes: a WebSocket
//! relay ([`relay::FakeRelay`]) and an Ollama-style inference server
//! ([`inference::FakeInference`]), so integration tests never touch the
//! network beyond loopback.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! llmlink-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod inference;
pub mod relay;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use inference::FakeInference;
pub use relay::{AuthMode, FakeRelay, RelayConnection};
