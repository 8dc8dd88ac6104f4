#![deny(unsafe_code)]

//! llmlink core runtime.
//!
//! Connects a local inference server to a cloud relay over a persistent
//! WebSocket tunnel, and coordinates the desktop processes (tray, settings
//! window, CLI) over a local TCP+JSON IPC transport.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send` boxed future, used by traits consumed as `dyn Trait`
/// ([`TokenSource`], [`InferenceAdapter`]).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// JSON wire messages for the tunnel and the IPC transport.
pub mod codec;
/// Routes IPC signals and mirrors tunnel state.
pub mod coordinator;
/// Cancellable broadcast subscriptions.
pub mod events;
/// Local inference server adapter.
pub mod inference;
/// Local TCP+JSON transport between desktop processes.
pub mod ipc;
/// Bearer token sources.
pub mod token;
/// Persistent WebSocket tunnel to the cloud relay.
pub mod tunnel;

pub use coordinator::{Coordinator, CoordinatorError, StopReason};
pub use events::EventStream;
pub use inference::{HttpInferenceAdapter, InferenceAdapter};
pub use ipc::{IpcClient, IpcServer};
pub use token::{BearerToken, TokenSource};
pub use tunnel::{ConnectionState, TunnelClient, TunnelEvent, TunnelSettings};
