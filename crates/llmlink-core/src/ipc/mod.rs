//! Local IPC transport — TCP with newline-delimited JSON between desktop processes.
//!
//! One process runs the [`IpcServer`]; the tray, the settings window and any
//! other helper connect with an [`IpcClient`]. The server fans window-control
//! signals out to every registered client; see [`crate::coordinator`] for the
//! routing rules.

pub mod client;
pub mod frame;
pub mod server;

use std::io;
use std::path::PathBuf;

use tokio::sync::watch;

pub use client::{ClientOptions, IpcClient, discover_port};
pub use server::{ClientId, ClientInfo, InboundMessage, IpcServer, ServerOptions};

/// Errors from the IPC server and port discovery.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("address {0} is already in use")]
    AddressInUse(String),

    #[error("permission denied binding {0}")]
    PermissionDenied(String),

    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("port file {}: {reason}", path.display())]
    PortFile { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    pub(crate) fn from_bind(addr: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse(addr.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr.to_string()),
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                Self::InvalidAddress {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }
            }
            _ => Self::Io(e),
        }
    }
}

/// Resolve once the flag reads `value` or its sender is gone. The borrow
/// guard never escapes, so `select!` arms around this stay `Send`.
pub(crate) async fn flag_reached(rx: &mut watch::Receiver<bool>, value: bool) {
    let _ = rx.wait_for(|flag| *flag == value).await;
}
