//! Coordinator — routes IPC signals and mirrors tunnel state to desktop processes.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{IpcKind, IpcMessage};
use crate::ipc::{ClientId, InboundMessage, IpcServer};
use crate::token::TokenSource;
use crate::tunnel::{ConnectionState, TunnelClient, TunnelError, TunnelEvent};

/// Errors from the coordinator loop.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("IPC server stopped")]
    IpcClosed,

    #[error("IPC inbound messages are already consumed elsewhere")]
    InboundTaken,
}

/// Why [`Coordinator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A client sent `quit`.
    Quit,
    /// The shutdown future completed.
    Shutdown,
}

/// Glue between the IPC server and the tunnel client.
pub struct Coordinator {
    ipc: Arc<IpcServer>,
    tunnel: Arc<TunnelClient>,
    tokens: Arc<dyn TokenSource>,
}

impl Coordinator {
    pub fn new(ipc: Arc<IpcServer>, tunnel: Arc<TunnelClient>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            ipc,
            tunnel,
            tokens,
        }
    }

    pub fn ipc(&self) -> &Arc<IpcServer> {
        &self.ipc
    }

    pub fn tunnel(&self) -> &Arc<TunnelClient> {
        &self.tunnel
    }

    /// Current tunnel state as an IPC message.
    pub fn status_message(&self) -> IpcMessage {
        IpcMessage::connection_status(self.tunnel.state().as_str(), None)
    }

    /// Route events until `shutdown` completes or a client sends `quit`.
    pub async fn run<F>(&self, shutdown: F) -> Result<StopReason, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        let mut inbound = self.ipc.take_inbound().ok_or(CoordinatorError::InboundTaken)?;
        let mut tunnel_events = self.tunnel.subscribe();
        let mut refreshed = false;
        tokio::pin!(shutdown);

        info!(port = self.ipc.port(), "Coordinator running");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Coordinator shutting down");
                    return Ok(StopReason::Shutdown);
                }
                event = tunnel_events.next() => {
                    let Some(event) = event else {
                        return Err(TunnelError::Closed.into());
                    };
                    self.on_tunnel_event(event, &mut refreshed).await?;
                    if tunnel_events.take_skipped() > 0 {
                        // Missed transitions; clients get the state as it is now.
                        self.ipc.broadcast(&self.status_message()).await;
                    }
                }
                message = inbound.recv() => {
                    let Some(InboundMessage { client, message }) = message else {
                        return Err(CoordinatorError::IpcClosed);
                    };
                    if self.on_ipc_message(client, message).await? {
                        return Ok(StopReason::Quit);
                    }
                }
            }
        }
    }

    async fn on_tunnel_event(
        &self,
        event: TunnelEvent,
        refreshed: &mut bool,
    ) -> Result<(), CoordinatorError> {
        match event {
            TunnelEvent::StateChanged { to, attempts, .. } => {
                if to == ConnectionState::Connected {
                    *refreshed = false;
                }
                let detail =
                    (to == ConnectionState::Reconnecting).then(|| format!("attempt {attempts}"));
                let status = IpcMessage::connection_status(to.as_str(), detail.as_deref());
                let delivered = self.ipc.broadcast(&status).await;
                debug!(state = %to, delivered, "Broadcast tunnel state");
            }
            TunnelEvent::AuthRejected { reason } => {
                let status = IpcMessage::connection_status(
                    ConnectionState::Error.as_str(),
                    Some(&format!("authentication rejected: {reason}")),
                );
                self.ipc.broadcast(&status).await;

                // One refresh per rejection streak; a second rejection
                // without a successful connect in between stays in error.
                if *refreshed {
                    warn!("Token rejected again after refresh, leaving tunnel in error");
                    return Ok(());
                }
                *refreshed = true;
                match self.tokens.refresh().await {
                    Ok(token) if !token.is_empty() => {
                        info!("Token refreshed, reconnecting tunnel");
                        self.tunnel.connect()?;
                    }
                    Ok(_) => warn!("Token refresh returned an empty token"),
                    Err(e) => warn!(error = %e, "Token refresh failed"),
                }
            }
            TunnelEvent::RequestFinished { id, outcome } => {
                debug!(%id, ?outcome, "Relayed request finished");
            }
        }
        Ok(())
    }

    /// Returns `true` when the run should end.
    async fn on_ipc_message(
        &self,
        client: ClientId,
        message: IpcMessage,
    ) -> Result<bool, CoordinatorError> {
        let kind = message.kind;
        match kind {
            kind if kind.is_window_control() => {
                let relayed = self.ipc.broadcast_except(client, &message).await;
                info!(%client, %kind, relayed, "Relayed window signal");
                self.ipc.send_to_client(client, &IpcMessage::ack(kind)).await;
            }
            IpcKind::Quit => {
                let relayed = self.ipc.broadcast_except(client, &message).await;
                info!(%client, relayed, "Quit requested");
                return Ok(true);
            }
            IpcKind::StatusRequest | IpcKind::Register => {
                self.ipc.send_to_client(client, &self.status_message()).await;
            }
            IpcKind::ConnectTunnel => {
                info!(%client, "Tunnel connect requested");
                self.tunnel.connect()?;
                self.ipc.send_to_client(client, &IpcMessage::ack(kind)).await;
            }
            IpcKind::DisconnectTunnel => {
                info!(%client, "Tunnel disconnect requested");
                self.tunnel.stop()?;
                self.ipc.send_to_client(client, &IpcMessage::ack(kind)).await;
            }
            _ => debug!(%client, %kind, "Ignoring IPC message"),
        }
        Ok(false)
    }
}
