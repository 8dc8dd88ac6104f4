//! IPC server — multi-client TCP listener with newline-delimited JSON.
//!
//! Every accepted connection gets a [`ClientId`] and its own read loop.
//! `ping` is answered on the spot; everything else is queued on a bounded
//! inbound channel tagged with the sender. A full queue pauses the read
//! loops rather than dropping messages. Writes go through a per-client
//! lock, so messages to one client keep their order.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use llmlink_config::IpcConfig;

use super::{IpcError, flag_reached};
use super::frame::{Frame, read_frame};
use crate::codec::{IpcKind, IpcMessage, MAX_IPC_FRAME_BYTES, decode_ipc, encode_ipc};

/// A write that takes longer than this counts as failed.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound messages queued before client reads pause.
pub const INBOUND_CAPACITY: usize = 256;

/// Server-assigned identity of a connected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A message received from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub client: ClientId,
    pub message: IpcMessage,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub role: Option<String>,
    /// Time since the client last sent anything.
    pub idle: Duration,
}

/// Optional server behaviour.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Evict clients silent for longer than this.
    pub liveness_window: Option<Duration>,
    /// Publish the bound port here; removed on stop.
    pub port_file: Option<PathBuf>,
}

impl ServerOptions {
    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            liveness_window: config.liveness_window(),
            port_file: config.port_file.clone(),
        }
    }
}

struct Connection {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl Connection {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        tokio::time::timeout(WRITE_TIMEOUT, write)
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                ))
            })
    }

    /// Stops the read loop. The socket closes once the last writer
    /// reference is gone.
    fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct ClientEntry {
    conn: Arc<Connection>,
    last_seen: Instant,
    role: Option<String>,
}

struct Shared {
    registry: Mutex<HashMap<ClientId, ClientEntry>>,
    inbound: mpsc::Sender<InboundMessage>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Shared {
    fn new(inbound: mpsc::Sender<InboundMessage>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Mutex::new(HashMap::new()),
            inbound,
            next_id: AtomicU64::new(0),
            shutdown,
            stopped: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (read_half, write_half) = stream.into_split();
        let (closed, closed_rx) = watch::channel(false);
        let conn = Arc::new(Connection {
            peer,
            writer: tokio::sync::Mutex::new(write_half),
            closed,
        });
        self.registry().insert(
            id,
            ClientEntry {
                conn,
                last_seen: Instant::now(),
                role: None,
            },
        );
        info!(client = %id, %peer, "IPC client connected");
        tokio::spawn(read_loop(self.clone(), id, read_half, closed_rx));
    }

    fn touch(&self, id: ClientId) {
        if let Some(entry) = self.registry().get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    fn connection(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.registry().get(&id).map(|entry| entry.conn.clone())
    }

    fn evict(&self, id: ClientId, reason: &str) {
        let removed = self.registry().remove(&id);
        if let Some(entry) = removed {
            entry.conn.close();
            info!(client = %id, peer = %entry.conn.peer, reason, "IPC client removed");
        }
    }

    async fn send_to(&self, id: ClientId, message: &IpcMessage) -> bool {
        let Some(conn) = self.connection(id) else {
            return false;
        };
        let line = match encode_ipc(message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode IPC message");
                return false;
            }
        };
        match conn.write_line(&line).await {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %id, error = %e, "IPC write failed");
                self.evict(id, "write failed");
                false
            }
        }
    }

    async fn broadcast(&self, message: &IpcMessage, exclude: Option<ClientId>) -> usize {
        let line = match encode_ipc(message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode IPC broadcast");
                return 0;
            }
        };
        let targets: Vec<(ClientId, Arc<Connection>)> = self
            .registry()
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, entry)| (*id, entry.conn.clone()))
            .collect();

        let results = join_all(targets.iter().map(|(id, conn)| {
            let line = line.as_str();
            async move { (*id, conn.write_line(line).await) }
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client = %id, error = %e, "IPC broadcast write failed");
                    self.evict(id, "write failed");
                }
            }
        }
        debug!(kind = %message.kind, delivered, "IPC broadcast");
        delivered
    }

    async fn dispatch(&self, id: ClientId, message: IpcMessage) {
        match message.kind {
            IpcKind::Ping => {
                self.send_to(id, &IpcMessage::pong()).await;
                return;
            }
            IpcKind::Register => {
                if let Some(role) = message.payload_str("role")
                    && let Some(entry) = self.registry().get_mut(&id)
                {
                    info!(client = %id, role, "IPC client registered");
                    entry.role = Some(role.to_string());
                }
            }
            _ => {}
        }
        let inbound = InboundMessage {
            client: id,
            message,
        };
        if self.inbound.send(inbound).await.is_err() {
            debug!(client = %id, "Inbound receiver gone, dropping IPC message");
        }
    }

    fn close_all(&self) {
        let entries: Vec<ClientEntry> = self.registry().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.conn.close();
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    id: ClientId,
    read_half: OwnedReadHalf,
    mut closed: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = tokio::select! {
            _ = flag_reached(&mut closed, true) => return,
            frame = read_frame(&mut reader, MAX_IPC_FRAME_BYTES) => frame,
        };
        match frame {
            Ok(Frame::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                shared.touch(id);
                match decode_ipc(&line) {
                    Ok(message) => tokio::select! {
                        _ = flag_reached(&mut closed, true) => return,
                        _ = shared.dispatch(id, message) => {}
                    },
                    Err(e) => warn!(client = %id, error = %e, "Dropping invalid IPC message"),
                }
            }
            Ok(Frame::TooLarge(size)) => {
                shared.touch(id);
                warn!(client = %id, size, "Dropping oversized IPC frame");
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                debug!(client = %id, error = %e, "IPC read failed");
                break;
            }
        }
    }
    shared.evict(id, "connection closed");
}

/// The IPC server. Dropping it stops it.
pub struct IpcServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    port_file: Option<PathBuf>,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcServer {
    /// Bind `host:port` (port `0` picks a free port) and start accepting.
    pub async fn start(host: &str, port: u16, options: ServerOptions) -> Result<Self, IpcError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| IpcError::from_bind(&addr, e))?;
        let local_addr = listener.local_addr()?;

        if let Some(path) = &options.port_file {
            write_port_file(path, local_addr.port()).await?;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let shared = Arc::new(Shared::new(inbound_tx));

        let mut tasks = vec![tokio::spawn(accept_loop(shared.clone(), listener))];
        if let Some(window) = options.liveness_window {
            tasks.push(tokio::spawn(liveness_sweep(shared.clone(), window)));
        }

        info!(addr = %local_addr, "IPC server listening");
        Ok(Self {
            shared,
            local_addr,
            port_file: options.port_file,
            inbound: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the receiver of inbound messages from all clients (everything
    /// except `ping`). There is one receiver; later calls return `None`.
    ///
    /// Messages queue up to [`INBOUND_CAPACITY`] until it is taken and
    /// drained, after which client reads wait for room.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        match self.inbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Send to every registered client. Returns how many writes succeeded;
    /// clients whose write failed are evicted.
    pub async fn broadcast(&self, message: &IpcMessage) -> usize {
        self.shared.broadcast(message, None).await
    }

    /// Like [`broadcast`](Self::broadcast), skipping `sender`.
    pub async fn broadcast_except(&self, sender: ClientId, message: &IpcMessage) -> usize {
        self.shared.broadcast(message, Some(sender)).await
    }

    /// Send to one client. `false` for unknown ids and failed writes.
    pub async fn send_to_client(&self, id: ClientId, message: &IpcMessage) -> bool {
        self.shared.send_to(id, message).await
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .shared
            .registry()
            .iter()
            .map(|(id, entry)| ClientInfo {
                id: *id,
                peer: entry.conn.peer,
                role: entry.role.clone(),
                idle: entry.last_seen.elapsed(),
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Close the listener and every client, and clear the registry. Idempotent.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.close_all();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            let _ = task.await;
        }

        if let Some(path) = &self.port_file
            && let Err(e) = tokio::fs::remove_file(path).await
        {
            debug!(path = %path.display(), error = %e, "Could not remove port file");
        }
        info!(addr = %self.local_addr, "IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.close_all();
        if let Some(path) = &self.port_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = flag_reached(&mut shutdown, true) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.register(stream, peer),
                Err(e) => {
                    warn!(error = %e, "IPC accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("IPC accept loop exited");
}

async fn liveness_sweep(shared: Arc<Shared>, window: Duration) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval((window / 2).max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = flag_reached(&mut shutdown, true) => break,
            _ = ticker.tick() => {
                let stale: Vec<ClientId> = shared
                    .registry()
                    .iter()
                    .filter(|(_, entry)| entry.last_seen.elapsed() > window)
                    .map(|(id, _)| *id)
                    .collect();
                for id in stale {
                    shared.evict(id, "liveness window exceeded");
                }
            }
        }
    }
}

async fn write_port_file(path: &std::path::Path, port: u16) -> Result<(), IpcError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{port}\n")).await?;
    debug!(path = %path.display(), port, "Wrote IPC port file");
    Ok(())
}
