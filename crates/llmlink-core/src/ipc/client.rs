//! IPC client used by helper processes (tray, settings window, CLI).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use llmlink_config::IpcConfig;

use super::{IpcError, flag_reached};
use super::frame::{Frame, read_frame};
use crate::codec::{IpcKind, IpcMessage, MAX_IPC_FRAME_BYTES, decode_ipc, encode_ipc};

/// Client behaviour knobs.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Retry a lost or failed connection at this fixed interval.
    pub reconnect_interval: Option<Duration>,
    /// Send `ping` at this interval while connected.
    pub ping_interval: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Some(Duration::from_secs(1)),
            ping_interval: Some(Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            reconnect_interval: Some(config.client_reconnect_interval()),
            ping_interval: config.client_ping_interval(),
            ..Self::default()
        }
    }

    /// One connection attempt, no pings.
    pub fn one_shot() -> Self {
        Self {
            reconnect_interval: None,
            ping_interval: None,
            ..Self::default()
        }
    }
}

/// Read a port file written by [`IpcServer`](super::IpcServer).
pub async fn discover_port(path: &Path) -> Result<u16, IpcError> {
    let port_file = |reason: String| IpcError::PortFile {
        path: path.to_path_buf(),
        reason,
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| port_file(e.to_string()))?;
    let port: u16 = content
        .trim()
        .parse()
        .map_err(|_| port_file(format!("not a port number: {:?}", content.trim())))?;
    if port == 0 {
        return Err(port_file("port 0 is not connectable".to_string()));
    }
    Ok(port)
}

struct Shared {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: watch::Sender<bool>,
    incoming: mpsc::UnboundedSender<IpcMessage>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shared {
    async fn attach(&self, write_half: OwnedWriteHalf) {
        *self.writer.lock().await = Some(write_half);
        self.connected.send_replace(true);
    }

    async fn detach(&self) {
        self.connected.send_replace(false);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write(&self, message: &IpcMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let line = match encode_ipc(message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode IPC message");
                return false;
            }
        };
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "IPC client write failed");
                guard.take();
                self.connected.send_replace(false);
                false
            }
        }
    }
}

/// Connection to a local [`IpcServer`](super::IpcServer).
///
/// A background supervisor reads frames, answers the server's liveness
/// expectations with periodic pings and, when enabled, reconnects after the
/// socket drops.
pub struct IpcClient {
    options: ClientOptions,
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<IpcMessage>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl IpcClient {
    pub fn new(options: ClientOptions) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            options,
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(None),
                connected,
                incoming: incoming_tx,
                shutdown,
                closed: AtomicBool::new(false),
            }),
            incoming: tokio::sync::Mutex::new(incoming_rx),
            supervisor: Mutex::new(None),
        }
    }

    /// Connect to `host:port`. Returns whether the first attempt succeeded;
    /// with reconnect enabled a failed attempt keeps retrying in the background.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        self.stop_supervisor();
        self.shared.detach().await;
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.shutdown.send_replace(false);

        let addr = format!("{host}:{port}");
        let read_half = match dial(&addr, self.options.connect_timeout).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.shared.attach(write_half).await;
                info!(%addr, "IPC client connected");
                Some(read_half)
            }
            Err(reason) => {
                warn!(%addr, %reason, "IPC connect failed");
                if self.options.reconnect_interval.is_none() {
                    return false;
                }
                None
            }
        };

        let connected = read_half.is_some();
        let handle = tokio::spawn(supervise(
            self.shared.clone(),
            self.options.clone(),
            addr,
            read_half,
        ));
        match self.supervisor.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        connected
    }

    /// Send one message. `false` when not connected or the write failed.
    pub async fn send(&self, message: &IpcMessage) -> bool {
        self.shared.write(message).await
    }

    /// Next message from the server. Returns `None` once the connection is
    /// down and everything received before that has been handed out; call
    /// again after a reconnect to resume.
    pub async fn next_message(&self) -> Option<IpcMessage> {
        let mut rx = self.incoming.lock().await;
        if let Ok(message) = rx.try_recv() {
            return Some(message);
        }
        let mut connected = self.shared.connected.subscribe();
        if !*connected.borrow_and_update() {
            return None;
        }
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = flag_reached(&mut connected, false) => rx.try_recv().ok(),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Wait until connected. `false` if `timeout` elapses first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.shared.connected.subscribe();
        let reached = tokio::time::timeout(timeout, flag_reached(&mut connected, true))
            .await
            .is_ok();
        reached && *connected.borrow()
    }

    /// Close the socket and cancel any pending reconnect.
    ///
    /// The socket closes right away unless a `send` is mid-write; then the
    /// supervisor closes it as soon as that write finishes.
    pub fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.send_replace(true);
        self.shared.connected.send_replace(false);
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
    }

    fn stop_supervisor(&self) {
        let handle = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, String> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    }
}

enum ReadEnd {
    Closed,
    Shutdown,
}

/// Owns the read half; reconnects while the client is alive.
async fn supervise(
    shared: Arc<Shared>,
    options: ClientOptions,
    addr: String,
    mut read_half: Option<OwnedReadHalf>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let reader = match read_half.take() {
            Some(reader) => reader,
            None => {
                let Some(interval) = options.reconnect_interval else {
                    break;
                };
                tokio::select! {
                    _ = flag_reached(&mut shutdown, true) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match dial(&addr, options.connect_timeout).await {
                    Ok(_) if *shutdown.borrow() => break,
                    Ok(stream) => {
                        let (reader, writer) = stream.into_split();
                        shared.attach(writer).await;
                        info!(%addr, "IPC client reconnected");
                        reader
                    }
                    Err(reason) => {
                        debug!(%addr, %reason, "IPC reconnect attempt failed");
                        continue;
                    }
                }
            }
        };

        let end = read_loop(&shared, reader, options.ping_interval, &mut shutdown).await;
        shared.detach().await;
        match end {
            ReadEnd::Shutdown => break,
            ReadEnd::Closed => info!(%addr, "IPC connection closed"),
        }
    }
    shared.detach().await;
}

async fn read_loop(
    shared: &Shared,
    reader: OwnedReadHalf,
    ping_interval: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadEnd {
    let mut reader = BufReader::new(reader);
    let mut ticker = ping_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        let ping_due = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = flag_reached(shutdown, true) => return ReadEnd::Shutdown,
            _ = ping_due => {
                if !shared.write(&IpcMessage::ping()).await {
                    return ReadEnd::Closed;
                }
            }
            frame = read_frame(&mut reader, MAX_IPC_FRAME_BYTES) => match frame {
                Ok(Frame::Line(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_ipc(&line) {
                        Ok(message) if message.kind == IpcKind::Pong => {}
                        Ok(message) => {
                            let _ = shared.incoming.send(message);
                        }
                        Err(e) => warn!(error = %e, "Dropping invalid IPC message"),
                    }
                }
                Ok(Frame::TooLarge(size)) => warn!(size, "Dropping oversized IPC frame"),
                Ok(Frame::Eof) => return ReadEnd::Closed,
                Err(e) => {
                    debug!(error = %e, "IPC client read failed");
                    return ReadEnd::Closed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::future::Future;

    fn require_send<F: Future + Send>(future: F) -> F {
        future
    }

    #[tokio::test]
    async fn test_client_futures_are_send() {
        let client = IpcClient::new(ClientOptions::one_shot());
        drop(require_send(supervise(
            client.shared.clone(),
            ClientOptions::one_shot(),
            "127.0.0.1:1".to_string(),
            None,
        )));
        drop(require_send(client.next_message()));
        drop(require_send(client.wait_connected(Duration::from_millis(1))));
    }

    #[tokio::test]
    async fn test_discover_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc_port");

        tokio::fs::write(&path, "8183\n").await.unwrap();
        assert_eq!(discover_port(&path).await.unwrap(), 8183);

        tokio::fs::write(&path, "not-a-port").await.unwrap();
        assert!(matches!(
            discover_port(&path).await,
            Err(IpcError::PortFile { .. })
        ));

        let missing = dir.path().join("missing");
        assert!(matches!(
            discover_port(&missing).await,
            Err(IpcError::PortFile { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_returns_false() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = IpcClient::new(ClientOptions::one_shot());
        assert!(!client.connect("127.0.0.1", port).await);
        assert!(!client.is_connected());
        assert!(!client.send(&IpcMessage::ping()).await);
        assert_eq!(client.next_message().await, None);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = IpcConfig::default();
        let options = ClientOptions::from_config(&config);
        assert_eq!(options.reconnect_interval, Some(Duration::from_millis(1000)));
        assert_eq!(options.ping_interval, Some(Duration::from_secs(10)));
    }
}
