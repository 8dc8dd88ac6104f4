//! IPC server and client over loopback TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use llmlink_core::codec::{IpcKind, IpcMessage};
use llmlink_core::ipc::server::INBOUND_CAPACITY;
use llmlink_core::ipc::{ClientOptions, IpcClient, IpcError, IpcServer, ServerOptions};

async fn start() -> IpcServer {
    IpcServer::start("127.0.0.1", 0, ServerOptions::default())
        .await
        .unwrap()
}

async fn client(server: &IpcServer) -> IpcClient {
    let client = IpcClient::new(ClientOptions::one_shot());
    assert!(client.connect("127.0.0.1", server.port()).await);
    client
}

async fn wait_for_clients(server: &IpcServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.client_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {count} clients, have {}",
            server.client_count()
        )
    });
}

async fn next(client: &IpcClient) -> Option<IpcMessage> {
    tokio::time::timeout(Duration::from_secs(2), client.next_message())
        .await
        .ok()
        .flatten()
}

#[test_log::test(tokio::test)]
async fn test_broadcast_reaches_every_client() {
    let server = start().await;
    let a = client(&server).await;
    let b = client(&server).await;
    let c = client(&server).await;
    wait_for_clients(&server, 3).await;

    let show = IpcMessage::new(IpcKind::ShowWindow);
    assert_eq!(server.broadcast(&show).await, 3);
    for client in [&a, &b, &c] {
        assert_eq!(next(client).await, Some(show.clone()));
    }
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_broadcast_except_skips_sender() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();
    let a = client(&server).await;
    let b = client(&server).await;
    let c = client(&server).await;
    wait_for_clients(&server, 3).await;

    assert!(a.send(&IpcMessage::new(IpcKind::ShowWindow)).await);
    let received = inbound.recv().await.unwrap();
    assert_eq!(received.message.kind, IpcKind::ShowWindow);

    let relayed = server
        .broadcast_except(received.client, &received.message)
        .await;
    assert_eq!(relayed, 2);
    assert_eq!(next(&b).await.map(|m| m.kind), Some(IpcKind::ShowWindow));
    assert_eq!(next(&c).await.map(|m| m.kind), Some(IpcKind::ShowWindow));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), a.next_message())
            .await
            .is_err(),
        "sender received its own signal"
    );
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_broadcast_survives_one_failing_client() {
    let server = start().await;
    // Nobody drains the inbound queue, so a client that sends once the
    // queue is full stops being read while it stays registered.
    let _inbound = server.take_inbound().unwrap();

    let mut filler = TcpStream::connect(server.local_addr()).await.unwrap();
    let burst = "{\"type\":\"hide_window\"}\n".repeat(INBOUND_CAPACITY + 1);
    filler.write_all(burst.as_bytes()).await.unwrap();

    let a = client(&server).await;
    let b = client(&server).await;
    let mut failing = TcpStream::connect(server.local_addr()).await.unwrap();
    failing.write_all(b"{\"type\":\"show_window\"}\n").await.unwrap();
    wait_for_clients(&server, 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reset the connection so the next server write to it fails.
    #[allow(deprecated)]
    failing.set_linger(Some(Duration::ZERO)).unwrap();
    drop(failing);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = IpcMessage::connection_status("connected", None);
    assert_eq!(server.broadcast(&status).await, 3);
    assert_eq!(next(&a).await, Some(status.clone()));
    assert_eq!(next(&b).await, Some(status));
    assert_eq!(server.client_count(), 3);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_slow_consumer_loses_no_messages() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();
    let a = client(&server).await;

    let total = INBOUND_CAPACITY * 2;
    for _ in 0..total {
        assert!(a.send(&IpcMessage::new(IpcKind::HideWindow)).await);
    }
    assert!(a.send(&IpcMessage::new(IpcKind::Quit)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    for _ in 0..total {
        let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.kind, IpcKind::HideWindow);
    }
    let last = inbound.recv().await.unwrap();
    assert_eq!(last.message.kind, IpcKind::Quit);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_register_records_role() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();
    let tray = client(&server).await;
    assert!(tray.send(&IpcMessage::register("tray")).await);

    let received = inbound.recv().await.unwrap();
    assert_eq!(received.message.kind, IpcKind::Register);
    let clients = server.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].id, received.client);
    assert_eq!(clients[0].role.as_deref(), Some("tray"));
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_send_to_client_after_disconnect_returns_false() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();
    let a = client(&server).await;
    assert!(a.send(&IpcMessage::register("ui")).await);
    let id = inbound.recv().await.unwrap().client;

    assert!(server.send_to_client(id, &IpcMessage::pong()).await);

    a.disconnect();
    wait_for_clients(&server, 0).await;
    assert!(!server.send_to_client(id, &IpcMessage::pong()).await);
    assert_eq!(server.broadcast(&IpcMessage::new(IpcKind::Quit)).await, 0);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_ping_answered_internally_and_not_published() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
    assert_eq!(
        lines.next_line().await.unwrap().as_deref(),
        Some(r#"{"type":"pong"}"#)
    );

    write.write_all(b"{\"type\":\"hide_window\"}\n").await.unwrap();
    let received = inbound.recv().await.unwrap();
    assert_eq!(received.message.kind, IpcKind::HideWindow);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_bad_frames_dropped_connection_kept() {
    let server = start().await;
    let mut inbound = server.take_inbound().unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let mut oversized = vec![b'x'; 70 * 1024];
    oversized.push(b'\n');
    stream.write_all(&oversized).await.unwrap();
    stream.write_all(b"{not json\n").await.unwrap();
    stream.write_all(b"{\"type\":\"self_destruct\"}\n").await.unwrap();
    stream.write_all(b"{\"type\":\"open_settings\"}\n").await.unwrap();

    let received = inbound.recv().await.unwrap();
    assert_eq!(received.message.kind, IpcKind::OpenSettings);
    assert_eq!(server.client_count(), 1);
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_liveness_sweep_evicts_silent_clients() {
    let options = ServerOptions {
        liveness_window: Some(Duration::from_millis(200)),
        port_file: None,
    };
    let server = IpcServer::start("127.0.0.1", 0, options).await.unwrap();

    let mut silent = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_for_clients(&server, 1).await;
    wait_for_clients(&server, 0).await;

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), silent.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0, "evicted socket should be closed");
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_client_pings_keep_it_alive() {
    let options = ServerOptions {
        liveness_window: Some(Duration::from_millis(300)),
        port_file: None,
    };
    let server = IpcServer::start("127.0.0.1", 0, options).await.unwrap();

    let client = IpcClient::new(ClientOptions {
        reconnect_interval: None,
        ping_interval: Some(Duration::from_millis(100)),
        connect_timeout: Duration::from_secs(1),
    });
    assert!(client.connect("127.0.0.1", server.port()).await);
    wait_for_clients(&server, 1).await;

    // Pongs are consumed by the client, never surfaced.
    assert!(
        tokio::time::timeout(Duration::from_millis(800), client.next_message())
            .await
            .is_err()
    );
    assert_eq!(server.client_count(), 1);
    assert!(client.is_connected());
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_stop_is_idempotent_and_removes_port_file() {
    let dir = tempfile::tempdir().unwrap();
    let port_file = dir.path().join("run").join("ipc_port");
    let options = ServerOptions {
        liveness_window: None,
        port_file: Some(port_file.clone()),
    };
    let server = IpcServer::start("127.0.0.1", 0, options).await.unwrap();

    let published = llmlink_core::ipc::discover_port(&port_file).await.unwrap();
    assert_eq!(published, server.port());

    let a = client(&server).await;
    wait_for_clients(&server, 1).await;

    server.stop().await;
    server.stop().await;
    assert!(server.is_stopped());
    assert_eq!(server.client_count(), 0);
    assert!(!port_file.exists());

    assert_eq!(next(&a).await, None);
    assert!(TcpStream::connect(server.local_addr()).await.is_err());
}

#[test_log::test(tokio::test)]
async fn test_port_in_use_is_reported() {
    let first = start().await;
    let err = IpcServer::start("127.0.0.1", first.port(), ServerOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IpcError::AddressInUse(_)), "got {err:?}");
    first.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_client_reconnects_after_server_restart() {
    let server = start().await;
    let port = server.port();

    let client = IpcClient::new(ClientOptions {
        reconnect_interval: Some(Duration::from_millis(50)),
        ping_interval: None,
        connect_timeout: Duration::from_secs(1),
    });
    assert!(client.connect("127.0.0.1", port).await);
    wait_for_clients(&server, 1).await;

    server.stop().await;
    assert_eq!(next(&client).await, None);
    assert!(!client.is_connected());

    let restarted = IpcServer::start("127.0.0.1", port, ServerOptions::default())
        .await
        .unwrap();
    assert!(client.wait_connected(Duration::from_secs(3)).await);
    wait_for_clients(&restarted, 1).await;

    let status = IpcMessage::connection_status("connected", None);
    assert_eq!(restarted.broadcast(&status).await, 1);
    assert_eq!(next(&client).await, Some(status));

    client.disconnect();
    restarted.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_client_started_before_server_connects_later() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = IpcClient::new(ClientOptions {
        reconnect_interval: Some(Duration::from_millis(50)),
        ping_interval: None,
        connect_timeout: Duration::from_secs(1),
    });
    assert!(!client.connect("127.0.0.1", port).await);

    let server = IpcServer::start("127.0.0.1", port, ServerOptions::default())
        .await
        .unwrap();
    assert!(client.wait_connected(Duration::from_secs(3)).await);
    wait_for_clients(&server, 1).await;
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_disconnect_during_blocked_send_still_closes_socket() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Arc::new(IpcClient::new(ClientOptions::one_shot()));
    assert!(client.connect("127.0.0.1", port).await);
    let (mut peer, _) = listener.accept().await.unwrap();

    // The peer never reads, so the socket buffers fill and a send blocks
    // while holding the writer.
    let sent = Arc::new(AtomicUsize::new(0));
    let sender = {
        let client = client.clone();
        let sent = sent.clone();
        tokio::spawn(async move {
            let big = IpcMessage::register(&"r".repeat(32 * 1024));
            while client.send(&big).await {
                sent.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let mut last = usize::MAX;
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let now = sent.load(Ordering::SeqCst);
        if now == last {
            break;
        }
        last = now;
    }

    client.disconnect();
    assert!(!client.is_connected());

    let mut drained = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut drained))
        .await
        .expect("socket still open after disconnect")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), sender)
        .await
        .unwrap()
        .unwrap();
}
