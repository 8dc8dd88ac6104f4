//! Coordinator routing between IPC clients and the tunnel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use llmlink_core::codec::{IpcKind, IpcMessage};
use llmlink_core::inference::HttpInferenceAdapter;
use llmlink_core::ipc::{ClientOptions, IpcClient, IpcServer, ServerOptions};
use llmlink_core::token::{BearerToken, StaticTokenSource, TokenError, TokenSource};
use llmlink_core::tunnel::{ConnectionState, TunnelClient, TunnelEvent};
use llmlink_core::{BoxFuture, Coordinator, CoordinatorError, StopReason};
use llmlink_test_utils::config::fast_tunnel_settings;
use llmlink_test_utils::{AuthMode, FakeInference, FakeRelay};

/// Counts refreshes; every token it hands out is the same.
struct CountingTokens {
    refreshes: AtomicU32,
}

impl TokenSource for CountingTokens {
    fn token(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        Box::pin(async { Ok(BearerToken::new("stale")) })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<BearerToken, TokenError>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(BearerToken::new("fresh")) })
    }
}

struct Harness {
    ipc: Arc<IpcServer>,
    tunnel: Arc<TunnelClient>,
    stop: Option<oneshot::Sender<()>>,
    run: JoinHandle<Result<StopReason, CoordinatorError>>,
    _relay: FakeRelay,
    _inference: FakeInference,
}

impl Harness {
    async fn start(mode: AuthMode, tokens: Arc<dyn TokenSource>) -> Self {
        let relay = FakeRelay::start(mode).await;
        let inference = FakeInference::start().await;
        let ipc = Arc::new(
            IpcServer::start("127.0.0.1", 0, ServerOptions::default())
                .await
                .unwrap(),
        );
        let adapter =
            HttpInferenceAdapter::new(&inference.base_url(), Duration::from_secs(5)).unwrap();
        let tunnel = Arc::new(TunnelClient::spawn(
            fast_tunnel_settings(&relay.url()),
            tokens.clone(),
            Arc::new(adapter),
        ));

        let coordinator = Coordinator::new(ipc.clone(), tunnel.clone(), tokens);
        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            coordinator
                .run(async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            ipc,
            tunnel,
            stop: Some(stop),
            run,
            _relay: relay,
            _inference: inference,
        }
    }

    async fn client(&self) -> IpcClient {
        let client = IpcClient::new(ClientOptions::one_shot());
        assert!(client.connect("127.0.0.1", self.ipc.port()).await);
        client
    }

    async fn wait_for_clients(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.ipc.client_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn finish(mut self) -> StopReason {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let reason = (&mut self.run).await.unwrap().unwrap();
        self.tunnel.shutdown().await;
        self.ipc.stop().await;
        reason
    }
}

fn static_tokens() -> Arc<dyn TokenSource> {
    Arc::new(StaticTokenSource::new("secret-token"))
}

async fn next(client: &IpcClient) -> IpcMessage {
    tokio::time::timeout(Duration::from_secs(5), client.next_message())
        .await
        .expect("no message within 5s")
        .expect("connection closed")
}

/// Next `connection_status` whose state is `state`.
async fn wait_for_status(client: &IpcClient, state: &str) -> IpcMessage {
    loop {
        let message = next(client).await;
        if message.kind == IpcKind::ConnectionStatus && message.payload_str("state") == Some(state)
        {
            return message;
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_window_signal_relayed_to_others_and_acked() {
    let harness = Harness::start(AuthMode::Accept, static_tokens()).await;
    let a = harness.client().await;
    let b = harness.client().await;
    let c = harness.client().await;
    harness.wait_for_clients(3).await;

    assert!(a.send(&IpcMessage::new(IpcKind::ShowWindow)).await);

    assert_eq!(next(&b).await, IpcMessage::new(IpcKind::ShowWindow));
    assert_eq!(next(&c).await, IpcMessage::new(IpcKind::ShowWindow));
    assert_eq!(next(&a).await, IpcMessage::ack(IpcKind::ShowWindow));

    assert_eq!(harness.finish().await, StopReason::Shutdown);
}

#[test_log::test(tokio::test)]
async fn test_status_request_answered_with_current_state() {
    let harness = Harness::start(AuthMode::Accept, static_tokens()).await;
    let a = harness.client().await;

    assert!(a.send(&IpcMessage::new(IpcKind::StatusRequest)).await);
    let reply = next(&a).await;
    assert_eq!(reply, IpcMessage::connection_status("disconnected", None));

    harness.finish().await;
}

#[test_log::test(tokio::test)]
async fn test_connect_tunnel_broadcasts_state_changes() {
    let harness = Harness::start(AuthMode::Accept, static_tokens()).await;
    let tray = harness.client().await;
    let ui = harness.client().await;
    harness.wait_for_clients(2).await;

    assert!(tray.send(&IpcMessage::new(IpcKind::ConnectTunnel)).await);

    wait_for_status(&ui, "connecting").await;
    wait_for_status(&ui, "connected").await;
    wait_for_status(&tray, "connected").await;
    assert_eq!(harness.tunnel.state(), ConnectionState::Connected);

    assert!(ui.send(&IpcMessage::new(IpcKind::DisconnectTunnel)).await);
    wait_for_status(&tray, "disconnected").await;

    harness.finish().await;
}

#[test_log::test(tokio::test)]
async fn test_quit_is_relayed_and_ends_run() {
    let harness = Harness::start(AuthMode::Accept, static_tokens()).await;
    let a = harness.client().await;
    let b = harness.client().await;
    harness.wait_for_clients(2).await;

    assert!(a.send(&IpcMessage::new(IpcKind::Quit)).await);
    assert_eq!(next(&b).await, IpcMessage::new(IpcKind::Quit));

    let reason = tokio::time::timeout(Duration::from_secs(5), harness.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::Quit);
    harness.tunnel.shutdown().await;
    harness.ipc.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_auth_rejection_refreshes_token_once_per_streak() {
    let tokens = Arc::new(CountingTokens {
        refreshes: AtomicU32::new(0),
    });
    let harness = Harness::start(AuthMode::RejectAck("expired".to_string()), tokens.clone()).await;
    let ui = harness.client().await;
    harness.wait_for_clients(1).await;
    let mut events = harness.tunnel.subscribe();

    harness.tunnel.connect().unwrap();

    // First rejection triggers a refresh and a reconnect, the second does not.
    let mut rejections = 0;
    while rejections < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if let TunnelEvent::AuthRejected { .. } = event {
            rejections += 1;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.tunnel.state(), ConnectionState::Error);

    // The plain state change comes first, then the status carrying the reason.
    let detail = loop {
        let status = wait_for_status(&ui, "error").await;
        if let Some(detail) = status.payload_str("detail") {
            break detail.to_string();
        }
    };
    assert!(detail.contains("expired"), "{detail}");

    harness.finish().await;
}

#[test_log::test(tokio::test)]
async fn test_run_needs_the_inbound_receiver() {
    let relay = FakeRelay::start(AuthMode::Accept).await;
    let inference = FakeInference::start().await;
    let ipc = Arc::new(
        IpcServer::start("127.0.0.1", 0, ServerOptions::default())
            .await
            .unwrap(),
    );
    let _taken = ipc.take_inbound().unwrap();
    let adapter =
        HttpInferenceAdapter::new(&inference.base_url(), Duration::from_secs(5)).unwrap();
    let tokens = static_tokens();
    let tunnel = Arc::new(TunnelClient::spawn(
        fast_tunnel_settings(&relay.url()),
        tokens.clone(),
        Arc::new(adapter),
    ));

    let coordinator = Coordinator::new(ipc.clone(), tunnel.clone(), tokens);
    let result = coordinator.run(std::future::pending()).await;
    assert!(matches!(result, Err(CoordinatorError::InboundTaken)));

    tunnel.shutdown().await;
    ipc.stop().await;
}
