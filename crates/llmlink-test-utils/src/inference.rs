//! Fake Ollama-style inference server for relay tests.
//!
//! Routes:
//!
//! | Route                | Behaviour                                           |
//! |----------------------|-----------------------------------------------------|
//! | `POST /api/generate` | JSON reply; NDJSON (3 lines) when `"stream": true`  |
//! | `POST /api/chat`     | always NDJSON (2 lines)                             |
//! | `POST /api/slow`     | replies after 10 s                                  |
//! | `POST /api/fail`     | `500 model exploded`                                |
//! | `GET /api/version`   | `{"version": "0.5.7"}`                              |
//! | `GET /api/tags`      | two models                                          |

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Version reported by `/api/version`.
pub const FAKE_VERSION: &str = "0.5.7";

/// Models reported by `/api/tags`.
pub const FAKE_MODELS: [&str; 2] = ["llama3:8b", "qwen2.5:7b"];

#[derive(Default)]
struct Recorded {
    requests: Mutex<Vec<(String, Value)>>,
}

impl Recorded {
    fn push(&self, path: &str, body: Value) {
        self.requests
            .lock()
            .expect("recorder lock")
            .push((path.to_string(), body));
    }
}

/// A loopback inference server.
pub struct FakeInference {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    task: JoinHandle<()>,
}

impl FakeInference {
    pub async fn start() -> Self {
        let recorded = Arc::new(Recorded::default());
        let app = axum::Router::new()
            .route("/api/generate", post(handle_generate))
            .route("/api/chat", post(handle_chat))
            .route("/api/slow", post(handle_slow))
            .route("/api/fail", post(handle_fail))
            .route("/api/version", get(handle_version))
            .route("/api/tags", get(handle_tags))
            .with_state(recorded.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake inference server");
        let addr = listener.local_addr().expect("no local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            recorded,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// `(path, body)` of every POST received so far.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.recorded.requests.lock().expect("recorder lock").clone()
    }
}

impl Drop for FakeInference {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn ndjson(lines: &[Value]) -> Response {
    let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_generate(State(recorded): State<Arc<Recorded>>, Json(body): Json<Value>) -> Response {
    recorded.push("/api/generate", body.clone());
    let model = body.get("model").cloned().unwrap_or(Value::Null);
    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        return ndjson(&[
            json!({"model": model, "response": "Hel", "done": false}),
            json!({"model": model, "response": "lo", "done": false}),
            json!({"model": model, "response": "", "done": true}),
        ]);
    }
    Json(json!({"model": model, "response": "Hello", "done": true})).into_response()
}

async fn handle_chat(State(recorded): State<Arc<Recorded>>, Json(body): Json<Value>) -> Response {
    recorded.push("/api/chat", body);
    ndjson(&[
        json!({"message": {"role": "assistant", "content": "Hi"}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true}),
    ])
}

async fn handle_slow(State(recorded): State<Arc<Recorded>>, Json(body): Json<Value>) -> Response {
    recorded.push("/api/slow", body);
    tokio::time::sleep(Duration::from_secs(10)).await;
    Json(json!({"done": true})).into_response()
}

async fn handle_fail(State(recorded): State<Arc<Recorded>>, Json(body): Json<Value>) -> Response {
    recorded.push("/api/fail", body);
    (StatusCode::INTERNAL_SERVER_ERROR, "model exploded").into_response()
}

async fn handle_version() -> Json<Value> {
    Json(json!({"version": FAKE_VERSION}))
}

async fn handle_tags() -> Json<Value> {
    let models: Vec<Value> = FAKE_MODELS
        .iter()
        .map(|name| json!({"name": name, "size": 4_661_224_676u64}))
        .collect();
    Json(json!({"models": models}))
}
