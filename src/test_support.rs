use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct FakeApiState {
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    status: Arc<AtomicU16>,
    held: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl FakeApiState {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    async fn wait_while_held(&self) {
        let mut held = self.held.subscribe();
        while *held.borrow_and_update() {
            if held.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Local stand-in for the clinical API that records every POST body.
pub struct FakeApi {
    pub endpoint: String,
    state: FakeApiState,
}

async fn ingest(
    State(state): State<FakeApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.enter();
    state.received.lock().await.push(ReceivedRequest {
        authorization,
        body,
    });
    state.wait_while_held().await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    StatusCode::from_u16(state.status.load(Ordering::Relaxed))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl FakeApi {
    pub async fn start() -> Self {
        let state = FakeApiState {
            received: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(200)),
            held: Arc::new(watch::channel(false).0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/data", post(ingest))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake api");
        let addr = listener.local_addr().expect("fake api addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            endpoint: format!("http://{addr}/data"),
            state,
        }
    }

    pub fn respond_with(&self, status: StatusCode) {
        self.state.status.store(status.as_u16(), Ordering::Relaxed);
    }

    /// Requests that arrive while held are recorded, then left unanswered
    /// until `release`.
    pub fn hold(&self) {
        self.state.held.send_replace(true);
    }

    pub fn release(&self) {
        self.state.held.send_replace(false);
    }

    /// Requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of requests handled at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().await.clone()
    }

    /// Polls until at least `count` requests arrived or a few seconds passed.
    pub async fn wait_for(&self, count: usize) -> Vec<ReceivedRequest> {
        for _ in 0..100 {
            let received = self.received().await;
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        self.received().await
    }
}
