//! In-memory imitation of the gamecloud backend: the long-poll event
//! endpoint, ping, and admin routes that let tests enqueue messages and
//! inspect acknowledgements.
//!
//! A delivered message stays at the head of its domain queue until a poll
//! acknowledges it, so an unacknowledged message is delivered again.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{Notify, RwLock},
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_API_KEY: &str = "mock-api-key";

/// Used when a poll does not say how long it may be held.
const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;
const MAX_POLL_TIMEOUT_MS: u64 = 600_000;

#[derive(Default)]
struct DomainQueue {
    pending: VecDeque<Value>,
    acks: Vec<String>,
}

pub struct AppState {
    api_key: String,
    domains: RwLock<HashMap<String, DomainQueue>>,
    arrived: Notify,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            domains: RwLock::new(HashMap::new()),
            arrived: Notify::new(),
        }
    }

    async fn head(&self, domain: &str) -> Option<Value> {
        let domains = self.domains.read().await;
        domains.get(domain).and_then(|q| q.pending.front().cloned())
    }

    async fn acknowledge(&self, domain: &str, ack: &str) {
        let mut domains = self.domains.write().await;
        let queue = domains.entry(domain.to_string()).or_default();
        queue.pending.retain(|m| m["id"].as_str() != Some(ack));
        queue.acks.push(ack.to_string());
    }

    async fn enqueue(&self, domain: &str, message: Value) {
        self.domains
            .write()
            .await
            .entry(domain.to_string())
            .or_default()
            .pending
            .push_back(message);
        self.arrived.notify_waiters();
    }

    async fn acks(&self, domain: &str) -> Vec<String> {
        let domains = self.domains.read().await;
        domains.get(domain).map(|q| q.acks.clone()).unwrap_or_default()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let key_matches = headers
            .get("x-apikey")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|key| key == self.api_key);
        let has_basic = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|auth| auth.len() > "Basic ".len() && auth.starts_with("Basic "));
        key_matches && has_basic
    }
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub timeout: Option<u64>,
    pub ack: Option<String>,
}

pub fn app() -> Router {
    app_with_key(DEFAULT_API_KEY)
}

pub fn app_with_key(api_key: &str) -> Router {
    let state: SharedState = Arc::new(AppState::new(api_key));
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/gamer/event/{domain}", get(poll_events))
        .route("/admin/events/{domain}", post(push_event))
        .route("/admin/acks/{domain}", get(list_acks))
        .with_state(state)
}

pub async fn run(listener: TcpListener, api_key: &str) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mock backend listening");
    }
    axum::serve(listener, app_with_key(api_key)).await
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn poll_events(
    State(state): State<SharedState>,
    Path(domain): Path<String>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        debug!(%domain, "poll rejected: bad credentials");
        let body = json!({ "name": "Unauthorized", "message": "invalid credentials" });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    if let Some(ack) = params.ack.as_deref() {
        debug!(%domain, ack, "message acknowledged");
        state.acknowledge(&domain, ack).await;
    }

    let timeout_ms = params
        .timeout
        .unwrap_or(DEFAULT_POLL_TIMEOUT_MS)
        .min(MAX_POLL_TIMEOUT_MS);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        // Created before the check so an enqueue in between is not missed.
        let arrived = state.arrived.notified();
        if let Some(message) = state.head(&domain).await {
            return (StatusCode::OK, Json(message)).into_response();
        }
        if tokio::time::timeout_at(deadline, arrived).await.is_err() {
            return StatusCode::NO_CONTENT.into_response();
        }
    }
}

async fn push_event(
    State(state): State<SharedState>,
    Path(domain): Path<String>,
    Json(mut message): Json<Value>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let Some(fields) = message.as_object_mut() else {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    };
    let has_id = fields
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        fields.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    debug!(%domain, id = ?message["id"], "event enqueued");
    state.enqueue(&domain, message.clone()).await;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_acks(State(state): State<SharedState>, Path(domain): Path<String>) -> Json<Vec<String>> {
    Json(state.acks(&domain).await)
}
