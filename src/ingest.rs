//! Ingestion HTTP API.
//!
//! Accepts form submissions, persists them through the [`MessageStore`] and
//! then hands them to a [`Publisher`]. Persistence is the source of truth: a
//! store failure fails the request and nothing is published, a publish
//! failure is only logged.
//!
//! | Route             | Purpose                                  |
//! |-------------------|------------------------------------------|
//! | `POST /`          | submit `username` + `message` (form)     |
//! | `POST /message`   | same as `POST /`                         |
//! | `GET /read`       | current feed as JSON, newest first       |
//! | `GET /health`     | liveness                                 |
//! | `GET /metrics`    | counters and uptime                      |

use axum::{
    extract::{rejection::FormRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::message::{Message, PublishEvent, TimestampSource};
use crate::publisher::Publisher;
use crate::store::{Feed, MessageStore, StoreError};
use crate::format_uptime;

/// Keys tried per submission before a collision is reported as a failure
const MAX_KEY_ATTEMPTS: usize = 3;

/// Ingestion metrics
#[derive(Debug)]
pub struct Metrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
    publish_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the ingestion service.
pub struct AppState {
    store: MessageStore,
    publisher: Arc<dyn Publisher>,
    clock: TimestampSource,
    metrics: Metrics,
}

impl AppState {
    pub fn new(store: MessageStore, publisher: Arc<dyn Publisher>) -> Self {
        Self::with_clock(store, publisher, TimestampSource::new())
    }

    pub fn with_clock(
        store: MessageStore,
        publisher: Arc<dyn Publisher>,
        clock: TimestampSource,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            metrics: Metrics::new(),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed form body: {0}")]
    MalformedForm(String),

    #[error("failed to store message")]
    Store(#[from] StoreError),

    #[error("not found")]
    NotFound,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingField(_) | ApiError::MalformedForm(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Form fields of a submission. Both are required and must be non-empty.
#[derive(Debug, Deserialize)]
pub struct SubmitForm {
    pub username: Option<String>,
    pub message: Option<String>,
}

impl SubmitForm {
    /// Returns `(username, message)` or the first missing field.
    fn into_parts(self) -> Result<(String, String), ApiError> {
        let username = self
            .username
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingField("username"))?;
        let message = self
            .message
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingField("message"))?;
        Ok((username, message))
    }
}

/// Response returned when a message is stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    /// Key the message was stored under
    pub timestamp: String,
}

/// Build the ingestion router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(submit_message))
        .route("/message", post(submit_message))
        .route("/read", get(read_feed))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .fallback(not_found)
        .with_state(state)
}

async fn submit_message(
    State(state): State<Arc<AppState>>,
    form: Result<Form<SubmitForm>, FormRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let parts = form
        .map_err(|e| ApiError::MalformedForm(e.body_text()))
        .and_then(|Form(form)| form.into_parts());

    let (username, body) = match parts {
        Ok(parts) => parts,
        Err(e) => {
            state.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Rejected submission");
            return Err(e);
        }
    };

    let mut attempt = 1;
    let message = loop {
        let message = Message::new(state.clock.next(), username.as_str(), body.as_str());

        match state.store.append(&message).await {
            Ok(()) => break message,
            Err(StoreError::DuplicateKey(key)) if attempt < MAX_KEY_ATTEMPTS => {
                warn!(key = %key, attempt, "Timestamp key already taken, issuing a new one");
                attempt += 1;
            }
            Err(e) => {
                state.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    timestamp = %message.timestamp,
                    path = %state.store.path().display(),
                    error = %e,
                    "Failed to store message"
                );
                return Err(e.into());
            }
        }
    };

    state.metrics.accepted.fetch_add(1, Ordering::Relaxed);
    info!(
        timestamp = %message.timestamp,
        username = %message.username,
        "Message stored"
    );

    let event = PublishEvent::from(&message);
    match state.publisher.publish(&event).await {
        Ok(()) => debug!(publisher = %state.publisher.name(), "Message event published"),
        Err(e) => {
            state.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                publisher = %state.publisher.name(),
                timestamp = %message.timestamp,
                error = %e,
                "Failed to publish message event"
            );
        }
    }

    Ok(Json(SubmitResponse {
        status: "stored".to_string(),
        timestamp: message.timestamp,
    }))
}

async fn read_feed(State(state): State<Arc<AppState>>) -> Json<Feed> {
    let feed = state.store.load().await;
    info!(
        count = feed.len(),
        path = %state.store.path().display(),
        "Loaded messages"
    );
    Json(feed)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let feed = state.store.load().await;
    Json(json!({
        "status": "ok",
        "store": state.store.path().display().to_string(),
        "messages": feed.len(),
    }))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "messages": {
            "accepted": state.metrics.accepted(),
            "rejected": state.metrics.rejected(),
            "store_failures": state.metrics.store_failures(),
            "publish_failures": state.metrics.publish_failures(),
        },
        "status": "running"
    }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}
