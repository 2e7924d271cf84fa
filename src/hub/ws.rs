//! Subscriber transport over WebSocket.
//!
//! `GET /subscribe` upgrades to a WebSocket and registers the connection with
//! the hub. Each relayed event is sent as one JSON text frame. Client frames
//! are ignored apart from close.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Json, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{HubHandle, SubscriberState};
use crate::format_uptime;

/// Shared state of the subscriber-facing HTTP service.
pub struct HubState {
    hub: HubHandle,
    /// Bound on writing a single frame to one subscriber
    send_timeout: Duration,
}

impl HubState {
    pub fn new(hub: HubHandle, send_timeout: Duration) -> Self {
        Self { hub, send_timeout }
    }
}

/// Build the subscriber router.
pub fn subscriber_app(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/subscribe", get(ws_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<HubState>) {
    let mut lifecycle = SubscriberState::Connecting;

    let mut subscription = match state.hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            lifecycle.advance(SubscriberState::Failed);
            warn!(state = %lifecycle, error = %e, "Rejecting subscriber");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let id = subscription.id();
    lifecycle.advance(SubscriberState::Open);
    info!(subscriber = %id, state = %lifecycle, "Subscriber connected");

    let outcome = loop {
        tokio::select! {
            event = subscription.recv() => {
                // The hub dropped us (stalled queue) or is shutting down.
                let Some(event) = event else {
                    break SubscriberState::Failed;
                };

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(subscriber = %id, error = %e, "Failed to serialize event");
                        continue;
                    }
                };

                match timeout(state.send_timeout, socket.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(subscriber = %id, error = %e, "Failed to send event");
                        break SubscriberState::Failed;
                    }
                    Err(_) => {
                        warn!(
                            subscriber = %id,
                            timeout_ms = state.send_timeout.as_millis() as u64,
                            "Timed out sending event"
                        );
                        break SubscriberState::Failed;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break SubscriberState::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "Subscriber connection error");
                    break SubscriberState::Failed;
                }
            },
        }
    };
    lifecycle.advance(outcome);

    // Already gone if the hub dropped it during fan-out.
    let _ = state.hub.unsubscribe(id, lifecycle).await;
    info!(subscriber = %id, state = %lifecycle, "Subscriber disconnected");
}

async fn health_check(State(state): State<Arc<HubState>>) -> Result<Json<Value>, StatusCode> {
    let subscribers = state.hub.subscriber_count().await.map_err(|e| {
        warn!(error = %e, "Health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(json!({ "status": "ok", "subscribers": subscribers })))
}

async fn get_metrics(State(state): State<Arc<HubState>>) -> Json<Value> {
    let metrics = state.hub.metrics();
    let uptime = metrics.uptime_seconds();
    let subscribers = state.hub.subscriber_count().await.ok();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "subscribers": subscribers,
        "events": {
            "received": metrics.events_received(),
            "relayed": metrics.events_relayed(),
            "deliveries": metrics.deliveries(),
            "malformed": metrics.malformed_events(),
        },
        "subscribers_dropped": metrics.subscribers_dropped(),
        "status": "running"
    }))
}
