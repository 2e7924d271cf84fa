//! End-to-end tests: form submission -> store -> TCP event channel -> hub -> subscriber.

use axum::{body::Body, http::Request, http::StatusCode};
use futures_util::StreamExt;
use postbox::hub::{self, Hub, HubHandle, HubState};
use postbox::ingest::{self, AppState};
use postbox::message::PublishEvent;
use postbox::publisher::TcpPublisher;
use postbox::shutdown::ShutdownSignal;
use postbox::store::MessageStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tower::ServiceExt; // for `oneshot`

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

struct Pipeline {
    _dir: TempDir,
    state: Arc<AppState>,
    hub: HubHandle,
    shutdown: ShutdownSignal,
}

impl Pipeline {
    /// Start a hub with its event channel and an ingestion app publishing to it.
    async fn start() -> Self {
        let shutdown = ShutdownSignal::new();

        let (hub, handle) = Hub::new(16);
        tokio::spawn(hub.run(shutdown.cancelled()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let event_addr = listener.local_addr().unwrap();
        tokio::spawn(hub::serve_events(
            listener,
            handle.clone(),
            Duration::from_secs(1),
            shutdown.cancelled(),
        ));

        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path().join("storage").join("data.json"));
        let publisher = Arc::new(
            TcpPublisher::new(event_addr.to_string()).with_timeout(Duration::from_millis(500)),
        );
        let state = Arc::new(AppState::new(store, publisher));

        Self {
            _dir: dir,
            state,
            hub: handle,
            shutdown,
        }
    }

    /// Serve the subscriber endpoint and return its WebSocket URL.
    async fn serve_subscribers(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = hub::subscriber_app(Arc::new(HubState::new(
            self.hub.clone(),
            Duration::from_secs(1),
        )));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/subscribe")
    }

    async fn wait_for_subscribers(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
        while self.hub.subscriber_count().await.unwrap() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} subscribers"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn submit(&self, body: &str) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap();

        ingest::app(self.state.clone())
            .oneshot(request)
            .await
            .unwrap()
            .status()
    }
}

#[tokio::test]
async fn test_submission_reaches_subscriber() {
    let pipeline = Pipeline::start().await;
    let mut subscription = pipeline.hub.subscribe().await.unwrap();

    assert_eq!(pipeline.submit("username=alice&message=hi").await, StatusCode::OK);

    let feed = pipeline.state.store().load().await;
    assert_eq!(feed.len(), 1);
    let (timestamp, body) = feed.first().unwrap();
    assert_eq!(body.username, "alice");
    assert_eq!(body.message, "hi");

    let event = tokio::time::timeout(DELIVERY_TIMEOUT, subscription.recv())
        .await
        .expect("event not delivered in time")
        .expect("subscriber dropped");
    assert_eq!(event.username, "alice");
    assert_eq!(event.message, "hi");
    assert_eq!(event.timestamp, timestamp);
}

#[tokio::test]
async fn test_submission_reaches_websocket_subscribers() {
    let pipeline = Pipeline::start().await;
    let url = pipeline.serve_subscribers().await;

    let (mut connected, _) = connect_async(url.as_str()).await.unwrap();
    let (disconnected, _) = connect_async(url.as_str()).await.unwrap();
    pipeline.wait_for_subscribers(2).await;
    drop(disconnected);
    pipeline.wait_for_subscribers(1).await;

    assert_eq!(pipeline.submit("username=dave&message=over+the+wire").await, StatusCode::OK);

    let frame = tokio::time::timeout(DELIVERY_TIMEOUT, connected.next())
        .await
        .expect("frame not delivered in time")
        .expect("connection ended")
        .unwrap();
    let event: PublishEvent = serde_json::from_str(frame.to_text().unwrap()).unwrap();

    let feed = pipeline.state.store().load().await;
    let (timestamp, _) = feed.first().unwrap();
    assert_eq!(event.username, "dave");
    assert_eq!(event.message, "over the wire");
    assert_eq!(event.timestamp, timestamp);
    assert_eq!(pipeline.hub.subscriber_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_disconnected_subscriber_does_not_block_delivery() {
    let pipeline = Pipeline::start().await;
    let mut healthy = pipeline.hub.subscribe().await.unwrap();
    let disconnected = pipeline.hub.subscribe().await.unwrap();
    drop(disconnected);

    assert_eq!(pipeline.submit("username=bob&message=still+here").await, StatusCode::OK);

    let event = tokio::time::timeout(DELIVERY_TIMEOUT, healthy.recv())
        .await
        .expect("event not delivered in time")
        .expect("subscriber dropped");
    assert_eq!(event.username, "bob");
    assert_eq!(event.message, "still here");

    assert_eq!(pipeline.hub.subscriber_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_submissions_survive_a_stopped_hub() {
    let pipeline = Pipeline::start().await;
    pipeline.shutdown.trigger();
    // Let the event channel close its listener.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pipeline.submit("username=carol&message=offline").await, StatusCode::OK);

    let feed = pipeline.state.store().load().await;
    assert_eq!(feed.len(), 1);
    assert_eq!(feed.first().unwrap().1.username, "carol");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_all_stored_and_relayed() {
    let pipeline = Arc::new(Pipeline::start().await);
    let mut subscription = pipeline.hub.subscribe().await.unwrap();

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .submit(&format!("username=user{i}&message=msg{i}"))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    let feed = pipeline.state.store().load().await;
    assert_eq!(feed.len(), 50);

    let mut relayed = std::collections::HashSet::new();
    while relayed.len() < 50 {
        let event = tokio::time::timeout(DELIVERY_TIMEOUT, subscription.recv())
            .await
            .expect("event not delivered in time")
            .expect("subscriber dropped");
        assert!(feed.contains_key(&event.timestamp));
        relayed.insert(event.timestamp);
    }
}
