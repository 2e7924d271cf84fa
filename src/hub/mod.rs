//! Notification hub.
//!
//! The hub owns the set of live subscribers and fans every received
//! [`PublishEvent`] out to them.
//!
//! ## Architecture
//!
//! ```text
//!   ingestion ──TCP──▶ listener ──┐
//!                                 │ Command::Publish
//!   ws task ◀──queue── ┌──────────▼──────────┐
//!   ws task ◀──queue── │   Hub (one task)    │
//!   ws task ◀──queue── │  subscriber map     │
//!                      └─────────────────────┘
//! ```
//!
//! The subscriber map is touched only by the [`Hub`] task. Everything else
//! talks to it through a cloneable [`HubHandle`]. Fan-out never waits on a
//! subscriber: each one has a bounded queue, and a subscriber whose queue
//! is closed or full is dropped while delivery to the rest continues.
//!
//! ## Subscriber lifecycle
//!
//! ```text
//! Connecting ──▶ Open ──▶ Closed  (peer went away)
//!                    └──▶ Failed  (send error, timeout or stalled queue)
//! ```

pub mod listener;
pub mod ws;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::PublishEvent;

pub use listener::{read_event, serve_events, EventReadError};
pub use ws::{subscriber_app, HubState};

/// Capacity of the hub's command queue
const COMMAND_BUFFER: usize = 1024;

/// Identifier assigned to each subscriber connection
pub type SubscriberId = Uuid;

/// Lifecycle state of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl SubscriberState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriberState::Closed | SubscriberState::Failed)
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: SubscriberState) -> bool {
        use SubscriberState::*;

        let allowed = matches!(
            (*self, next),
            (Connecting, Open) | (Connecting, Failed) | (Open, Closed) | (Open, Failed)
        );
        if allowed {
            *self = next;
        }
        allowed
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberState::Connecting => "connecting",
            SubscriberState::Open => "open",
            SubscriberState::Closed => "closed",
            SubscriberState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("notification hub is no longer running")]
    Closed,
}

/// Hub counters, readable from any task.
#[derive(Debug)]
pub struct HubMetrics {
    events_received: AtomicU64,
    events_relayed: AtomicU64,
    deliveries: AtomicU64,
    subscribers_dropped: AtomicU64,
    malformed_events: AtomicU64,
    start_time: Instant,
}

impl HubMetrics {
    fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_relayed: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn events_relayed(&self) -> u64 {
        self.events_relayed.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(Ordering::Relaxed)
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub(crate) fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// The receiving end of one subscriber's queue.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<PublishEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<PublishEvent> {
        self.events.recv().await
    }
}

/// Outcome of fanning one event out.
#[derive(Debug, Default)]
pub(crate) struct FanOutReport {
    pub(crate) delivered: usize,
    pub(crate) dropped: Vec<(SubscriberId, SubscriberState)>,
}

enum Command {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriberId,
        state: SubscriberState,
    },
    Publish(PublishEvent),
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle used by connection tasks to reach the hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    metrics: Arc<HubMetrics>,
}

impl HubHandle {
    /// Register a new subscriber. Its state is `Open` from here on.
    pub async fn subscribe(&self) -> Result<Subscription, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Subscribe { reply }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Remove a subscriber that reached a terminal state.
    pub async fn unsubscribe(
        &self,
        id: SubscriberId,
        state: SubscriberState,
    ) -> Result<(), HubError> {
        self.send(Command::Unsubscribe { id, state }).await
    }

    /// Queue an event for fan-out.
    pub async fn publish(&self, event: PublishEvent) -> Result<(), HubError> {
        self.send(Command::Publish(event)).await
    }

    /// Number of live subscribers, after every command sent before this one.
    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Count { reply }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// The hub actor. Owns the subscriber map.
pub struct Hub {
    commands: mpsc::Receiver<Command>,
    /// Open subscribers only; anything terminal is removed
    subscribers: HashMap<SubscriberId, mpsc::Sender<PublishEvent>>,
    /// Queue capacity per subscriber
    buffer: usize,
    metrics: Arc<HubMetrics>,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    ///
    /// `buffer` is how many events may wait for one subscriber before it is
    /// considered stalled and dropped.
    pub fn new(buffer: usize) -> (Hub, HubHandle) {
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let metrics = Arc::new(HubMetrics::new());

        let hub = Hub {
            commands,
            subscribers: HashMap::new(),
            buffer: buffer.max(1),
            metrics: metrics.clone(),
        };
        let handle = HubHandle {
            commands: sender,
            metrics,
        };

        (hub, handle)
    }

    /// Process commands until `shutdown` completes or every handle is gone.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(buffer = self.buffer, "Notification hub started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping hub...");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        info!(
            subscribers = self.subscribers.len(),
            events_relayed = self.metrics.events_relayed(),
            "Notification hub stopped"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { reply } => {
                let subscription = self.subscribe();
                let id = subscription.id;
                if reply.send(subscription).is_err() {
                    // Caller went away before the reply; nothing will read the queue.
                    self.subscribers.remove(&id);
                }
            }
            Command::Unsubscribe { id, state } => self.unsubscribe(id, state),
            Command::Publish(event) => {
                self.fan_out(&event);
            }
            Command::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn subscribe(&mut self) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, events) = mpsc::channel(self.buffer);

        self.subscribers.insert(id, sender);

        info!(
            subscriber = %id,
            subscribers = self.subscribers.len(),
            "Subscriber registered"
        );

        Subscription { id, events }
    }

    fn unsubscribe(&mut self, id: SubscriberId, state: SubscriberState) {
        if self.subscribers.remove(&id).is_some() {
            info!(
                subscriber = %id,
                state = %state,
                subscribers = self.subscribers.len(),
                "Subscriber removed"
            );
        }
    }

    /// Offer the event to every open subscriber without waiting on any of them.
    fn fan_out(&mut self, event: &PublishEvent) -> FanOutReport {
        let mut report = FanOutReport::default();

        for (id, sender) in &self.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped.push((*id, SubscriberState::Failed)),
                Err(TrySendError::Closed(_)) => report.dropped.push((*id, SubscriberState::Closed)),
            }
        }

        for (id, state) in &report.dropped {
            if self.subscribers.remove(id).is_some() {
                warn!(
                    subscriber = %id,
                    state = %state,
                    "Dropping subscriber during fan-out"
                );
            }
        }

        self.metrics.events_relayed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.metrics
            .subscribers_dropped
            .fetch_add(report.dropped.len() as u64, Ordering::Relaxed);

        debug!(
            timestamp = %event.timestamp,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Event fanned out"
        );

        report
    }
}
