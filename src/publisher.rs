//! Event publishing toward the notification hub.
//!
//! After a message is stored, the ingestion service hands a [`PublishEvent`]
//! to a [`Publisher`]. Delivery is best-effort: the caller logs a
//! [`PublishError`] and moves on, the stored message is never rolled back.
//!
//! ## Wire protocol
//!
//! [`TcpPublisher`] opens one TCP connection per event, writes a single JSON
//! object and closes its write half. There is no handshake and no
//! acknowledgement; the hub reads until EOF.
//!
//! ```text
//! ingestion ──connect──▶ hub:6000
//!           ──{"username":..,"message":..,"timestamp":..}──▶
//!           ──FIN──▶
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::message::PublishEvent;

/// Default connect/write timeout for a single publish.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors that can occur while publishing an event.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to connect to hub at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("publish timed out after {0}ms")]
    Timeout(u64),

    #[error("I/O error while sending event: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Something that can forward a stored message to subscribers.
///
/// Implementations must not block for long: the ingestion request waits for
/// `publish` to return before responding.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Short name used in logs (e.g. "tcp", "noop")
    fn name(&self) -> &str;

    async fn publish(&self, event: &PublishEvent) -> Result<(), PublishError>;
}

/// Publishes each event over a fresh TCP connection to the hub.
#[derive(Debug, Clone)]
pub struct TcpPublisher {
    /// Hub event address, `host:port`
    addr: String,

    /// Bound on connecting and on writing, applied separately
    timeout: Duration,
}

impl TcpPublisher {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[async_trait]
impl Publisher for TcpPublisher {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn publish(&self, event: &PublishEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;

        let mut stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout_ms()))?
            .map_err(|source| PublishError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        timeout(self.timeout, async {
            stream.write_all(&payload).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| PublishError::Timeout(self.timeout_ms()))??;

        debug!(
            addr = %self.addr,
            timestamp = %event.timestamp,
            bytes = payload.len(),
            "Event published to hub"
        );

        Ok(())
    }
}

/// Publisher used when notifications are disabled.
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    fn name(&self) -> &str {
        "noop"
    }

    async fn publish(&self, event: &PublishEvent) -> Result<(), PublishError> {
        debug!(timestamp = %event.timestamp, "Publishing disabled, event not sent");
        Ok(())
    }
}
