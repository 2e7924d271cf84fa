//! Inbound event channel.
//!
//! Accepts short-lived TCP connections from the ingestion service. Each
//! connection carries exactly one JSON [`PublishEvent`] and is read until
//! EOF. Anything that does not parse is logged and dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::HubHandle;
use crate::message::PublishEvent;

/// Largest event accepted on the channel
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum EventReadError {
    #[error("timed out reading event")]
    Timeout,

    #[error("I/O error reading event: {0}")]
    Io(#[from] std::io::Error),

    #[error("event exceeds {} bytes", MAX_EVENT_BYTES)]
    TooLarge,

    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Read one event from `reader`, up to EOF.
pub async fn read_event<R>(reader: R, read_timeout: Duration) -> Result<PublishEvent, EventReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_EVENT_BYTES as u64 + 1);

    timeout(read_timeout, limited.read_to_end(&mut buf))
        .await
        .map_err(|_| EventReadError::Timeout)??;

    if buf.len() > MAX_EVENT_BYTES {
        return Err(EventReadError::TooLarge);
    }

    Ok(serde_json::from_slice(&buf)?)
}

/// Accept event connections until `shutdown` completes.
///
/// Every connection is handled on its own task so a slow publisher cannot
/// hold up the accept loop.
pub async fn serve_events(
    listener: TcpListener,
    hub: HubHandle,
    read_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "Event channel listening"),
        Err(e) => warn!(error = %e, "Event channel listening on unknown address"),
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, closing event channel...");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let hub = hub.clone();
                    tokio::spawn(handle_connection(stream, peer, hub, read_timeout));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept event connection");
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: HubHandle,
    read_timeout: Duration,
) {
    debug!(peer = %peer, "Event connection opened");

    let event = match read_event(stream, read_timeout).await {
        Ok(event) => event,
        Err(e) => {
            hub.metrics().record_malformed();
            warn!(peer = %peer, error = %e, "Dropping unreadable event");
            return;
        }
    };

    hub.metrics().record_received();
    info!(
        username = %event.username,
        timestamp = %event.timestamp,
        "Received message"
    );

    if let Err(e) = hub.publish(event).await {
        warn!(error = %e, "Event received but hub is not running");
    }
}
