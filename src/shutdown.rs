//! Graceful shutdown coordination for Postbox.
//!
//! A [`ShutdownSignal`] is shared by every long-running task of a service
//! (HTTP server, hub actor, event listener). One task waits for the OS
//! signal; the others hold a [`ShutdownSignal::cancelled`] future.
//!
//! # Example
//!
//! ```rust,ignore
//! use postbox::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let cancelled = shutdown.cancelled();
//!
//! let signal = shutdown.clone();
//! tokio::spawn(async move { signal.wait().await });
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(cancelled)
//!     .await?;
//! ```

use std::future::Future;
use tokio::sync::broadcast;
use tracing::{error, info};

/// A signal for coordinating graceful shutdown across components.
///
/// When a termination signal (SIGTERM, SIGINT) is received, every future
/// obtained from [`ShutdownSignal::cancelled`] completes.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Wait for a shutdown signal (SIGTERM or SIGINT), then notify every
    /// [`cancelled`](Self::cancelled) future.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        let _ = self.sender.send(());
    }

    /// A future that completes once shutdown is triggered.
    ///
    /// The subscription is taken when this is called, not when the future is
    /// first polled, so a trigger in between is not missed.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            let _ = receiver.recv().await;
        }
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
