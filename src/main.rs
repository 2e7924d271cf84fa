//! Postbox ingestion service.
//!
//! Accepts message submissions, stores them and publishes them to the hub.
//!
//! ## Configuration
//!
//! - `POSTBOX_CONFIG`: Path to the TOML config (default: "config/postbox.toml")
//! - `RUST_LOG`: Logging level (default: "info")

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use postbox::config::PostboxConfig;
use postbox::ingest::{self, AppState};
use postbox::shutdown::ShutdownSignal;
use postbox::store::MessageStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let config = PostboxConfig::load()?;

    let store = MessageStore::new(&config.server.data_file);
    let publisher = config.build_publisher();
    let app_state = Arc::new(AppState::new(store, publisher));

    let app = ingest::app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        data_file = %config.server.data_file.display(),
        "Postbox listening on {}",
        addr
    );

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let cancelled = shutdown.cancelled();
    tokio::spawn(async move { shutdown.wait().await });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancelled)
        .await?;

    info!("Postbox shutdown complete");
    Ok(())
}
