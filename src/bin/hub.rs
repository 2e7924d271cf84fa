//! Postbox Notification Hub
//!
//! Receives published message events on a loopback TCP port and relays them
//! to every connected WebSocket subscriber.
//!
//! ## Configuration
//!
//! - `POSTBOX_CONFIG`: Path to the TOML config (default: "config/postbox.toml")
//! - `RUST_LOG`: Logging level (default: "info")

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use postbox::config::PostboxConfig;
use postbox::hub::{self, Hub, HubState};
use postbox::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let config = PostboxConfig::load()?;

    info!(
        event_addr = %config.hub.event_addr,
        port = config.hub.port,
        subscriber_buffer = config.hub.subscriber_buffer,
        "Postbox hub starting"
    );

    let shutdown = ShutdownSignal::new();

    // Hub actor owns the subscriber set
    let (hub, handle) = Hub::new(config.hub.subscriber_buffer);
    let hub_task = tokio::spawn(hub.run(shutdown.cancelled()));

    // Inbound event channel
    let event_listener = TcpListener::bind(config.hub.event_socket_addr()?).await?;
    let events_task = tokio::spawn(hub::serve_events(
        event_listener,
        handle.clone(),
        config.hub.read_timeout(),
        shutdown.cancelled(),
    ));

    // Subscriber WebSocket endpoint
    let state = Arc::new(HubState::new(handle, config.hub.send_timeout()));
    let app = hub::subscriber_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.hub.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Hub accepting subscribers on {}", addr);

    let cancelled = shutdown.cancelled();
    tokio::spawn(async move { shutdown.wait().await });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancelled)
        .await?;

    events_task.await?;
    hub_task.await?;

    info!("Hub shutdown complete");
    Ok(())
}
