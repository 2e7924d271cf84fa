//! # Postbox
//!
//! Message board intake with real-time notifications.
//!
//! ## Architecture
//!
//! ```text
//! Visitor -> HTTP form -> Message Store (JSON file) -> Publisher --TCP--> Hub -> Subscribers
//! ```
//!
//! The ingestion service (`postbox`) and the notification hub (`hub`) are
//! separate processes. They share nothing but the event wire format in
//! [`message::PublishEvent`].
//!
//! ## Modules
//!
//! - [`message`]: Message, stored body and wire event types
//! - [`store`]: Durable newest-first message store
//! - [`publisher`]: Best-effort event forwarding to the hub
//! - [`ingest`]: Form submission HTTP API
//! - [`hub`]: Subscriber registry, event channel and fan-out

pub mod config;
pub mod hub;
pub mod ingest;
pub mod message;
pub mod publisher;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use hub::{Hub, HubHandle};
pub use message::{Message, MessageBody, PublishEvent};
pub use publisher::{Publisher, PublishError};
pub use store::{Feed, MessageStore, StoreError};

/// Default loopback address of the hub's event channel
pub const DEFAULT_EVENT_ADDR: &str = "127.0.0.1:6000";

/// Format uptime as human-readable
pub(crate) fn format_uptime(uptime: u64) -> String {
    if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3725), "1h 2m 5s");
    }
}
