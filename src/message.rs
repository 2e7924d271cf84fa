//! Core message types for Postbox.
//!
//! A [`Message`] is what a visitor submits. It is persisted as a
//! [`MessageBody`] keyed by its timestamp, and forwarded to the notification
//! hub as a [`PublishEvent`].

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Timestamp layout used for message keys, e.g. `2025-12-11 10:00:00.123456`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A message accepted from a visitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Acceptance time at microsecond resolution; unique key in the store
    pub timestamp: String,

    /// Free-form author name
    pub username: String,

    /// Free-form message text
    pub body: String,
}

impl Message {
    pub fn new(
        timestamp: impl Into<String>,
        username: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            username: username.into(),
            body: body.into(),
        }
    }

    /// The value stored under this message's key.
    pub fn to_body(&self) -> MessageBody {
        MessageBody {
            username: self.username.clone(),
            message: self.body.clone(),
        }
    }
}

/// The persisted value of a message: everything except the key.
///
/// ```json
/// { "username": "alice", "message": "hi" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub username: String,
    pub message: String,
}

/// Wire representation of a newly stored message, sent to the hub and
/// relayed to every subscriber.
///
/// ```json
/// {
///   "username": "alice",
///   "message": "hi",
///   "timestamp": "2025-12-11 10:00:00.123456"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub username: String,
    pub message: String,
    pub timestamp: String,
}

impl From<&Message> for PublishEvent {
    fn from(message: &Message) -> Self {
        Self {
            username: message.username.clone(),
            message: message.body.clone(),
            timestamp: message.timestamp.clone(),
        }
    }
}

impl From<PublishEvent> for Message {
    fn from(event: PublishEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            username: event.username,
            body: event.message,
        }
    }
}

/// Issues message timestamps that never repeat within a process.
///
/// Wall-clock reads can coincide at microsecond resolution (or step
/// backwards). When the clock has not moved past the last issued value the
/// source hands out the last value plus one microsecond instead.
///
/// Keys are rendered in local time, so distinct instants can still share a
/// string across a DST fall-back. The store refuses such a key and the caller
/// asks for the next one.
#[derive(Debug)]
pub struct TimestampSource {
    last_micros: AtomicI64,
    /// Microseconds since the Unix epoch
    now: fn() -> i64,
}

impl TimestampSource {
    pub fn new() -> Self {
        Self::with_clock(system_micros)
    }

    /// A source reading time from `now` instead of the system clock.
    pub fn with_clock(now: fn() -> i64) -> Self {
        Self {
            last_micros: AtomicI64::new(0),
            now,
        }
    }

    /// Next unique timestamp, formatted with [`TIMESTAMP_FORMAT`] in local time.
    pub fn next(&self) -> String {
        format_micros(self.next_micros())
    }

    fn next_micros(&self) -> i64 {
        let now = (self.now)();
        let previous = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

impl Default for TimestampSource {
    fn default() -> Self {
        Self::new()
    }
}

fn system_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn format_micros(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_else(Utc::now)
        .with_timezone(&Local)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}
