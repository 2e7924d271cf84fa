//! Durable message store.
//!
//! All messages live in one JSON document mapping timestamp keys to
//! [`MessageBody`] values, newest first:
//!
//! ```json
//! {
//!     "2025-12-11 10:00:01.000000": { "username": "bob", "message": "second" },
//!     "2025-12-11 10:00:00.000000": { "username": "alice", "message": "first" }
//! }
//! ```
//!
//! The whole document is read on every [`MessageStore::load`] and
//! [`MessageStore::append`]. Appends hold an async mutex for the full
//! read-modify-write, so concurrent submissions cannot overwrite each other,
//! and the new document replaces the old one through a temp file + rename.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message::{Message, MessageBody};

/// Errors that can occur while reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("failed to serialize store document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("a message with key '{0}' already exists")]
    DuplicateKey(String),
}

/// Ordered view of the store document.
///
/// Iteration follows document order, which is newest-first. Entries that are
/// not a `{username, message}` object are kept so they survive a rewrite, but
/// they are not part of the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    entries: Vec<(String, Entry)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Message(MessageBody),
    Unrecognized(Value),
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Whether the document has an entry under `key`, message or not.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&MessageBody> {
        self.iter().find(|(k, _)| *k == key).map(|(_, body)| body)
    }

    /// The newest message.
    pub fn first(&self) -> Option<(&str, &MessageBody)> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MessageBody)> {
        self.entries.iter().filter_map(|(k, entry)| match entry {
            Entry::Message(body) => Some((k.as_str(), body)),
            Entry::Unrecognized(_) => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|(k, _)| k)
    }

    /// Number of entries that are not messages.
    pub fn unrecognized(&self) -> usize {
        self.entries.len() - self.len()
    }

    /// Insert a message ahead of all existing entries.
    fn prepend(&mut self, key: String, body: MessageBody) {
        self.entries.insert(0, (key, Entry::Message(body)));
    }
}

impl Serialize for Feed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, entry) in &self.entries {
            match entry {
                Entry::Message(body) => map.serialize_entry(key, body)?,
                Entry::Unrecognized(value) => map.serialize_entry(key, value)?,
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Feed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FeedVisitor)
    }
}

struct FeedVisitor;

impl<'de> Visitor<'de> for FeedVisitor {
    type Value = Feed;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of timestamp keys to messages")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Feed, A::Error> {
        let mut entries: Vec<(String, Entry)> =
            Vec::with_capacity(access.size_hint().unwrap_or(0));
        let mut positions: HashMap<String, usize> = HashMap::new();

        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            let entry = match MessageBody::deserialize(&value) {
                Ok(body) => Entry::Message(body),
                Err(e) => {
                    warn!(key = %key, error = %e, "Store entry is not a message, skipping it");
                    Entry::Unrecognized(value)
                }
            };

            // A repeated key keeps its first position and takes the last value.
            if let Some(&index) = positions.get(&key) {
                entries[index].1 = entry;
            } else {
                positions.insert(key.clone(), entries.len());
                entries.push((key, entry));
            }
        }

        Ok(Feed { entries })
    }
}

/// File-backed message store.
///
/// One instance should own a given file; the write lock only serializes
/// appends made through the same instance.
#[derive(Debug)]
pub struct MessageStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MessageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole store.
    ///
    /// A missing, unreadable or malformed document reads as an empty feed.
    pub async fn load(&self) -> Feed {
        match self.read_document().await {
            Ok(Some(feed)) => feed,
            Ok(None) => Feed::new(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read message store, treating it as empty"
                );
                Feed::new()
            }
        }
    }

    /// Persist a message ahead of every existing entry.
    ///
    /// A document that is not a JSON object is replaced. Other read failures
    /// and all write failures are returned to the caller.
    pub async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut feed = match self.read_document().await {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                info!(path = %self.path.display(), "Creating message store");
                Feed::new()
            }
            Err(StoreError::Corrupt(e)) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Message store is corrupt, starting a fresh document"
                );
                Feed::new()
            }
            Err(e) => return Err(e),
        };

        if feed.contains_key(&message.timestamp) {
            return Err(StoreError::DuplicateKey(message.timestamp.clone()));
        }

        feed.prepend(message.timestamp.clone(), message.to_body());
        self.write_document(&feed).await?;

        debug!(
            path = %self.path.display(),
            key = %message.timestamp,
            entries = feed.len(),
            "Message appended"
        );

        Ok(())
    }

    /// `Ok(None)` when the document does not exist yet.
    async fn read_document(&self) -> Result<Option<Feed>, StoreError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(StoreError::Corrupt)
    }

    async fn write_document(&self, feed: &Feed) -> Result<(), StoreError> {
        let mut content = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut content, formatter);
        feed.serialize(&mut serializer).map_err(StoreError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.temp_path();
        if let Err(e) = replace_with(&temp_path, &self.path, &content).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Write `content` to `temp_path`, flush it to disk, then move it over `path`.
async fn replace_with(temp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(temp_path, path).await
}
