//! Persistence layer backed by `sled`
//!
//! Stored messages live in a `messages` tree keyed by message id. Each topic
//! also gets an index tree whose keys are prefixed with the zero-padded message
//! timestamp, so iterating a topic yields messages in chronological order and
//! replay windows become range scans.
//!
//! Every mutation of a stored message is a single atomic sled operation:
//! `insert`/`remove` hand back the value they replaced, and status changes go
//! through `update_and_fetch`, which retries on concurrent writes.
//!
//! Configuration options supported:
//! - `max_messages_per_topic`: optional cap to limit storage per topic; when
//!   exceeded the oldest messages are removed.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sled::{Db, Tree};
use tracing::debug;

use super::{MessageStatus, MessageStore, StoreStats, StoredMessage, in_window};
use crate::message::{Message, MessageId};
use crate::utils::Result;

#[derive(Clone)]
pub struct SledMessageStore {
    db: Db,
    messages: Tree,
    max_messages_per_topic: Option<usize>,
}

impl SledMessageStore {
    /// Open or create a sled database at `path` with the given retention policy.
    pub fn open(path: impl AsRef<Path>, max_messages_per_topic: Option<usize>) -> Result<Self> {
        let db = sled::open(path)?;
        let messages = db.open_tree("messages")?;
        Ok(Self {
            db,
            messages,
            max_messages_per_topic,
        })
    }

    fn topic_tree(&self, topic: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("topic:{topic}"))?)
    }

    fn millis_prefix(timestamp: DateTime<Utc>) -> String {
        format!("{:020}", timestamp.timestamp_millis().max(0))
    }

    fn index_key(message: &Message) -> String {
        format!("{}_{}", Self::millis_prefix(message.timestamp), message.id)
    }

    fn load(&self, id: &str) -> Result<Option<StoredMessage>> {
        match self.messages.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn enforce_retention(&self, topic: &str, tree: &Tree) -> Result<()> {
        let Some(max) = self.max_messages_per_topic else {
            return Ok(());
        };
        let total = tree.len();
        if total <= max {
            return Ok(());
        }

        let excess: Vec<_> = tree
            .iter()
            .take(total - max)
            .collect::<std::result::Result<_, _>>()?;
        for (key, id) in excess {
            tree.remove(key)?;
            self.messages.remove(id)?;
        }
        debug!(topic, removed = total - max, "Trimmed stored messages to retention cap");
        Ok(())
    }

    fn topic_messages(&self, topic: &str) -> Result<Vec<StoredMessage>> {
        let tree = self.topic_tree(topic)?;
        let mut found = Vec::new();
        for item in tree.iter() {
            let (_, id) = item?;
            let id = String::from_utf8_lossy(&id).into_owned();
            if let Some(stored) = self.load(&id)? {
                found.push(stored);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl MessageStore for SledMessageStore {
    async fn store(&self, message: &Message) -> Result<MessageId> {
        let tree = self.topic_tree(&message.topic)?;
        let key = Self::index_key(message);
        let serialized = serde_json::to_vec(&StoredMessage::new(message.clone()))?;

        if let Some(bytes) = self.messages.insert(message.id.as_bytes(), serialized)? {
            let previous: StoredMessage = serde_json::from_slice(&bytes)?;
            let previous_key = Self::index_key(&previous.message);
            if previous.message.topic != message.topic || previous_key != key {
                self.topic_tree(&previous.message.topic)?
                    .remove(previous_key.as_bytes())?;
            }
        }
        tree.insert(key.as_bytes(), message.id.as_bytes())?;
        self.enforce_retention(&message.topic, &tree)?;
        Ok(message.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        self.load(id)
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<bool> {
        // the closure may run several times under contention; the last run wins
        let mut outcome: Result<bool> = Ok(false);
        self.messages.update_and_fetch(id.as_bytes(), |current| {
            outcome = Ok(false);
            let bytes = current?;
            let mut stored: StoredMessage = match serde_json::from_slice(bytes) {
                Ok(stored) => stored,
                Err(err) => {
                    outcome = Err(err.into());
                    return Some(bytes.to_vec());
                }
            };
            if !stored.status.can_advance_to(status) {
                return Some(bytes.to_vec());
            }
            stored.status = status;
            stored.error = error.clone();
            stored.updated_at = Utc::now();
            match serde_json::to_vec(&stored) {
                Ok(updated) => {
                    outcome = Ok(true);
                    Some(updated)
                }
                Err(err) => {
                    outcome = Err(err.into());
                    Some(bytes.to_vec())
                }
            }
        })?;
        outcome
    }

    async fn get_by_topic(
        &self,
        topic: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        Ok(self
            .topic_messages(topic)?
            .into_iter()
            .filter(|stored| status.is_none_or(|s| stored.status == s))
            .take(limit)
            .collect())
    }

    async fn replay(
        &self,
        topic: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Message>> {
        let tree = self.topic_tree(topic)?;
        let start = from.map(Self::millis_prefix).unwrap_or_default();

        let mut messages = Vec::new();
        for item in tree.range(start.as_bytes()..) {
            let (_, id) = item?;
            let id = String::from_utf8_lossy(&id).into_owned();
            let Some(stored) = self.load(&id)? else {
                continue;
            };
            if to.is_some_and(|to| stored.message.timestamp > to) {
                break;
            }
            if in_window(stored.message.timestamp, from, to) {
                messages.push(stored.message);
            }
        }
        Ok(stream::iter(messages).boxed())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(bytes) = self.messages.remove(id.as_bytes())? else {
            return Ok(false);
        };
        let stored: StoredMessage = serde_json::from_slice(&bytes)?;
        self.topic_tree(&stored.message.topic)?
            .remove(Self::index_key(&stored.message).as_bytes())?;
        Ok(true)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for item in self.messages.iter() {
            let (_, bytes) = item?;
            let stored: StoredMessage = serde_json::from_slice(&bytes)?;
            stats.record(&stored);
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for SledMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledMessageStore")
            .field("db", &"sled::Db")
            .field("max_messages_per_topic", &self.max_messages_per_topic)
            .finish()
    }
}
