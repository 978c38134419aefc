//! The `persistence` module defines the message store the bus records
//! deliveries in, and two implementations of it.
//!
//! Persistence is bookkeeping: the bus writes a message as `PENDING` before it
//! reaches the transport and advances the status as delivery progresses. A
//! failing store never blocks or rolls back delivery. Stored messages can be
//! replayed in chronological order, independent of the live queues.
//!
//! - `MemoryMessageStore` keeps everything in process memory.
//! - `SledMessageStore` uses `sled` as an embedded key-value store with
//!   timestamp-prefixed per-topic index trees.

pub mod memory_store;
pub mod sled_store;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId};
use crate::utils::Result;

pub use memory_store::MemoryMessageStore;
pub use sled_store::SledMessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
    DeadLettered,
}

impl MessageStatus {
    /// Position in the delivery lifecycle. The outcomes share the last step.
    pub fn stage(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Acknowledged | MessageStatus::Failed | MessageStatus::DeadLettered => 2,
        }
    }

    /// Statuses only move forward; a late `DELIVERED` never hides an outcome.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next.stage() >= self.stage()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(message: Message) -> Self {
        let now = Utc::now();
        Self {
            message,
            status: MessageStatus::Pending,
            error: None,
            stored_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_status: HashMap<MessageStatus, usize>,
    pub by_topic: HashMap<String, usize>,
}

impl StoreStats {
    pub(crate) fn record(&mut self, stored: &StoredMessage) {
        self.total += 1;
        *self.by_status.entry(stored.status).or_default() += 1;
        *self
            .by_topic
            .entry(stored.message.topic.clone())
            .or_default() += 1;
    }
}

/// Durable (or not) record of published messages.
///
/// Implementations serialize their own mutations.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a message at `PENDING`. Storing an id again overwrites it.
    async fn store(&self, message: &Message) -> Result<MessageId>;

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>>;

    /// Atomically move a message to `status`.
    ///
    /// Returns false when the id is unknown or when `status` is an earlier
    /// lifecycle stage than the current one; nothing changes in that case.
    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<bool>;

    /// Messages of one topic in chronological order, optionally filtered by status.
    async fn get_by_topic(
        &self,
        topic: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;

    /// Stream the messages of a topic whose timestamp falls in `[from, to]`,
    /// oldest first.
    async fn replay(
        &self,
        topic: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Message>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;
}

pub(crate) fn in_window(
    timestamp: DateTime<Utc>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    from.is_none_or(|from| timestamp >= from) && to.is_none_or(|to| timestamp <= to)
}
