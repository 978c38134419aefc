use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;

use super::{MessageStatus, MessageStore, StoreStats, StoredMessage, in_window};
use crate::message::{Message, MessageId};
use crate::utils::Result;

/// In-process [`MessageStore`]; contents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<MessageId, StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn topic_messages(&self, topic: &str) -> Vec<StoredMessage> {
        let messages = self.messages.read().await;
        let mut found: Vec<StoredMessage> = messages
            .values()
            .filter(|stored| stored.message.topic == topic)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.message
                .timestamp
                .cmp(&b.message.timestamp)
                .then_with(|| a.stored_at.cmp(&b.stored_at))
        });
        found
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: &Message) -> Result<MessageId> {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), StoredMessage::new(message.clone()));
        Ok(message.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut messages = self.messages.write().await;
        let Some(stored) = messages.get_mut(id) else {
            return Ok(false);
        };
        if !stored.status.can_advance_to(status) {
            return Ok(false);
        }
        stored.status = status;
        stored.error = error;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_by_topic(
        &self,
        topic: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        Ok(self
            .topic_messages(topic)
            .await
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
        let messages: Vec<Message> = self
            .topic_messages(topic)
            .await
            .into_iter()
            .map(|stored| stored.message)
            .filter(|message| in_window(message.timestamp, from, to))
            .collect();
        Ok(stream::iter(messages).boxed())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.messages.write().await.remove(id).is_some())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let messages = self.messages.read().await;
        let mut stats = StoreStats::default();
        for stored in messages.values() {
            stats.record(stored);
        }
        Ok(stats)
    }
}
