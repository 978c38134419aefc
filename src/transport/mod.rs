//! The `transport` module defines the contract every message backend implements.
//!
//! The in-process [`InMemoryBroker`](crate::broker::InMemoryBroker) is one
//! implementation; a Kafka- or Redis-backed adapter would implement the same
//! trait and must keep the same priority and ordering semantics to be a drop-in
//! replacement.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId};
use crate::utils::Result;

pub type SubscriptionId = String;

/// Callback invoked for each message delivered to a subscription.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Flow-control counters for one topic queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub queue_size: usize,
    pub max_size: usize,
    pub fill_ratio: f64,
    pub backpressure_events: u64,
    pub evicted: u64,
    /// Messages popped for delivery that found no subscriber and no room to go back.
    pub dropped: u64,
    pub published: u64,
    pub delivered: u64,
    pub subscribers: usize,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the backend. Calling it on a connected transport is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Stop the backend and release every background task. Calling it on a
    /// disconnected transport is a no-op.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Hand a message to the backend.
    ///
    /// Returns once the message is enqueued, not once handlers have run. With
    /// `wait_for_confirmation` the call also waits for the backend's own
    /// enqueue acknowledgement.
    async fn publish(&self, message: Message, wait_for_confirmation: bool) -> Result<MessageId>;

    /// Register a handler on a topic. Every subscription on a topic receives
    /// every non-reply message.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId>;

    /// Remove a subscription. Unknown ids are a no-op.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Publish `message` and wait for the reply carrying its correlation id.
    async fn request(&self, message: Message, timeout: Duration) -> Result<Message>;

    /// Priority-ordered, non-consuming snapshot of queued messages.
    async fn get_pending_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>>;

    async fn get_backpressure_stats(
        &self,
        _topic: Option<&str>,
    ) -> HashMap<String, BackpressureStats> {
        HashMap::new()
    }

    async fn get_queue_size(&self, _topic: &str) -> usize {
        0
    }
}
