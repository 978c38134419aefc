//! The `bus` module is the entry point agents use.
//!
//! [`MessageBus`] composes one [`Transport`] with the optional collaborators
//! around it:
//!
//! - a [`SchemaRegistry`] that validates payloads before anything is enqueued
//! - a [`TraceContext`] whose ambient trace is stamped on outgoing messages
//! - a [`MessageStore`] that records delivery progress (best effort)
//! - a [`DeadLetterQueue`] that absorbs handler failures and expired messages
//!
//! The bus is an explicit instance; share it by reference or `Arc`.

mod options;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, InMemoryBroker};
use crate::config::Settings;
use crate::context::{TaskLocalTraceContext, TraceContext};
use crate::dlq::{DeadLetterEntry, DeadLetterQueue, DeadLetterReason};
use crate::message::{Message, MessageId, new_id};
use crate::persistence::{MessageStatus, MessageStore, SledMessageStore};
use crate::schema::SchemaRegistry;
use crate::transport::{BackpressureStats, MessageHandler, SubscriptionId, Transport, handler_fn};
use crate::utils::{BusError, Result};

pub use options::PublishOptions;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MessageBus {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn MessageStore>>,
    schemas: Option<Arc<SchemaRegistry>>,
    dlq: Option<Arc<DeadLetterQueue>>,
    trace_context: Arc<dyn TraceContext>,
    auto_inject_trace: bool,
    request_timeout: Duration,
    sender: Option<String>,
}

pub struct MessageBusBuilder {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn MessageStore>>,
    schemas: Option<Arc<SchemaRegistry>>,
    dlq: Option<Arc<DeadLetterQueue>>,
    trace_context: Arc<dyn TraceContext>,
    auto_inject_trace: bool,
    request_timeout: Duration,
    sender: Option<String>,
}

impl MessageBusBuilder {
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn trace_context(mut self, trace_context: Arc<dyn TraceContext>) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn auto_inject_trace(mut self, enabled: bool) -> Self {
        self.auto_inject_trace = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Default `sender` stamped on every message this bus publishes.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn build(self) -> MessageBus {
        MessageBus {
            transport: self.transport,
            store: self.store,
            schemas: self.schemas,
            dlq: self.dlq,
            trace_context: self.trace_context,
            auto_inject_trace: self.auto_inject_trace,
            request_timeout: self.request_timeout,
            sender: self.sender,
        }
    }
}

/// Record a status change, logging instead of failing.
async fn mark_status(
    store: Option<&Arc<dyn MessageStore>>,
    message_id: &str,
    status: MessageStatus,
    error: Option<String>,
) {
    let Some(store) = store else {
        return;
    };
    match store.update_status(message_id, status, error).await {
        Ok(true) => {}
        Ok(false) => debug!(message_id, ?status, "Status update ignored: message unknown or already further along"),
        Err(err) => warn!(message_id, ?status, error = %err, "Failed to update message status"),
    }
}

impl MessageBus {
    /// A bus over `transport` with no optional collaborators.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> MessageBusBuilder {
        MessageBusBuilder {
            transport,
            store: None,
            schemas: None,
            dlq: None,
            trace_context: Arc::new(TaskLocalTraceContext),
            auto_inject_trace: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sender: None,
        }
    }

    /// An in-memory bus configured from loaded settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let broker = InMemoryBroker::with_config(BrokerConfig::from(&settings.broker));
        let mut builder = Self::builder(Arc::new(broker))
            .auto_inject_trace(settings.bus.auto_inject_trace)
            .request_timeout(Duration::from_millis(settings.bus.request_timeout_ms));

        if let Some(sender) = &settings.bus.sender {
            builder = builder.sender(sender.clone());
        }
        if settings.dlq.enabled {
            builder = builder.dead_letter_queue(Arc::new(DeadLetterQueue::new(
                settings.dlq.max_size,
                settings.dlq.max_retries,
            )));
        }
        if settings.persistence.enabled {
            let store = SledMessageStore::open(
                &settings.persistence.path,
                settings.persistence.max_messages_per_topic,
            )?;
            info!(path = %settings.persistence.path, "Message persistence enabled");
            builder = builder.store(Arc::new(store));
        }
        Ok(builder.build())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    pub fn schemas(&self) -> Option<&Arc<SchemaRegistry>> {
        self.schemas.as_ref()
    }

    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn build_message(&self, topic: &str, payload: Value, options: PublishOptions) -> Result<Message> {
        let payload = match &self.schemas {
            Some(schemas) => schemas.validate(topic, payload)?,
            None => payload,
        };

        let mut message = Message::new(topic, payload).with_priority(options.priority);
        if let Some(id) = options.message_id {
            message.id = id;
        }
        message.sender = options.sender.or_else(|| self.sender.clone());
        message.correlation_id = options.correlation_id;
        message.reply_to = options.reply_to;
        message.ttl = options.ttl;
        message.metadata = options.metadata;

        match options.trace_id {
            Some(trace_id) => {
                message = message.with_trace(trace_id, Some(new_id()), options.parent_span_id);
            }
            None if self.auto_inject_trace => {
                if let Some(ambient) = self.trace_context.current_trace() {
                    let span = ambient.child();
                    message = message.with_trace(span.trace_id, Some(span.span_id), span.parent_span_id);
                }
            }
            None => {}
        }
        Ok(message)
    }

    async fn record_pending(&self, message: &Message) {
        if let Some(store) = &self.store {
            if let Err(err) = store.store(message).await {
                warn!(message_id = %message.id, topic = %message.topic, error = %err, "Failed to persist message");
            }
        }
    }

    /// Validate, stamp and publish a payload. Returns the new message id.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<MessageId> {
        let wait = options.wait_for_confirmation;
        let message = self.build_message(topic, payload, options)?;
        self.publish_message(message, wait).await
    }

    /// Publish an already-built message, recording it in the store first.
    pub async fn publish_message(&self, message: Message, wait_for_confirmation: bool) -> Result<MessageId> {
        self.record_pending(&message).await;
        let message_id = self.transport.publish(message, wait_for_confirmation).await?;
        mark_status(self.store.as_ref(), &message_id, MessageStatus::Delivered, None).await;
        Ok(message_id)
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// Expired messages are not handed to `handler`. Handler failures become
    /// dead-letter entries when a DLQ is configured and are returned to the
    /// transport otherwise.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        let dlq = self.dlq.clone();
        let store = self.store.clone();
        let topic_name = topic.to_string();

        let wrapped = handler_fn(move |message: Message| {
            let handler = handler.clone();
            let dlq = dlq.clone();
            let store = store.clone();
            let topic_name = topic_name.clone();
            async move {
                let message_id = message.id.clone();

                if message.is_expired() {
                    match &dlq {
                        Some(dlq) => {
                            dlq.add(DeadLetterEntry::new(
                                message,
                                DeadLetterReason::Expired,
                                "message expired before delivery",
                            ));
                            mark_status(store.as_ref(), &message_id, MessageStatus::DeadLettered, None).await;
                        }
                        None => debug!(message_id = %message_id, "Skipping expired message"),
                    }
                    return Ok(());
                }

                match handler(message.clone()).await {
                    Ok(()) => {
                        mark_status(store.as_ref(), &message_id, MessageStatus::Acknowledged, None).await;
                        Ok(())
                    }
                    Err(err) => {
                        let error = format!("{err:#}");
                        match &dlq {
                            Some(dlq) => {
                                dlq.add(
                                    DeadLetterEntry::new(message, DeadLetterReason::HandlerError, error.clone())
                                        .with_context(format!("{err:?}")),
                                );
                                mark_status(store.as_ref(), &message_id, MessageStatus::DeadLettered, Some(error))
                                    .await;
                                Ok(())
                            }
                            None => {
                                mark_status(store.as_ref(), &message_id, MessageStatus::Failed, Some(error)).await;
                                Err(err.context(BusError::Handler(format!(
                                    "subscriber on '{topic_name}' failed for message '{message_id}'"
                                ))))
                            }
                        }
                    }
                }
            }
        });

        self.transport.subscribe(topic, wrapped).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.transport.unsubscribe(subscription_id).await
    }

    /// Publish a request and wait for its reply.
    ///
    /// `timeout` falls back to the bus-wide request timeout.
    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        mut options: PublishOptions,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let correlation_id = options.correlation_id.get_or_insert_with(new_id).clone();
        let message = self.build_message(topic, payload, options)?;
        let message_id = message.id.clone();
        let timeout = timeout.unwrap_or(self.request_timeout);

        self.record_pending(&message).await;
        debug!(topic, correlation_id = %correlation_id, ?timeout, "Sending request");
        let reply = self.transport.request(message, timeout).await?;
        mark_status(self.store.as_ref(), &message_id, MessageStatus::Delivered, None).await;
        Ok(reply)
    }

    /// Answer `original`, routing to its `reply_to` topic or, failing that, to
    /// the topic it arrived on.
    pub async fn reply(
        &self,
        original: &Message,
        payload: Value,
        mut options: PublishOptions,
    ) -> Result<MessageId> {
        let Some(correlation_id) = original.correlation_id.clone() else {
            return Err(BusError::Configuration(format!(
                "cannot reply to message '{}': it has no correlation id",
                original.id
            )));
        };
        let topic = original.reply_to.as_deref().unwrap_or(&original.topic);

        options.correlation_id = Some(correlation_id);
        if options.trace_id.is_none() {
            options.trace_id = original.trace_id.clone();
            options.parent_span_id = original.span_id.clone();
        }
        self.publish(topic, payload, options).await
    }

    /// Feed stored messages of `topic` within `[from, to]` through `handler`
    /// in chronological order. Returns how many were handled successfully.
    pub async fn replay(
        &self,
        topic: &str,
        handler: MessageHandler,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let Some(store) = &self.store else {
            return Err(BusError::Configuration(
                "replay requires a message store".to_string(),
            ));
        };

        let mut messages = store.replay(topic, from, to).await?;
        let mut processed = 0;
        while let Some(message) = messages.next().await {
            let message_id = message.id.clone();
            match handler(message).await {
                Ok(()) => processed += 1,
                Err(err) => warn!(topic, message_id = %message_id, error = %err, "Replay handler failed"),
            }
        }
        info!(topic, processed, "Replay finished");
        Ok(processed)
    }

    fn republisher(&self) -> MessageHandler {
        let transport = self.transport.clone();
        handler_fn(move |message: Message| {
            let transport = transport.clone();
            async move {
                transport.publish(message, true).await?;
                Ok(())
            }
        })
    }

    fn require_dlq(&self) -> Result<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref().ok_or_else(|| {
            BusError::Configuration("no dead-letter queue is configured".to_string())
        })
    }

    /// Re-publish one dead-lettered message to its original topic.
    ///
    /// Returns `Ok(false)` when publishing failed again; the entry then stays
    /// in the queue with its retry count bumped.
    pub async fn requeue_dead_letter(&self, message_id: &str) -> Result<bool> {
        let dlq = self.require_dlq()?;
        dlq.retry(message_id, &self.republisher()).await
    }

    /// Re-publish every dead-lettered message, or those of one topic.
    pub async fn requeue_dead_letters(&self, topic: Option<&str>) -> Result<HashMap<MessageId, bool>> {
        let dlq = self.require_dlq()?;
        Ok(dlq.retry_all(&self.republisher(), topic).await)
    }

    pub async fn get_pending_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        self.transport.get_pending_messages(topic, limit).await
    }

    pub async fn get_queue_size(&self, topic: &str) -> usize {
        self.transport.get_queue_size(topic).await
    }

    pub async fn get_backpressure_stats(&self, topic: Option<&str>) -> HashMap<String, BackpressureStats> {
        self.transport.get_backpressure_stats(topic).await
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("connected", &self.is_connected())
            .field("store", &self.store.is_some())
            .field("schemas", &self.schemas)
            .field("dlq", &self.dlq)
            .field("auto_inject_trace", &self.auto_inject_trace)
            .field("request_timeout", &self.request_timeout)
            .field("sender", &self.sender)
            .finish()
    }
}

#[cfg(test)]
mod tests;
