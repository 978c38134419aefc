//! Broker engine
//!
//! `InMemoryBroker` implements [`Transport`] inside a single process:
//! - every topic owns a bounded priority queue and, once something is
//!   published to it, one background delivery worker
//! - publishers are throttled when a queue crosses the backpressure threshold;
//!   a full queue sheds its oldest BACKGROUND entry or rejects the publish
//! - a worker pops the highest-priority, oldest entry and either routes it to
//!   the request awaiting that reply or fans it out to every subscriber as
//!   independent tasks
//!
//! Concurrency and lifetime notes:
//! - workers and handler tasks are spawned on one `TaskTracker` and observe
//!   one `CancellationToken`; `disconnect` cancels the token and waits for the
//!   tracker, so no handler runs after it returns
//! - while a topic has no subscribers its worker only takes awaited replies
//!   out of the queue; everything else stays visible to
//!   `get_pending_messages`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broker::queue::QueueEntry;
use crate::broker::topic::Topic;
use crate::config::BrokerSettings;
use crate::message::{Message, MessageId, new_id};
use crate::transport::{BackpressureStats, MessageHandler, SubscriptionId, Transport};
use crate::utils::{BusError, Result};

/// Tuning knobs for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of each topic queue.
    pub max_queue_size: usize,
    /// Fill ratio at or above which publishers are throttled.
    pub backpressure_threshold: f64,
    pub backpressure_delay: Duration,
    /// How long an idle worker sleeps before re-checking its queue.
    pub idle_poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            backpressure_threshold: 0.8,
            backpressure_delay: Duration::from_millis(10),
            idle_poll_interval: Duration::from_millis(10),
        }
    }
}

impl From<&BrokerSettings> for BrokerConfig {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            max_queue_size: settings.max_queue_size,
            backpressure_threshold: settings.backpressure_threshold,
            backpressure_delay: Duration::from_millis(settings.backpressure_delay_ms),
            idle_poll_interval: Duration::from_millis(settings.idle_poll_ms),
        }
    }
}

/// A request waiting for its reply.
struct PendingRequest {
    /// Id of the outbound request, which must never be mistaken for its reply.
    request_id: MessageId,
    reply_tx: oneshot::Sender<Message>,
}

/// Removes a pending request on every exit path of `request`, including
/// cancellation of the calling future.
struct PendingGuard {
    pending: Arc<DashMap<String, PendingRequest>>,
    correlation_id: String,
    request_id: MessageId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.correlation_id, |_, p| p.request_id == self.request_id);
    }
}

enum Delivery {
    Reply(oneshot::Sender<Message>, Message),
    Fanout(QueueEntry),
}

struct BrokerInner {
    config: BrokerConfig,
    connected: AtomicBool,
    topics: DashMap<String, Arc<Topic>>,
    /// subscription id -> topic name
    subscriptions: DashMap<SubscriptionId, String>,
    /// correlation id -> waiting request
    pending: Arc<DashMap<String, PendingRequest>>,
    cancel: Mutex<CancellationToken>,
    tracker: TaskTracker,
}

impl BrokerInner {
    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn awaits_reply(&self, message: &Message) -> bool {
        message
            .correlation_id
            .as_ref()
            .and_then(|cid| self.pending.get(cid))
            .is_some_and(|pending| pending.request_id != message.id)
    }

    fn claim_reply(&self, message: &Message) -> Option<PendingRequest> {
        let cid = message.correlation_id.as_ref()?;
        self.pending
            .remove_if(cid, |_, pending| pending.request_id != message.id)
            .map(|(_, pending)| pending)
    }

    fn next_delivery(&self, topic: &Topic) -> Option<Delivery> {
        let has_subscribers = topic.has_subscribers();
        let entry = {
            let mut queue = topic.queue();
            if has_subscribers {
                queue.pop()
            } else {
                queue.take_first(|message| self.awaits_reply(message))
            }
        }?;

        match self.claim_reply(&entry.message) {
            Some(pending) => Some(Delivery::Reply(pending.reply_tx, entry.message)),
            None => Some(Delivery::Fanout(entry)),
        }
    }

    fn fan_out(&self, topic: &Topic, entry: QueueEntry, cancel: &CancellationToken) {
        let handlers = topic.handlers();
        if handlers.is_empty() {
            let message_id = entry.message.id.clone();
            if topic.requeue(entry) {
                debug!(topic = %topic.name, message_id = %message_id, "Subscribers left before delivery, message requeued");
            } else {
                warn!(topic = %topic.name, message_id = %message_id, "Subscribers left and queue is full, message dropped");
            }
            return;
        }
        topic.record_delivered();
        let message = entry.message;

        for handler in handlers {
            let message = message.clone();
            let message_id = message.id.clone();
            let topic_name = topic.name.clone();
            let cancel = cancel.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(topic = %topic_name, message_id = %message_id, "Handler cancelled");
                    }
                    result = handler(message) => {
                        if let Err(err) = result {
                            let error = format!("{err:#}");
                            warn!(topic = %topic_name, message_id = %message_id, %error, "Subscriber handler failed");
                        }
                    }
                }
            });
        }
    }
}

async fn run_worker(inner: Arc<BrokerInner>, topic: Arc<Topic>, cancel: CancellationToken) {
    debug!(topic = %topic.name, "Delivery worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match inner.next_delivery(&topic) {
            Some(Delivery::Reply(reply_tx, message)) => {
                topic.record_delivered();
                if reply_tx.send(message).is_err() {
                    debug!(topic = %topic.name, "Requester went away before its reply arrived");
                }
            }
            Some(Delivery::Fanout(entry)) => inner.fan_out(&topic, entry, &cancel),
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = topic.notify.notified() => {}
                    _ = tokio::time::sleep(inner.config.idle_poll_interval) => {}
                }
            }
        }
    }
    debug!(topic = %topic.name, "Delivery worker stopped");
}

/// In-process implementation of [`Transport`].
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                connected: AtomicBool::new(false),
                topics: DashMap::new(),
                subscriptions: DashMap::new(),
                pending: Arc::new(DashMap::new()),
                cancel: Mutex::new(CancellationToken::new()),
                tracker: TaskTracker::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Names of every topic that currently has a queue.
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.iter().map(|t| t.key().clone()).collect()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Connection("broker is not connected".to_string()))
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.inner.config.max_queue_size)))
            .value()
            .clone()
    }

    fn ensure_worker(&self, topic: &Arc<Topic>) {
        if topic.claim_worker() {
            let cancel = self.inner.cancel_token();
            self.inner
                .tracker
                .spawn(run_worker(self.inner.clone(), topic.clone(), cancel));
        }
    }

    async fn enqueue(&self, message: Message) -> Result<MessageId> {
        let topic = self.topic(&message.topic);

        let fill_ratio = topic.queue().fill_ratio();
        if fill_ratio >= self.inner.config.backpressure_threshold {
            topic.record_backpressure();
            debug!(topic = %topic.name, fill_ratio, "Applying backpressure to publisher");
            tokio::time::sleep(self.inner.config.backpressure_delay).await;
            self.ensure_connected()?;
        }

        let message_id = message.id.clone();
        {
            let mut queue = topic.queue();
            if queue.is_full() {
                match queue.evict_oldest_background() {
                    Some(evicted) => {
                        topic.record_eviction();
                        warn!(
                            topic = %topic.name,
                            evicted_id = %evicted.message.id,
                            "Queue full, evicted oldest BACKGROUND message"
                        );
                    }
                    None => {
                        return Err(BusError::CapacityExceeded {
                            topic: topic.name.clone(),
                            max_size: queue.max_size(),
                        });
                    }
                }
            }
            queue.push(message);
        }

        topic.record_published();
        self.ensure_worker(&topic);
        topic.notify.notify_one();
        Ok(message_id)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        *self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) =
            CancellationToken::new();
        self.inner.tracker.reopen();
        self.inner.topics.clear();
        self.inner.connected.store(true, Ordering::SeqCst);
        info!("In-memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel_token().cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        for topic in self.inner.topics.iter() {
            topic.queue().clear();
        }
        self.inner.topics.clear();
        self.inner.subscriptions.clear();
        // dropping the reply senders wakes any request still waiting
        self.inner.pending.clear();

        info!("In-memory broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: Message, wait_for_confirmation: bool) -> Result<MessageId> {
        self.ensure_connected()?;
        let topic = message.topic.clone();
        let priority = message.priority;
        let message_id = self.enqueue(message).await?;
        if wait_for_confirmation {
            // enqueue is the broker-level acknowledgement for this backend
            debug!(topic = %topic, message_id = %message_id, "Enqueue confirmed");
        }
        debug!(topic = %topic, message_id = %message_id, %priority, "Message published");
        Ok(message_id)
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        self.ensure_connected()?;
        let subscription_id = new_id();
        self.topic(topic).subscribe(subscription_id.clone(), handler);
        self.inner
            .subscriptions
            .insert(subscription_id.clone(), topic.to_string());
        info!(topic, subscription_id = %subscription_id, "Subscribed");
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        match self.inner.subscriptions.remove(subscription_id) {
            Some((_, topic_name)) => {
                if let Some(topic) = self.inner.topics.get(&topic_name) {
                    topic.unsubscribe(subscription_id);
                }
                info!(topic = %topic_name, subscription_id, "Unsubscribed");
            }
            None => debug!(subscription_id, "Unsubscribe for unknown subscription ignored"),
        }
        Ok(())
    }

    async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message> {
        self.ensure_connected()?;
        let correlation_id = message.correlation_id.get_or_insert_with(new_id).clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        match self.inner.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                return Err(BusError::Configuration(format!(
                    "correlation id '{correlation_id}' already has a request in flight"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    request_id: message.id.clone(),
                    reply_tx,
                });
            }
        }
        let _guard = PendingGuard {
            pending: self.inner.pending.clone(),
            correlation_id: correlation_id.clone(),
            request_id: message.id.clone(),
        };

        self.publish(message, false).await?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Connection(
                "broker disconnected while awaiting reply".to_string(),
            )),
            Err(_) => {
                debug!(correlation_id = %correlation_id, ?timeout, "Request timed out");
                Err(BusError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    async fn get_pending_messages(&self, topic: &str, limit: usize) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .topics
            .get(topic)
            .map(|t| t.queue().snapshot(limit))
            .unwrap_or_default())
    }

    async fn get_backpressure_stats(&self, topic: Option<&str>) -> HashMap<String, BackpressureStats> {
        self.inner
            .topics
            .iter()
            .filter(|t| topic.is_none_or(|name| name == t.key()))
            .map(|t| (t.key().clone(), t.value().stats()))
            .collect()
    }

    async fn get_queue_size(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.queue().len())
            .unwrap_or(0)
    }
}

impl Drop for InMemoryBroker {
    fn drop(&mut self) {
        // stop workers that would otherwise outlive the last handle
        self.inner.cancel_token().cancel();
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connected", &self.is_connected())
            .field("topics", &self.inner.topics.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("pending_requests", &self.inner.pending.len())
            .finish()
    }
}
