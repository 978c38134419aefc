//! Topic state
//!
//! A `Topic` owns the bounded priority queue, the subscriber set and the
//! counters for one topic name. Only the topic's own publish, subscribe and
//! unsubscribe calls and its delivery worker touch it, so no cross-topic
//! locking is needed.
//!
//! Locks here are never held across an `.await`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::Notify;

use crate::broker::queue::{PriorityQueue, QueueEntry};
use crate::transport::{BackpressureStats, MessageHandler, SubscriptionId};

pub struct Topic {
    pub name: String,
    queue: Mutex<PriorityQueue>,
    subscribers: RwLock<Vec<(SubscriptionId, MessageHandler)>>,
    /// Wakes the delivery worker after a publish or a new subscription.
    pub(crate) notify: Notify,
    worker_started: AtomicBool,
    backpressure_events: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl Topic {
    pub fn new(name: &str, max_size: usize) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(PriorityQueue::new(max_size)),
            subscribers: RwLock::new(Vec::new()),
            notify: Notify::new(),
            worker_started: AtomicBool::new(false),
            backpressure_events: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber. Re-using an id replaces its handler.
    pub fn subscribe(&self, id: SubscriptionId, handler: MessageHandler) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(existing, _)| existing != &id);
        subscribers.push((id, handler));
        drop(subscribers);
        self.notify.notify_one();
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| existing != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Snapshot of the current handlers, in subscription order.
    pub fn handlers(&self) -> Vec<MessageHandler> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Returns true exactly once: for the caller that must spawn the worker.
    pub(crate) fn claim_worker(&self) -> bool {
        self.worker_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Return an entry whose subscribers went away between pop and fan-out.
    ///
    /// It keeps its place in line. If publishers filled the slot meanwhile
    /// the entry is dropped and counted; returns whether it was kept.
    pub(crate) fn requeue(&self, entry: QueueEntry) -> bool {
        match self.queue().restore(entry) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackpressureStats {
        let (queue_size, max_size, fill_ratio) = {
            let queue = self.queue();
            (queue.len(), queue.max_size(), queue.fill_ratio())
        };
        BackpressureStats {
            queue_size,
            max_size,
            fill_ratio,
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("queue_size", &self.queue().len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
