//! Dead-letter queue
//!
//! A capacity-bounded map of message id to [`DeadLetterEntry`] with a
//! secondary topic index. Insertion order decides eviction: when the queue is
//! full the oldest entry is dropped to make room.
//!
//! Every mutation goes through one mutex so the capacity invariant holds under
//! concurrent adds. Retry handlers run outside that lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dlq::entry::{DeadLetterEntry, DeadLetterReason};
use crate::message::MessageId;
use crate::transport::MessageHandler;
use crate::utils::{BusError, Result};

/// Observer invoked after every add. Its failures are logged and swallowed.
pub type OnAddCallback = Arc<dyn Fn(&DeadLetterEntry) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub max_size: usize,
    pub max_retries: u32,
    pub by_reason: HashMap<DeadLetterReason, usize>,
    pub by_topic: HashMap<String, usize>,
}

#[derive(Default)]
struct DlqState {
    entries: HashMap<MessageId, DeadLetterEntry>,
    /// insertion order, oldest first
    order: VecDeque<MessageId>,
    by_topic: HashMap<String, Vec<MessageId>>,
    /// ids whose retry handler is running
    in_retry: HashSet<MessageId>,
}

impl DlqState {
    fn insert(&mut self, entry: DeadLetterEntry) {
        let id = entry.message.id.clone();
        self.order.push_back(id.clone());
        self.by_topic
            .entry(entry.original_topic.clone())
            .or_default()
            .push(id.clone());
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &str) -> Option<DeadLetterEntry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        if let Some(ids) = self.by_topic.get_mut(&entry.original_topic) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_topic.remove(&entry.original_topic);
            }
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<DeadLetterEntry> {
        let oldest = self.order.front()?.clone();
        self.remove(&oldest)
    }
}

/// Holds an entry's retry slot; released when dropped, including when the
/// retrying future is cancelled.
struct RetryReservation<'a> {
    queue: &'a DeadLetterQueue,
    message_id: &'a str,
}

impl Drop for RetryReservation<'_> {
    fn drop(&mut self) {
        self.queue.lock().in_retry.remove(self.message_id);
    }
}

pub struct DeadLetterQueue {
    state: Mutex<DlqState>,
    max_size: usize,
    max_retries: u32,
    on_add: Option<OnAddCallback>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SIZE, Self::DEFAULT_MAX_RETRIES)
    }
}

impl DeadLetterQueue {
    pub const DEFAULT_MAX_SIZE: usize = 10_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(max_size: usize, max_retries: u32) -> Self {
        Self {
            state: Mutex::new(DlqState::default()),
            max_size,
            max_retries,
            on_add: None,
        }
    }

    pub fn with_on_add<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DeadLetterEntry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_add = Some(Arc::new(callback));
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn lock(&self) -> MutexGuard<'_, DlqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entry, evicting the oldest one when the queue is full.
    ///
    /// Adding an id that is already present replaces the old entry without
    /// evicting anything. Returns the evicted entry, if any.
    pub fn add(&self, entry: DeadLetterEntry) -> Option<DeadLetterEntry> {
        if self.max_size == 0 {
            warn!(message_id = %entry.message.id, "Dead-letter queue has zero capacity, entry dropped");
            return None;
        }

        let observed = self.on_add.as_ref().map(|_| entry.clone());
        let evicted = {
            let mut state = self.lock();
            state.remove(&entry.message.id);
            let evicted = if state.entries.len() >= self.max_size {
                state.evict_oldest()
            } else {
                None
            };
            info!(
                message_id = %entry.message.id,
                topic = %entry.original_topic,
                reason = %entry.reason,
                error = %entry.error,
                "Message dead-lettered"
            );
            state.insert(entry);
            evicted
        };

        if let Some(evicted) = &evicted {
            warn!(message_id = %evicted.message.id, "Dead-letter queue full, evicted oldest entry");
        }

        if let (Some(callback), Some(entry)) = (&self.on_add, observed) {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&entry))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(message_id = %entry.message.id, error = %err, "Dead-letter callback failed")
                }
                Err(_) => error!(message_id = %entry.message.id, "Dead-letter callback panicked"),
            }
        }

        evicted
    }

    pub fn get(&self, message_id: &str) -> Option<DeadLetterEntry> {
        self.lock().entries.get(message_id).cloned()
    }

    pub fn remove(&self, message_id: &str) -> Option<DeadLetterEntry> {
        self.lock().remove(message_id)
    }

    /// Drop every entry, or only those of one topic. Returns how many were removed.
    pub fn clear(&self, topic: Option<&str>) -> usize {
        let mut state = self.lock();
        match topic {
            None => {
                let removed = state.entries.len();
                let in_retry = std::mem::take(&mut state.in_retry);
                *state = DlqState {
                    in_retry,
                    ..DlqState::default()
                };
                removed
            }
            Some(topic) => {
                let ids = state.by_topic.get(topic).cloned().unwrap_or_default();
                ids.iter().filter(|id| state.remove(id).is_some()).count()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-run `handler` on a stored message.
    ///
    /// Returns `Ok(true)` and removes the entry when the handler succeeds,
    /// `Ok(false)` after recording a failed attempt. Entries that already used
    /// up their retries are refused with [`BusError::RetryLimitExceeded`], and
    /// a second concurrent retry of one entry with [`BusError::RetryInProgress`].
    pub async fn retry(&self, message_id: &str, handler: &MessageHandler) -> Result<bool> {
        let (message, _reservation) = {
            let mut state = self.lock();
            let entry = state
                .entries
                .get(message_id)
                .ok_or_else(|| BusError::DeadLetterNotFound(message_id.to_string()))?;
            if entry.retry_count >= self.max_retries {
                return Err(BusError::RetryLimitExceeded {
                    message_id: message_id.to_string(),
                    max_retries: self.max_retries,
                });
            }
            let message = entry.message.clone();
            if !state.in_retry.insert(message_id.to_string()) {
                return Err(BusError::RetryInProgress(message_id.to_string()));
            }
            (
                message,
                RetryReservation {
                    queue: self,
                    message_id,
                },
            )
        };

        let outcome = handler(message).await;

        let mut state = self.lock();
        match outcome {
            Ok(()) => {
                state.remove(message_id);
                info!(message_id, "Dead-letter retry succeeded");
                Ok(true)
            }
            Err(err) => {
                let Some(entry) = state.entries.get_mut(message_id) else {
                    debug!(message_id, "Entry removed while its retry was running");
                    return Ok(false);
                };
                if entry.retry_count >= self.max_retries {
                    return Err(BusError::RetryLimitExceeded {
                        message_id: message_id.to_string(),
                        max_retries: self.max_retries,
                    });
                }
                entry.retry_count += 1;
                entry.error = format!("{err:#}");
                entry.last_retry_at = Some(Utc::now());
                if entry.retry_count >= self.max_retries {
                    entry.reason = DeadLetterReason::MaxRetries;
                    warn!(message_id, retries = entry.retry_count, "Dead-letter entry reached retry limit");
                } else {
                    debug!(message_id, retries = entry.retry_count, error = %entry.error, "Dead-letter retry failed");
                }
                Ok(false)
            }
        }
    }

    /// Retry every entry, or every entry of one topic, oldest first.
    ///
    /// Not transactional: each entry succeeds or fails on its own. Entries that
    /// cannot be retried report `false`.
    pub async fn retry_all(
        &self,
        handler: &MessageHandler,
        topic: Option<&str>,
    ) -> HashMap<MessageId, bool> {
        let ids: Vec<MessageId> = {
            let state = self.lock();
            match topic {
                Some(topic) => state.by_topic.get(topic).cloned().unwrap_or_default(),
                None => state.order.iter().cloned().collect(),
            }
        };

        let mut results = HashMap::with_capacity(ids.len());
        for id in ids {
            let succeeded = self.retry(&id, handler).await.unwrap_or(false);
            results.insert(id, succeeded);
        }
        results
    }

    /// Filtered entries, newest first, paginated by `offset` and `limit`.
    pub fn get_entries(
        &self,
        topic: Option<&str>,
        reason: Option<DeadLetterReason>,
        limit: usize,
        offset: usize,
    ) -> Vec<DeadLetterEntry> {
        let state = self.lock();
        let mut entries: Vec<DeadLetterEntry> = match topic {
            Some(topic) => state
                .by_topic
                .get(topic)
                .map(|ids| ids.iter().filter_map(|id| state.entries.get(id)).cloned().collect())
                .unwrap_or_default(),
            None => state.entries.values().cloned().collect(),
        };
        drop(state);

        if let Some(reason) = reason {
            entries.retain(|e| e.reason == reason);
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.into_iter().skip(offset).take(limit).collect()
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.lock();
        let mut by_reason: HashMap<DeadLetterReason, usize> =
            DeadLetterReason::ALL.into_iter().map(|r| (r, 0)).collect();
        for entry in state.entries.values() {
            *by_reason.entry(entry.reason).or_default() += 1;
        }
        let by_topic = state
            .by_topic
            .iter()
            .map(|(topic, ids)| (topic.clone(), ids.len()))
            .collect();

        DeadLetterStats {
            total: state.entries.len(),
            max_size: self.max_size,
            max_retries: self.max_retries,
            by_reason,
            by_topic,
        }
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
