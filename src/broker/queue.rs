//! Bounded per-topic priority queue
//!
//! Entries are ordered by priority lane (highest first) and, within a lane, by
//! the sequence number assigned when the entry was pushed. The sequence is
//! taken from a counter owned by the queue, so assignment and insertion happen
//! under the same lock and equal-priority entries keep publish order.
//!
//! The queue itself does not enforce `max_size`; the broker decides whether to
//! throttle, evict or reject before calling [`PriorityQueue::push`].

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::message::{Message, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<Priority>,
    sequence: u64,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: Priority,
    pub sequence: u64,
    pub message: Message,
}

#[derive(Debug)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, Message>,
    max_size: usize,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_size,
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// `len / max_size`; a zero-capacity queue is always full.
    pub fn fill_ratio(&self) -> f64 {
        if self.max_size == 0 {
            return 1.0;
        }
        self.entries.len() as f64 / self.max_size as f64
    }

    /// Insert a message and return the sequence number it was given.
    pub fn push(&mut self, message: Message) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let key = QueueKey {
            rank: Reverse(message.priority),
            sequence,
        };
        self.entries.insert(key, message);
        sequence
    }

    /// Put a popped entry back at its original position.
    ///
    /// Returns the entry when the queue is full.
    pub fn restore(&mut self, entry: QueueEntry) -> Result<(), QueueEntry> {
        if self.is_full() {
            return Err(entry);
        }
        let key = QueueKey {
            rank: Reverse(entry.priority),
            sequence: entry.sequence,
        };
        self.entries.insert(key, entry.message);
        Ok(())
    }

    /// Remove the highest-priority, oldest entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_first().map(Self::into_entry)
    }

    /// Remove the first entry, in delivery order, whose message matches `pred`.
    pub fn take_first<F>(&mut self, pred: F) -> Option<QueueEntry>
    where
        F: Fn(&Message) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, message)| pred(message))
            .map(|(key, _)| *key)?;
        self.entries.remove_entry(&key).map(Self::into_entry)
    }

    /// Remove the oldest BACKGROUND entry, if any.
    pub fn evict_oldest_background(&mut self) -> Option<QueueEntry> {
        let start = QueueKey {
            rank: Reverse(Priority::Background),
            sequence: 0,
        };
        let key = self.entries.range(start..).next().map(|(key, _)| *key)?;
        self.entries.remove_entry(&key).map(Self::into_entry)
    }

    /// Clone up to `limit` messages in delivery order without consuming them.
    pub fn snapshot(&self, limit: usize) -> Vec<Message> {
        self.entries.values().take(limit).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn into_entry((key, message): (QueueKey, Message)) -> QueueEntry {
        QueueEntry {
            priority: key.rank.0,
            sequence: key.sequence,
            message,
        }
    }
}
