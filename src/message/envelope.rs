//! Message envelope
//!
//! `Message` is the canonical in-process and wire representation used by the
//! bus. It is a plain value: the broker never mutates a message after it has
//! been enqueued.
//!
//! Notes on fields:
//! - `id`: unique within a broker instance; generated when not supplied
//! - `payload`: opaque JSON value
//! - `timestamp`: creation time, used for TTL and replay ordering
//! - `correlation_id` / `reply_to`: request/reply linkage
//! - `ttl`: serialised as integer milliseconds (`ttl_ms`)
//! - `trace_id` / `span_id` / `parent_span_id`: distributed trace linkage

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::priority::Priority;
use crate::utils::Result;

pub type MessageId = String;

/// Generates a fresh opaque identifier for messages and correlation ids.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        rename = "ttl_ms",
        with = "ttl_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a NORMAL priority message with a generated id and the current time.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: new_id(),
            topic: topic.into(),
            payload,
            priority: Priority::Normal,
            sender: None,
            correlation_id: None,
            reply_to: None,
            timestamp: Utc::now(),
            ttl: None,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_trace(
        mut self,
        trace_id: impl Into<String>,
        span_id: Option<String>,
        parent_span_id: Option<String>,
    ) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = span_id;
        self.parent_span_id = parent_span_id;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Time elapsed since the message was created. Clock skew into the future
    /// counts as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }

    /// `max(0, ttl - age)`, or `None` when the message never expires.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.ttl.map(|ttl| ttl.saturating_sub(self.age()))
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.age() > ttl,
            None => false,
        }
    }

    /// True when the message carries a correlation id.
    ///
    /// Requests and their replies share the id, so this does not tell them
    /// apart; only the broker knows which message a pending request awaits.
    pub fn has_correlation(&self) -> bool {
        self.correlation_id.is_some()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod ttl_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
