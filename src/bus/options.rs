use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::message::{MessageId, Priority};

/// Per-call settings for [`MessageBus::publish`](super::MessageBus::publish),
/// `request` and `reply`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Overrides the bus-wide sender.
    pub sender: Option<String>,
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub ttl: Option<Duration>,
    /// Explicit trace id; disables ambient trace injection for this call.
    pub trace_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub wait_for_confirmation: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn wait_for_confirmation(mut self, wait: bool) -> Self {
        self.wait_for_confirmation = wait;
        self
    }
}
