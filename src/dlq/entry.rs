use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Why a message ended up in the dead-letter queue.
///
/// Unrecognised reasons deserialize as `Unknown` so they stay visible in the
/// stats instead of being folded into another bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    HandlerError,
    ValidationError,
    Expired,
    MaxRetries,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl DeadLetterReason {
    pub const ALL: [DeadLetterReason; 6] = [
        DeadLetterReason::HandlerError,
        DeadLetterReason::ValidationError,
        DeadLetterReason::Expired,
        DeadLetterReason::MaxRetries,
        DeadLetterReason::Rejected,
        DeadLetterReason::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::HandlerError => "HANDLER_ERROR",
            DeadLetterReason::ValidationError => "VALIDATION_ERROR",
            DeadLetterReason::Expired => "EXPIRED",
            DeadLetterReason::MaxRetries => "MAX_RETRIES",
            DeadLetterReason::Rejected => "REJECTED",
            DeadLetterReason::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub original_topic: String,
    /// Error chain captured at failure time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(message: Message, reason: DeadLetterReason, error: impl Into<String>) -> Self {
        let original_topic = message.topic.clone();
        Self {
            message,
            reason,
            error: error.into(),
            timestamp: Utc::now(),
            retry_count: 0,
            original_topic,
            context: None,
            last_retry_at: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message.id
    }
}
