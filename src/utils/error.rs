//! The `error` module defines the error taxonomy shared by every part of the bus.
//!
//! Validation and capacity errors are raised synchronously before a message is
//! enqueued. Handler errors never reach publishers; they surface as dead-letter
//! entries when a DLQ is configured.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by bus, broker, DLQ and store operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// An operation was attempted while the transport was not connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// A payload was rejected by the schema registered for its topic.
    #[error("schema validation failed for topic '{topic}': {reason}")]
    SchemaValidation { topic: String, reason: String },

    /// The topic queue is full and holds no BACKGROUND entry to evict.
    #[error("queue for topic '{topic}' is full ({max_size} messages) and has no evictable entry")]
    CapacityExceeded { topic: String, max_size: usize },

    /// No reply arrived before the request deadline.
    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    /// The bus was asked to do something its configuration cannot support.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A subscriber handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("dead letter entry '{0}' not found")]
    DeadLetterNotFound(String),

    /// A dead-letter entry already used up its retries.
    #[error("message '{message_id}' already reached the retry limit of {max_retries}")]
    RetryLimitExceeded {
        message_id: String,
        max_retries: u32,
    },

    /// Another retry of the same dead-letter entry is still running.
    #[error("dead letter entry '{0}' is already being retried")]
    RetryInProgress(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sled::Error> for BusError {
    fn from(err: sled::Error) -> Self {
        BusError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for BusError {
    fn from(err: config::ConfigError) -> Self {
        BusError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
