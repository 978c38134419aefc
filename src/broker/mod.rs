//! The `broker` module contains the in-process delivery engine: bounded
//! per-topic priority queues, backpressure and eviction, per-topic delivery
//! workers and request/reply correlation.

pub mod engine;
pub mod queue;
pub mod topic;

pub use engine::{BrokerConfig, InMemoryBroker};
pub use queue::{PriorityQueue, QueueEntry};
