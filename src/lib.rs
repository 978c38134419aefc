//! # AgentBus
//!
//! `agentbus` is an in-process message bus for agent-to-agent communication.
//! Agents publish JSON payloads to topics, subscribe handlers, and exchange
//! request/reply pairs linked by correlation ids. Delivery is ordered by
//! priority lane and bounded per topic.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `message`: The message envelope and its priority lanes.
//! - `transport`: The contract every backend implements.
//! - `broker`: The in-process backend: priority queues, backpressure, delivery workers and reply routing.
//! - `dlq`: The dead-letter queue for failed and expired deliveries.
//! - `persistence`: Message stores (in memory and `sled`) used for status tracking and replay.
//! - `schema`: Payload validation per topic.
//! - `context`: Ambient trace propagation.
//! - `bus`: `MessageBus`, which composes all of the above.
//! - `config`: Loading settings from files and the environment.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod broker;
pub mod bus;
pub mod config;
pub mod context;
pub mod dlq;
pub mod message;
pub mod persistence;
pub mod schema;
pub mod transport;
pub mod utils;

pub use broker::{BrokerConfig, InMemoryBroker};
pub use bus::{MessageBus, MessageBusBuilder, PublishOptions};
pub use dlq::{DeadLetterEntry, DeadLetterQueue, DeadLetterReason};
pub use message::{Message, MessageId, Priority};
pub use transport::{MessageHandler, Transport, handler_fn};
pub use utils::{BusError, Result};
