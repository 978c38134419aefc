//! The `message` module defines the envelope every agent exchanges over the bus
//! and the priority lanes used to rank it.

pub mod envelope;
pub mod priority;

pub use envelope::{Message, MessageId, new_id};
pub use priority::Priority;
