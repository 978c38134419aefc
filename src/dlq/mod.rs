//! The `dlq` module stores deliveries that failed or expired so they can be
//! inspected, retried or discarded.

pub mod entry;
pub mod queue;

pub use entry::{DeadLetterEntry, DeadLetterReason};
pub use queue::{DeadLetterQueue, DeadLetterStats, OnAddCallback};

#[cfg(test)]
mod tests;
