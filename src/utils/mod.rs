//! The `utils` module provides definitions shared across the `agentbus` crate:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{BusError, Result};
