//! Error types shared across the crate.
//!
//! Each concern keeps its own error enum next to the code that produces it
//! ([`RuntimeError`], [`LockError`], [`LedgerError`]); [`ContainerError`] is
//! what the coordinator surfaces to callers.

use thiserror::Error;

pub use crate::container::error::ContainerError;
pub use crate::ledger::LedgerError;
pub use crate::lock::LockError;
pub use crate::probe::NotReady;
pub use crate::runtime::RuntimeError;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was set to something unusable.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Could not reserve a free host port for a dynamically-ported container.
    #[error("Failed to reserve a free host port: {0}")]
    PortReservation(#[source] std::io::Error),
}
