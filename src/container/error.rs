//! Error types for container acquisition.

use thiserror::Error;

use crate::error::ConfigError;
use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::runtime::RuntimeError;

/// Result type for container acquisition.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that abort a container acquisition.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container never became ready within the readiness budget.
    #[error("Container '{name}' failed its readiness check after {attempts} attempts: {reason}")]
    ContainerCheckFailed {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// Engine error other than a benign naming/port race.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The creation lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The container started but could not be recorded for cleanup.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
