//! Error types for the container engine client.

use thiserror::Error;

/// Engine message when another container already publishes the host port.
pub const PORT_ALLOCATED: &str = "port is already allocated";
/// Tail of the engine message when the container name is taken.
pub const NAME_IN_USE: &str = "to be able to reuse that name";

/// Errors from the container engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The engine's control endpoint could not be reached.
    #[error("Container engine not reachable: {reason}")]
    Unreachable { reason: String },

    /// The name or host port is already claimed, usually by a concurrent
    /// creator of the same container.
    #[error("Container '{name}' conflicts with an existing one: {reason}")]
    Conflict { name: String, reason: String },

    /// No such container.
    #[error("Container '{name}' not found")]
    NotFound { name: String },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Any other engine API error.
    #[error("Container engine error: {reason}")]
    Api { reason: String },
}

impl RuntimeError {
    /// Classify an error response from the engine.
    ///
    /// Collisions are recognised by message rather than status code: Docker
    /// reports a taken name as 409 but a taken port as a 500 raised at start.
    pub fn from_response(name: &str, status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(PORT_ALLOCATED) || message.contains(NAME_IN_USE) {
            Self::Conflict {
                name: name.to_string(),
                reason: message,
            }
        } else if status_code == 404 {
            Self::NotFound {
                name: name.to_string(),
            }
        } else {
            Self::Api { reason: message }
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
