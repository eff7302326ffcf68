//! Error types for the batch write coordinator.

use thiserror::Error;

/// Errors raised while validating or mutating coordinator configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("configuration cannot change after the coordinator has started")]
    AlreadyStarted,
}

/// Error raised when closing a document's content or metadata handle fails.
#[derive(Debug, Clone, Error)]
#[error("failed to close handle: {0}")]
pub struct CloseError(pub String);

/// Main error type for coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("operation requires the coordinator to be started")]
    State,

    #[error("coordinator has been stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("retry failed during failover resubmission: {0}")]
    RetryFailed(String),
}

impl CoordinatorError {
    /// Whether this error originated from the transport layer (a `HostClient`
    /// write failure), as opposed to coordinator-level state/config errors.
    pub fn is_transport(&self) -> bool {
        matches!(self, CoordinatorError::Transport(_))
    }
}
