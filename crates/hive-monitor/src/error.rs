//! Monitor error types.

use thiserror::Error;

use hive_state::StateError;

/// Result type alias for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Errors raised by the engine and its collaborators.
///
/// None of these stop the engine: a failed action becomes a failed
/// instance status, anything else is logged and retried on the next pass.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("{action} failed on {path}: {message}")]
    Action {
        path: String,
        action: String,
        message: String,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
