//! Error types for the hive state model.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or mutating a state tree.
#[derive(Debug, Error)]
pub enum StateError {
    /// A path traverses a missing or non-map node.
    #[error("structural error at {path}")]
    Structural { path: String },

    #[error("empty path")]
    EmptyPath,

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

impl StateError {
    pub(crate) fn structural<S: AsRef<str>>(path: &[S]) -> Self {
        StateError::Structural {
            path: path
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join("."),
        }
    }
}
