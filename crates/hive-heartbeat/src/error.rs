//! Error types for the heartbeat links.

use thiserror::Error;

use hive_state::StateError;

/// Result type alias for heartbeat operations.
pub type HeartbeatResult<T> = Result<T, HeartbeatError>;

/// Errors raised by transports, codecs and the merger.
///
/// Only `Config` is fatal, and only to the link that raised it.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("link configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("relay returned status {status}: {message}")]
    Relay { status: i64, message: String },

    #[error("device error: {0}")]
    Device(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("channel closed")]
    Closed,
}

impl From<serde_json::Error> for HeartbeatError {
    fn from(e: serde_json::Error) -> Self {
        HeartbeatError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for HeartbeatError {
    fn from(e: base64::DecodeError) -> Self {
        HeartbeatError::Decode(e.to_string())
    }
}
