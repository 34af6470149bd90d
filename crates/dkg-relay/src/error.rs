//! Error types for relay operations

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the relay
///
/// Only the registry and publishing errors ever reach a caller. Delivery
/// errors are produced and logged inside the egress workers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Topic does not exist
    #[error("topic with name {0} not found")]
    TopicNotFound(String),

    /// Subscriber is not registered
    #[error("subscriber {0} not found")]
    SubscriberNotFound(String),

    /// Envelope could not be decoded far enough to route it
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    /// Non-200 response or transport error from a subscriber
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Message abandoned after the retry budget was spent
    #[error("retries exhausted for subscriber {subscriber} after {attempts} attempts")]
    RetriesExhausted { subscriber: String, attempts: u32 },

    /// Malformed request from a caller
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Relay is no longer accepting work
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(e: base64::DecodeError) -> Self {
        RelayError::Decode(e.to_string())
    }
}
