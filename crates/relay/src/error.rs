//! Relay error types.

use store::StoreError;
use thiserror::Error;

/// Errors that can occur while relaying outbox events to the broker.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No registry entry matches the event type.
    #[error("Unknown event type: {event_type} (schema v{version})")]
    UnknownEventType { event_type: String, version: u32 },

    /// The payload does not decode as the registered event.
    #[error("Failed to decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A capture record carries no saga ID in its key or headers.
    #[error("Capture record on topic '{topic}' has no saga ID")]
    MissingSagaId { topic: String },

    /// The broker rejected a publish.
    #[error("Broker publish to '{topic}' failed: {reason}")]
    Broker { topic: String, reason: String },

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Returns true if the record can never be relayed as-is.
    ///
    /// Such records are logged and left unprocessed instead of being redelivered.
    pub fn is_unrelayable(&self) -> bool {
        matches!(
            self,
            RelayError::UnknownEventType { .. }
                | RelayError::Decode { .. }
                | RelayError::MissingSagaId { .. }
        )
    }
}

/// Convenience type alias for relay results.
pub type Result<T> = std::result::Result<T, RelayError>;
