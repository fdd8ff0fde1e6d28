//! Saga error types.

use common::{FriendRequestId, RoomId, SagaId};
use domain::DomainError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A saga step reported failure.
    #[error("Saga step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// A compensation step failed.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// A step that must join an open transaction found none on the context.
    #[error("Step '{step}' requires an open transaction but none was started")]
    NoOpenTransaction { step: &'static str },

    /// The saga task was cancelled by the runtime before it finished.
    #[error("Saga {saga_id} was interrupted")]
    Interrupted { saga_id: SagaId },

    /// Chat room not found.
    #[error("Chat room not found: {0}")]
    RoomNotFound(RoomId),

    /// Friend request not found.
    #[error("Friend request not found: {0}")]
    FriendRequestNotFound(FriendRequestId),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the failure was an optimistic concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, SagaError::Store(e) if e.is_version_conflict())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
