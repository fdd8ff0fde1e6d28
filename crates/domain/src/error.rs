//! Domain error types.

use common::UserId;
use thiserror::Error;

use crate::friend::FriendRequestStatus;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The friend request is not in a state that allows the transition.
    #[error("Invalid friend request transition: cannot {action} from {current} status")]
    InvalidStatusTransition {
        current: FriendRequestStatus,
        action: &'static str,
    },

    /// Only the receiver of a friend request may accept it.
    #[error("User {user_id} is not the receiver of this friend request")]
    NotReceiver { user_id: UserId },

    /// The user is not a member of the chat room.
    #[error("User {user_id} is not a member of the chat room")]
    MemberNotFound { user_id: UserId },

    /// The message has not been assigned an ID by the document store yet.
    #[error("Message has not been persisted")]
    MessageNotPersisted,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
