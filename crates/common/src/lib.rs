//! Shared identifier types for the chat saga workspace.

mod types;

pub use types::{FriendRequestId, FriendshipId, MessageId, RoomId, SagaId, UserId};
