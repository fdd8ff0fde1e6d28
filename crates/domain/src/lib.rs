//! Domain layer for the chat saga coordination core.
//!
//! This crate provides the aggregates the sagas mutate and the events they
//! publish:
//! - `ChatMessage`, the document persisted by the message saga
//! - `ChatRoom`, the relational aggregate whose metadata follows new messages
//! - `FriendRequest` and `Friendship`, mutated by the friend-request saga
//! - Domain events written to the outbox

pub mod error;
pub mod events;
pub mod friend;
pub mod message;
pub mod room;

pub use error::DomainError;
pub use events::{
    ChatEvent, DomainEvent, EVENT_NAMESPACE, FriendAddedEvent, MentionEvent, MessageSentEvent,
    qualified_event_type, simple_event_type,
};
pub use friend::{FriendRequest, FriendRequestSnapshot, FriendRequestStatus, Friendship};
pub use message::ChatMessage;
pub use room::{ChatRoom, LastMessage, RoomMember};
