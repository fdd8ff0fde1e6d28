//! Domain events emitted through the outbox.

use chrono::{DateTime, Utc};
use common::{FriendRequestId, FriendshipId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::DomainError;
use crate::friend::Friendship;
use crate::message::ChatMessage;

/// Namespace prefixed to every event type name to form its fully-qualified name.
pub const EVENT_NAMESPACE: &str = "chat.domain.event";

/// Returns the fully-qualified name of an event type (`<namespace>.<Name>`).
pub fn qualified_event_type(name: &str) -> String {
    format!("{EVENT_NAMESPACE}.{name}")
}

/// Strips any namespace from an event type name.
///
/// `chat.domain.event.MessageSentEvent` and `MessageSentEvent` both yield
/// `MessageSentEvent`.
pub fn simple_event_type(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Stable simple name of the event type.
    const EVENT_TYPE: &'static str;

    /// Returns the event type name.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    /// Returns the fully-qualified event type name.
    fn qualified_event_type() -> String {
        qualified_event_type(Self::EVENT_TYPE)
    }
}

/// A message was persisted and attached to its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentEvent {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub mentions: Vec<UserId>,
    pub sent_at: DateTime<Utc>,
}

impl DomainEvent for MessageSentEvent {
    const EVENT_TYPE: &'static str = "MessageSentEvent";
}

impl MessageSentEvent {
    /// Builds the event from a persisted message.
    pub fn from_message(message: &ChatMessage) -> Result<Self, DomainError> {
        let message_id = message.id.ok_or(DomainError::MessageNotPersisted)?;
        Ok(Self {
            message_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            mentions: message.mentions.clone(),
            sent_at: message.sent_at,
        })
    }
}

/// A persisted message mentions one or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionEvent {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub mentioned_user_ids: Vec<UserId>,
    pub sent_at: DateTime<Utc>,
}

impl DomainEvent for MentionEvent {
    const EVENT_TYPE: &'static str = "MentionEvent";
}

impl MentionEvent {
    /// Builds the event from a persisted message, or `None` without mentions.
    pub fn from_message(message: &ChatMessage) -> Result<Option<Self>, DomainError> {
        if !message.has_mentions() {
            return Ok(None);
        }
        let message_id = message.id.ok_or(DomainError::MessageNotPersisted)?;
        Ok(Some(Self {
            message_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            mentioned_user_ids: message.mentions.clone(),
            sent_at: message.sent_at,
        }))
    }
}

/// A user gained a friend. Emitted once per side of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendAddedEvent {
    pub user_id: UserId,
    pub friend_id: UserId,
    pub friendship_id: FriendshipId,
    pub request_id: FriendRequestId,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent for FriendAddedEvent {
    const EVENT_TYPE: &'static str = "FriendAddedEvent";
}

impl FriendAddedEvent {
    /// Builds the event addressed to the owner of `friendship`.
    pub fn for_friendship(friendship: &Friendship, request_id: FriendRequestId) -> Self {
        Self {
            user_id: friendship.user_id,
            friend_id: friendship.friend_id,
            friendship_id: friendship.id,
            request_id,
            occurred_at: friendship.created_at,
        }
    }
}

/// Any event the chat domain publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageSent(MessageSentEvent),
    Mention(MentionEvent),
    FriendAdded(FriendAddedEvent),
}

impl ChatEvent {
    /// Returns the simple event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::MessageSent(e) => e.event_type(),
            ChatEvent::Mention(e) => e.event_type(),
            ChatEvent::FriendAdded(e) => e.event_type(),
        }
    }

    /// Serializes the inner event to its JSON payload.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        match self {
            ChatEvent::MessageSent(e) => serde_json::to_string(e),
            ChatEvent::Mention(e) => serde_json::to_string(e),
            ChatEvent::FriendAdded(e) => serde_json::to_string(e),
        }
    }
}

impl From<MessageSentEvent> for ChatEvent {
    fn from(e: MessageSentEvent) -> Self {
        ChatEvent::MessageSent(e)
    }
}

impl From<MentionEvent> for ChatEvent {
    fn from(e: MentionEvent) -> Self {
        ChatEvent::Mention(e)
    }
}

impl From<FriendAddedEvent> for ChatEvent {
    fn from(e: FriendAddedEvent) -> Self {
        ChatEvent::FriendAdded(e)
    }
}
