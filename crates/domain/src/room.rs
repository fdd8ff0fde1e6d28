//! Chat room aggregate and its metadata computation.

use chrono::{DateTime, Utc};
use common::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::message::ChatMessage;

/// Maximum number of characters kept in the last-message preview.
pub const PREVIEW_MAX_CHARS: usize = 100;

/// Pointer to the most recent message in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub preview: String,
    pub sent_at: DateTime<Utc>,
}

/// A member of a chat room and how far they have read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: UserId,
    pub last_read_message_id: Option<MessageId>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl RoomMember {
    /// Creates a member who has not read anything yet.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            last_read_message_id: None,
            last_read_at: None,
        }
    }
}

/// The relational chat room aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: RoomId,
    pub name: String,
    pub members: Vec<RoomMember>,
    pub last_message: Option<LastMessage>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: i64,
}

impl ChatRoom {
    /// Creates an empty room with the given members.
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            id: RoomId::new(),
            name: name.into(),
            members: members.into_iter().map(RoomMember::new).collect(),
            last_message: None,
            last_active_at: Utc::now(),
            message_count: 0,
        }
    }

    /// Returns the member entry for a user.
    pub fn member(&self, user_id: UserId) -> Option<&RoomMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Returns true if the user belongs to the room.
    pub fn is_member(&self, user_id: UserId) -> bool {
        self.member(user_id).is_some()
    }

    /// Computes the room metadata after `message` was persisted.
    ///
    /// Pure: returns the updated aggregate and leaves `self` untouched so the
    /// caller keeps the pre-update snapshot.
    pub fn with_new_message(&self, message: &ChatMessage) -> Result<ChatRoom, DomainError> {
        let message_id = message.id.ok_or(DomainError::MessageNotPersisted)?;

        let mut updated = self.clone();
        updated.last_message = Some(LastMessage {
            message_id,
            sender_id: message.sender_id,
            preview: preview_of(&message.content),
            sent_at: message.sent_at,
        });
        if message.sent_at > updated.last_active_at {
            updated.last_active_at = message.sent_at;
        }
        updated.message_count += 1;
        Ok(updated)
    }

    /// Advances a member's last-read pointer.
    pub fn mark_read(
        &mut self,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or(DomainError::MemberNotFound { user_id })?;
        member.last_read_message_id = Some(message_id);
        member.last_read_at = Some(read_at);
        Ok(())
    }
}

fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(room: &ChatRoom, sender: UserId, content: &str) -> ChatMessage {
        let mut msg = ChatMessage::new(room.id, sender, content);
        msg.id = Some(MessageId::new());
        msg
    }

    #[test]
    fn with_new_message_updates_pointer_and_keeps_original() {
        let alice = UserId::new();
        let room = ChatRoom::new("general", [alice]);
        let msg = persisted(&room, alice, "hello");

        let updated = room.with_new_message(&msg).unwrap();

        assert!(room.last_message.is_none());
        assert_eq!(room.message_count, 0);

        let last = updated.last_message.as_ref().unwrap();
        assert_eq!(Some(last.message_id), msg.id);
        assert_eq!(last.sender_id, alice);
        assert_eq!(last.preview, "hello");
        assert_eq!(updated.message_count, 1);
        assert!(updated.last_active_at >= msg.sent_at);
    }

    #[test]
    fn with_new_message_requires_persisted_message() {
        let alice = UserId::new();
        let room = ChatRoom::new("general", [alice]);
        let msg = ChatMessage::new(room.id, alice, "hello");

        assert!(matches!(
            room.with_new_message(&msg),
            Err(DomainError::MessageNotPersisted)
        ));
    }

    #[test]
    fn preview_is_truncated() {
        let alice = UserId::new();
        let room = ChatRoom::new("general", [alice]);
        let long = "x".repeat(PREVIEW_MAX_CHARS + 50);
        let msg = persisted(&room, alice, &long);

        let updated = room.with_new_message(&msg).unwrap();
        assert_eq!(
            updated.last_message.unwrap().preview.chars().count(),
            PREVIEW_MAX_CHARS
        );
    }

    #[test]
    fn mark_read_moves_member_pointer() {
        let alice = UserId::new();
        let mut room = ChatRoom::new("general", [alice]);
        let message_id = MessageId::new();

        room.mark_read(alice, message_id, Utc::now()).unwrap();
        assert_eq!(
            room.member(alice).unwrap().last_read_message_id,
            Some(message_id)
        );
    }

    #[test]
    fn mark_read_rejects_non_member() {
        let mut room = ChatRoom::new("general", [UserId::new()]);
        let stranger = UserId::new();

        let result = room.mark_read(stranger, MessageId::new(), Utc::now());
        assert!(matches!(result, Err(DomainError::MemberNotFound { .. })));
    }
}
