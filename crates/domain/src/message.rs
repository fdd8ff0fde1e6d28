//! Chat message document.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// A chat message as stored in the document store.
///
/// The ID is `None` until the document store assigns one on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Option<MessageId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    /// Users mentioned in the message body.
    pub mentions: Vec<UserId>,
    /// Users that have read the message.
    pub read_by: BTreeSet<UserId>,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates an unsent message from `sender_id` into `room_id`.
    pub fn new(room_id: RoomId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: None,
            room_id,
            sender_id,
            content: content.into(),
            mentions: Vec::new(),
            read_by: BTreeSet::new(),
            sent_at: Utc::now(),
        }
    }

    /// Adds mentioned users to the message.
    pub fn with_mentions(mut self, mentions: impl IntoIterator<Item = UserId>) -> Self {
        self.mentions.extend(mentions);
        self
    }

    /// Marks the message as read by the given user.
    pub fn mark_read_by(&mut self, user_id: UserId) {
        self.read_by.insert(user_id);
    }

    /// Marks the sender's own read receipt. A message is always read by its author.
    pub fn mark_read_by_sender(&mut self) {
        self.mark_read_by(self.sender_id);
    }

    /// Returns true if the given user has read the message.
    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.contains(&user_id)
    }

    /// Returns true if the message mentions anyone.
    pub fn has_mentions(&self) -> bool {
        !self.mentions.is_empty()
    }
}
