use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{FriendRequestId, FriendshipId, MessageId, RoomId, SagaId, UserId};
use domain::{ChatMessage, ChatRoom, FriendRequest, Friendship};

use crate::{IdempotencyKey, OutboxEvent, OutboxEventId, OutboxRecord, Result};

/// Document store holding chat messages.
///
/// Writes commit independently of the relational store; there is no shared
/// transaction between the two.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts a message and returns the ID the store assigned to it.
    async fn insert(&self, message: &ChatMessage) -> Result<MessageId>;

    /// Deletes a message. Returns false if it did not exist.
    async fn delete(&self, message_id: MessageId) -> Result<bool>;

    /// Loads a message by ID.
    async fn find(&self, message_id: MessageId) -> Result<Option<ChatMessage>>;
}

/// Relational store holding room and friendship aggregates plus the outbox.
///
/// Writes go through an explicit transaction handle obtained from
/// [`RelationalStore::begin`]. Nothing is visible to readers until the
/// handle is passed to [`RelationalStore::commit`]; dropping or rolling
/// back the handle discards every write staged on it.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// An open transaction.
    type Tx: Send + 'static;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Commits every write staged on the transaction atomically.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Discards every write staged on the transaction.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// Loads a chat room by ID.
    async fn find_room(&self, room_id: RoomId) -> Result<Option<ChatRoom>>;

    /// Inserts or replaces a chat room.
    async fn save_room(&self, tx: &mut Self::Tx, room: &ChatRoom) -> Result<()>;

    /// Loads a friend request by ID.
    async fn find_friend_request(&self, id: FriendRequestId) -> Result<Option<FriendRequest>>;

    /// Persists a friend request under optimistic concurrency control.
    ///
    /// Succeeds only if the stored version still equals `request.version`
    /// and returns the incremented version. Fails with
    /// `StoreError::VersionConflict` otherwise.
    async fn update_friend_request(&self, tx: &mut Self::Tx, request: &FriendRequest)
    -> Result<i64>;

    /// Inserts friendship records.
    async fn insert_friendships(&self, tx: &mut Self::Tx, friendships: &[Friendship])
    -> Result<()>;

    /// Deletes friendship records by ID. Missing IDs are ignored.
    async fn delete_friendships(&self, tx: &mut Self::Tx, ids: &[FriendshipId]) -> Result<u64>;

    /// Lists the friendship records owned by a user.
    async fn find_friendships_of(&self, user_id: UserId) -> Result<Vec<Friendship>>;

    /// Returns true if an outbox row with the key exists, including rows
    /// staged on this transaction.
    async fn outbox_key_exists(&self, tx: &mut Self::Tx, key: &IdempotencyKey) -> Result<bool>;

    /// Inserts an outbox row.
    ///
    /// A row with the same idempotency key yields `StoreError::DuplicateKey`
    /// without poisoning the transaction.
    async fn insert_outbox_event(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<()>;

    /// Deletes every outbox row written by a saga.
    async fn delete_outbox_events(&self, tx: &mut Self::Tx, saga_id: &SagaId) -> Result<u64>;

    /// Lists the outbox rows written by a saga.
    async fn outbox_events_for_saga(&self, saga_id: &SagaId) -> Result<Vec<OutboxRecord>>;
}

/// Read side of the outbox used by the publisher paths.
#[async_trait]
pub trait OutboxReader: Send + Sync {
    /// Returns up to `limit` unprocessed rows, oldest first.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks every row sharing the saga ID and fully-qualified event type as processed.
    async fn mark_processed(&self, saga_id: &SagaId, event_type: &str) -> Result<u64>;

    /// Marks the row holding `key` as processed. Returns false if it was already processed or missing.
    async fn mark_processed_by_key(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Marks a single row as processed. Returns false if it was already processed or missing.
    async fn mark_processed_by_id(&self, id: OutboxEventId) -> Result<bool>;

    /// Counts rows not yet processed.
    async fn count_unprocessed(&self) -> Result<u64>;

    /// Deletes processed rows whose processing time is older than `before`.
    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64>;
}
