use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{FriendRequestId, FriendshipId, MessageId, RoomId, SagaId, UserId};
use domain::{ChatMessage, ChatRoom, FriendRequest, Friendship};
use tokio::sync::RwLock;

use crate::{
    IdempotencyKey, OutboxEvent, OutboxEventId, OutboxRecord, Result, StoreError,
    store::{MessageStore, OutboxReader, RelationalStore},
};

fn injected(operation: &str) -> StoreError {
    StoreError::Unavailable(format!("injected failure on {operation}"))
}

/// In-memory document store for testing.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<RwLock<HashMap<MessageId, ChatMessage>>>,
    fail_on_insert: Arc<AtomicBool>,
    fail_on_delete: Arc<AtomicBool>,
}

impl InMemoryMessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the store to fail on insert.
    pub fn set_fail_on_insert(&self, fail: bool) {
        self.fail_on_insert.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail on delete.
    pub fn set_fail_on_delete(&self, fail: bool) {
        self.fail_on_delete.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: &ChatMessage) -> Result<MessageId> {
        if self.fail_on_insert.load(Ordering::SeqCst) {
            return Err(injected("message insert"));
        }

        let id = MessageId::new();
        let mut stored = message.clone();
        stored.id = Some(id);
        self.messages.write().await.insert(id, stored);
        Ok(id)
    }

    async fn delete(&self, message_id: MessageId) -> Result<bool> {
        if self.fail_on_delete.load(Ordering::SeqCst) {
            return Err(injected("message delete"));
        }
        Ok(self.messages.write().await.remove(&message_id).is_some())
    }

    async fn find(&self, message_id: MessageId) -> Result<Option<ChatMessage>> {
        Ok(self.messages.read().await.get(&message_id).cloned())
    }
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, ChatRoom>,
    friend_requests: HashMap<FriendRequestId, FriendRequest>,
    friendships: Vec<Friendship>,
    outbox: Vec<OutboxRecord>,
}

impl Tables {
    fn check_version(&self, request: &FriendRequest) -> Result<()> {
        let stored = self
            .friend_requests
            .get(&request.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "friend_request",
                id: request.id.to_string(),
            })?;

        if stored.version != request.version {
            return Err(StoreError::VersionConflict {
                entity: "friend_request",
                id: request.id.to_string(),
                expected: request.version,
                actual: stored.version,
            });
        }
        Ok(())
    }
}

enum StagedWrite {
    SaveRoom(ChatRoom),
    UpdateFriendRequest(FriendRequest),
    InsertFriendships(Vec<Friendship>),
    DeleteFriendships(Vec<FriendshipId>),
    InsertOutbox(OutboxRecord),
    DeleteOutbox(SagaId),
}

/// Transaction handle of [`InMemoryRelationalStore`].
///
/// Writes are staged and applied on commit. Dropping the handle discards them.
#[derive(Default)]
pub struct InMemoryTx {
    writes: Vec<StagedWrite>,
}

impl InMemoryTx {
    fn staged_outbox(&self) -> impl Iterator<Item = &OutboxRecord> {
        self.writes.iter().filter_map(|w| match w {
            StagedWrite::InsertOutbox(record) => Some(record),
            _ => None,
        })
    }

    fn staged_friendships(&self) -> impl Iterator<Item = &Friendship> {
        self.writes.iter().flat_map(|w| match w {
            StagedWrite::InsertFriendships(rows) => rows.as_slice(),
            _ => &[][..],
        })
    }
}

#[derive(Default)]
struct Faults {
    save_room: AtomicBool,
    insert_friendships: AtomicBool,
    delete_friendships: AtomicBool,
    outbox_insert: AtomicBool,
    outbox_delete: AtomicBool,
    commit: AtomicBool,
    version_conflicts: AtomicUsize,
}

impl Faults {
    fn check(&self, flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(injected(operation));
        }
        Ok(())
    }

    fn take_version_conflict(&self) -> bool {
        self.version_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory relational store for testing.
///
/// Provides the same transactional behaviour as the PostgreSQL
/// implementation: staged writes become visible atomically on commit, and
/// the outbox rejects duplicate idempotency keys.
#[derive(Clone, Default)]
pub struct InMemoryRelationalStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Faults>,
}

impl InMemoryRelationalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a chat room.
    pub async fn insert_room(&self, room: ChatRoom) {
        self.tables.write().await.rooms.insert(room.id, room);
    }

    /// Seeds a friend request.
    pub async fn insert_friend_request(&self, request: FriendRequest) {
        self.tables
            .write()
            .await
            .friend_requests
            .insert(request.id, request);
    }

    /// Bumps the stored version of a friend request, simulating a concurrent writer.
    pub async fn touch_friend_request(&self, id: FriendRequestId) {
        if let Some(request) = self.tables.write().await.friend_requests.get_mut(&id) {
            request.version += 1;
        }
    }

    /// Returns the number of committed friendship records.
    pub async fn friendship_count(&self) -> usize {
        self.tables.read().await.friendships.len()
    }

    /// Returns every committed outbox row.
    pub async fn outbox_rows(&self) -> Vec<OutboxRecord> {
        self.tables.read().await.outbox.clone()
    }

    /// Configures the store to fail when saving a room.
    pub fn set_fail_on_save_room(&self, fail: bool) {
        self.faults.save_room.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail when inserting friendships.
    pub fn set_fail_on_insert_friendships(&self, fail: bool) {
        self.faults.insert_friendships.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail when deleting friendships.
    pub fn set_fail_on_delete_friendships(&self, fail: bool) {
        self.faults.delete_friendships.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail when inserting outbox rows.
    pub fn set_fail_on_outbox_insert(&self, fail: bool) {
        self.faults.outbox_insert.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail when deleting outbox rows.
    pub fn set_fail_on_outbox_delete(&self, fail: bool) {
        self.faults.outbox_delete.store(fail, Ordering::SeqCst);
    }

    /// Configures the store to fail on commit.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.faults.commit.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` friend request updates fail with a version conflict.
    pub fn set_version_conflicts(&self, count: usize) {
        self.faults.version_conflicts.store(count, Ordering::SeqCst);
    }

    /// Returns how many injected version conflicts have not been consumed yet.
    pub fn pending_version_conflicts(&self) -> usize {
        self.faults.version_conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx> {
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, tx: InMemoryTx) -> Result<()> {
        self.faults.check(&self.faults.commit, "commit")?;

        let mut tables = self.tables.write().await;

        // Validate before applying anything so a failed commit leaves no trace
        for write in &tx.writes {
            if let StagedWrite::UpdateFriendRequest(request) = write {
                tables.check_version(request)?;
            }
        }

        for write in tx.writes {
            match write {
                StagedWrite::SaveRoom(room) => {
                    tables.rooms.insert(room.id, room);
                }
                StagedWrite::UpdateFriendRequest(mut request) => {
                    request.version += 1;
                    tables.friend_requests.insert(request.id, request);
                }
                StagedWrite::InsertFriendships(rows) => {
                    tables.friendships.extend(rows);
                }
                StagedWrite::DeleteFriendships(ids) => {
                    tables.friendships.retain(|f| !ids.contains(&f.id));
                }
                StagedWrite::InsertOutbox(record) => {
                    let key = &record.event.idempotency_key;
                    if !tables.outbox.iter().any(|r| &r.event.idempotency_key == key) {
                        tables.outbox.push(record);
                    }
                }
                StagedWrite::DeleteOutbox(saga_id) => {
                    tables.outbox.retain(|r| r.event.saga_id != saga_id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: InMemoryTx) -> Result<()> {
        drop(tx);
        Ok(())
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<ChatRoom>> {
        Ok(self.tables.read().await.rooms.get(&room_id).cloned())
    }

    async fn save_room(&self, tx: &mut InMemoryTx, room: &ChatRoom) -> Result<()> {
        self.faults.check(&self.faults.save_room, "room save")?;
        tx.writes.push(StagedWrite::SaveRoom(room.clone()));
        Ok(())
    }

    async fn find_friend_request(&self, id: FriendRequestId) -> Result<Option<FriendRequest>> {
        Ok(self.tables.read().await.friend_requests.get(&id).cloned())
    }

    async fn update_friend_request(
        &self,
        tx: &mut InMemoryTx,
        request: &FriendRequest,
    ) -> Result<i64> {
        if self.faults.take_version_conflict() {
            return Err(StoreError::VersionConflict {
                entity: "friend_request",
                id: request.id.to_string(),
                expected: request.version,
                actual: request.version + 1,
            });
        }

        self.tables.read().await.check_version(request)?;
        tx.writes
            .push(StagedWrite::UpdateFriendRequest(request.clone()));
        Ok(request.version + 1)
    }

    async fn insert_friendships(
        &self,
        tx: &mut InMemoryTx,
        friendships: &[Friendship],
    ) -> Result<()> {
        self.faults
            .check(&self.faults.insert_friendships, "friendship insert")?;
        tx.writes
            .push(StagedWrite::InsertFriendships(friendships.to_vec()));
        Ok(())
    }

    async fn delete_friendships(&self, tx: &mut InMemoryTx, ids: &[FriendshipId]) -> Result<u64> {
        self.faults
            .check(&self.faults.delete_friendships, "friendship delete")?;

        let tables = self.tables.read().await;
        let deleted = tables
            .friendships
            .iter()
            .chain(tx.staged_friendships())
            .filter(|f| ids.contains(&f.id))
            .count();
        drop(tables);

        tx.writes.push(StagedWrite::DeleteFriendships(ids.to_vec()));
        Ok(deleted as u64)
    }

    async fn find_friendships_of(&self, user_id: UserId) -> Result<Vec<Friendship>> {
        Ok(self
            .tables
            .read()
            .await
            .friendships
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn outbox_key_exists(&self, tx: &mut InMemoryTx, key: &IdempotencyKey) -> Result<bool> {
        let committed = self
            .tables
            .read()
            .await
            .outbox
            .iter()
            .any(|r| &r.event.idempotency_key == key);
        Ok(committed || tx.staged_outbox().any(|r| &r.event.idempotency_key == key))
    }

    async fn insert_outbox_event(&self, tx: &mut InMemoryTx, event: &OutboxEvent) -> Result<()> {
        self.faults.check(&self.faults.outbox_insert, "outbox insert")?;

        if self.outbox_key_exists(tx, &event.idempotency_key).await? {
            return Err(StoreError::DuplicateKey {
                constraint: "unique_outbox_idempotency_key",
                key: event.idempotency_key.to_string(),
            });
        }

        tx.writes
            .push(StagedWrite::InsertOutbox(OutboxRecord::pending(event.clone())));
        Ok(())
    }

    async fn delete_outbox_events(&self, tx: &mut InMemoryTx, saga_id: &SagaId) -> Result<u64> {
        self.faults.check(&self.faults.outbox_delete, "outbox delete")?;

        let tables = self.tables.read().await;
        let deleted = tables
            .outbox
            .iter()
            .chain(tx.staged_outbox())
            .filter(|r| &r.event.saga_id == saga_id)
            .count();
        drop(tables);

        tx.writes.push(StagedWrite::DeleteOutbox(saga_id.clone()));
        Ok(deleted as u64)
    }

    async fn outbox_events_for_saga(&self, saga_id: &SagaId) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .outbox
            .iter()
            .filter(|r| &r.event.saga_id == saga_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxReader for InMemoryRelationalStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<_> = tables
            .outbox
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.event.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&self, saga_id: &SagaId, event_type: &str) -> Result<u64> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let mut marked = 0;
        for record in tables.outbox.iter_mut().filter(|r| {
            r.is_pending() && &r.event.saga_id == saga_id && r.event.event_type == event_type
        }) {
            record.processed_at = Some(now);
            marked += 1;
        }
        Ok(marked)
    }

    async fn mark_processed_by_key(&self, key: &IdempotencyKey) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .outbox
            .iter_mut()
            .find(|r| &r.event.idempotency_key == key && r.is_pending())
        {
            Some(record) => {
                record.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_processed_by_id(&self, id: OutboxEventId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .outbox
            .iter_mut()
            .find(|r| r.id == id && r.is_pending())
        {
            Some(record) => {
                record.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_unprocessed(&self) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().filter(|r| r.is_pending()).count() as u64)
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let len = tables.outbox.len();
        tables
            .outbox
            .retain(|r| r.processed_at.is_none_or(|at| at >= before));
        Ok((len - tables.outbox.len()) as u64)
    }
}
