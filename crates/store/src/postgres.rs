use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{FriendRequestId, FriendshipId, MessageId, RoomId, SagaId, UserId};
use domain::{ChatMessage, ChatRoom, FriendRequest, FriendRequestStatus, Friendship};
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use uuid::Uuid;

use crate::{
    IdempotencyKey, OutboxEvent, OutboxEventId, OutboxRecord, Result, StoreError,
    store::{MessageStore, OutboxReader, RelationalStore},
};

/// PostgreSQL-backed document store. Messages are kept as JSONB documents.
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    /// Creates a new PostgreSQL message store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert(&self, message: &ChatMessage) -> Result<MessageId> {
        let id = MessageId::new();
        let mut document = message.clone();
        document.id = Some(id);

        sqlx::query("INSERT INTO chat_messages (id, room_id, document) VALUES ($1, $2, $3)")
            .bind(id.as_uuid())
            .bind(message.room_id.as_uuid())
            .bind(serde_json::to_value(&document)?)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    async fn delete(&self, message_id: MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE id = $1")
            .bind(message_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, message_id: MessageId) -> Result<Option<ChatMessage>> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM chat_messages WHERE id = $1")
                .bind(message_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(document.map(serde_json::from_value).transpose()?)
    }
}

/// PostgreSQL-backed relational store.
#[derive(Clone)]
pub struct PostgresRelationalStore {
    pool: PgPool,
}

impl PostgresRelationalStore {
    /// Creates a new PostgreSQL relational store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of up to `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Returns a document store sharing this store's pool.
    pub fn message_store(&self) -> PostgresMessageStore {
        PostgresMessageStore::new(self.pool.clone())
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_room(row: PgRow) -> Result<ChatRoom> {
        let last_message: Option<serde_json::Value> = row.try_get("last_message")?;

        Ok(ChatRoom {
            id: RoomId::from_uuid(row.try_get::<Uuid, _>("id")?),
            name: row.try_get("name")?,
            members: serde_json::from_value(row.try_get("members")?)?,
            last_message: last_message.map(serde_json::from_value).transpose()?,
            last_active_at: row.try_get("last_active_at")?,
            message_count: row.try_get("message_count")?,
        })
    }

    fn row_to_friend_request(row: PgRow) -> Result<FriendRequest> {
        let status: String = row.try_get("status")?;
        let status = FriendRequestStatus::parse(&status).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown friend request status: {status}").into(),
            ))
        })?;

        Ok(FriendRequest {
            id: FriendRequestId::from_uuid(row.try_get::<Uuid, _>("id")?),
            requester_id: UserId::from_uuid(row.try_get::<Uuid, _>("requester_id")?),
            receiver_id: UserId::from_uuid(row.try_get::<Uuid, _>("receiver_id")?),
            status,
            created_at: row.try_get("created_at")?,
            responded_at: row.try_get("responded_at")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_friendship(row: PgRow) -> Result<Friendship> {
        Ok(Friendship {
            id: FriendshipId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            friend_id: UserId::from_uuid(row.try_get::<Uuid, _>("friend_id")?),
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: OutboxEventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event: OutboxEvent {
                saga_id: SagaId::from_string(row.try_get::<String, _>("saga_id")?),
                idempotency_key: IdempotencyKey::from_string(
                    row.try_get::<String, _>("idempotency_key")?,
                ),
                event_type: row.try_get("event_type")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            },
            processed_at: row.try_get("processed_at")?,
        })
    }
}

const OUTBOX_COLUMNS: &str =
    "id, saga_id, idempotency_key, event_type, payload, created_at, processed_at";

#[async_trait]
impl RelationalStore for PostgresRelationalStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<ChatRoom>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, members, last_message, last_active_at, message_count
            FROM chat_rooms
            WHERE id = $1
            "#,
        )
        .bind(room_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_room).transpose()
    }

    async fn save_room(&self, tx: &mut Self::Tx, room: &ChatRoom) -> Result<()> {
        let last_message = room
            .last_message
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO chat_rooms (id, name, members, last_message, last_active_at, message_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                members = EXCLUDED.members,
                last_message = EXCLUDED.last_message,
                last_active_at = EXCLUDED.last_active_at,
                message_count = EXCLUDED.message_count
            "#,
        )
        .bind(room.id.as_uuid())
        .bind(&room.name)
        .bind(serde_json::to_value(&room.members)?)
        .bind(last_message)
        .bind(room.last_active_at)
        .bind(room.message_count)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn find_friend_request(&self, id: FriendRequestId) -> Result<Option<FriendRequest>> {
        let row = sqlx::query(
            r#"
            SELECT id, requester_id, receiver_id, status, created_at, responded_at, version
            FROM friend_requests
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_friend_request).transpose()
    }

    async fn update_friend_request(
        &self,
        tx: &mut Self::Tx,
        request: &FriendRequest,
    ) -> Result<i64> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE friend_requests
            SET status = $2, responded_at = $3, version = version + 1
            WHERE id = $1 AND version = $4
            RETURNING version
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.status.as_str())
        .bind(request.responded_at)
        .bind(request.version)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(version) = updated {
            return Ok(version);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM friend_requests WHERE id = $1")
                .bind(request.id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;

        match actual {
            Some(actual) => {
                tracing::debug!(
                    request_id = %request.id,
                    expected = request.version,
                    actual,
                    "Friend request version conflict"
                );
                Err(StoreError::VersionConflict {
                    entity: "friend_request",
                    id: request.id.to_string(),
                    expected: request.version,
                    actual,
                })
            }
            None => Err(StoreError::NotFound {
                entity: "friend_request",
                id: request.id.to_string(),
            }),
        }
    }

    async fn insert_friendships(&self, tx: &mut Self::Tx, friendships: &[Friendship]) -> Result<()> {
        for friendship in friendships {
            sqlx::query(
                r#"
                INSERT INTO friendships (id, user_id, friend_id, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(friendship.id.as_uuid())
            .bind(friendship.user_id.as_uuid())
            .bind(friendship.friend_id.as_uuid())
            .bind(friendship.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_friendship")
                {
                    return StoreError::DuplicateKey {
                        constraint: "unique_friendship",
                        key: format!("{}:{}", friendship.user_id, friendship.friend_id),
                    };
                }
                StoreError::Database(e)
            })?;
        }
        Ok(())
    }

    async fn delete_friendships(&self, tx: &mut Self::Tx, ids: &[FriendshipId]) -> Result<u64> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let result = sqlx::query("DELETE FROM friendships WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_friendships_of(&self, user_id: UserId) -> Result<Vec<Friendship>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, friend_id, created_at
            FROM friendships
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_friendship).collect()
    }

    async fn outbox_key_exists(&self, tx: &mut Self::Tx, key: &IdempotencyKey) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM outbox_events WHERE idempotency_key = $1)",
        )
        .bind(key.as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    async fn insert_outbox_event(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<()> {
        // ON CONFLICT keeps the transaction usable when the key already exists
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_events (id, saga_id, idempotency_key, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(OutboxEventId::new().as_uuid())
        .bind(event.saga_id.as_str())
        .bind(event.idempotency_key.as_str())
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateKey {
                constraint: "unique_outbox_idempotency_key",
                key: event.idempotency_key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_outbox_events(&self, tx: &mut Self::Tx, saga_id: &SagaId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE saga_id = $1")
            .bind(saga_id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn outbox_events_for_saga(&self, saga_id: &SagaId) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE saga_id = $1 ORDER BY created_at ASC"
        ))
        .bind(saga_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }
}

#[async_trait]
impl OutboxReader for PostgresRelationalStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE processed_at IS NULL ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_processed(&self, saga_id: &SagaId, event_type: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NOW()
            WHERE saga_id = $1 AND event_type = $2 AND processed_at IS NULL
            "#,
        )
        .bind(saga_id.as_str())
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_processed_by_key(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NOW()
            WHERE idempotency_key = $1 AND processed_at IS NULL
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_processed_by_id(&self, id: OutboxEventId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_events SET processed_at = NOW() WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_unprocessed(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
