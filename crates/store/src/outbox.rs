//! Outbox rows and idempotency keys.

use chrono::{DateTime, Utc};
use common::SagaId;
use domain::DomainEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Surrogate identifier of a stored outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(Uuid);

impl OutboxEventId {
    /// Creates a new random outbox row ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an outbox row ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OutboxEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deduplication key of an outbox row, unique across the table.
///
/// Derived as `saga_id + event type name`. A saga that writes several events
/// of one type appends a scope (the addressed user) so each row keeps its
/// own key: `saga_id + event type name + ":" + scope`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for the single event of a type written by a saga.
    pub fn derive(saga_id: &SagaId, event_type: &str) -> Self {
        Self(format!("{}{}", saga_id.as_str(), event_type))
    }

    /// Derives the key for one of several events of a type written by a saga.
    pub fn derive_scoped(saga_id: &SagaId, event_type: &str, scope: &str) -> Self {
        Self(format!("{}{}:{}", saga_id.as_str(), event_type, scope))
    }

    /// Wraps a key read back from storage.
    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pending domain event, written in the same transaction as the change it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub saga_id: SagaId,
    pub idempotency_key: IdempotencyKey,
    /// Fully-qualified event type name.
    pub event_type: String,
    /// The serialized event.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Builds the outbox row for `event` written by `saga_id`.
    pub fn new<E: DomainEvent>(saga_id: &SagaId, event: &E) -> Result<Self, serde_json::Error> {
        let key = IdempotencyKey::derive(saga_id, E::EVENT_TYPE);
        Self::with_key(saga_id, key, event)
    }

    /// Builds the outbox row for one of several `E` events written by `saga_id`.
    pub fn scoped<E: DomainEvent>(
        saga_id: &SagaId,
        event: &E,
        scope: &str,
    ) -> Result<Self, serde_json::Error> {
        let key = IdempotencyKey::derive_scoped(saga_id, E::EVENT_TYPE, scope);
        Self::with_key(saga_id, key, event)
    }

    fn with_key<E: DomainEvent>(
        saga_id: &SagaId,
        idempotency_key: IdempotencyKey,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            saga_id: saga_id.clone(),
            idempotency_key,
            event_type: E::qualified_event_type(),
            payload: serde_json::to_string(event)?,
            created_at: Utc::now(),
        })
    }

    /// Returns the event type without its namespace.
    pub fn simple_event_type(&self) -> &str {
        domain::simple_event_type(&self.event_type)
    }
}

/// A stored outbox row with its delivery status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxEventId,
    pub event: OutboxEvent,
    /// When a publisher path republished the row. `None` means pending.
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Wraps a freshly inserted event.
    pub fn pending(event: OutboxEvent) -> Self {
        Self {
            id: OutboxEventId::new(),
            event,
            processed_at: None,
        }
    }

    /// Returns true if no publisher path has handled the row yet.
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}
