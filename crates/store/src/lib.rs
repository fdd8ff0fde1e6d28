//! Persistence for the chat saga coordination core.
//!
//! Two independent stores back the sagas:
//! - a document store for chat messages ([`MessageStore`])
//! - a relational store for rooms, friend requests, friendships and the
//!   transactional outbox ([`RelationalStore`], [`OutboxReader`])
//!
//! Each comes with an in-memory implementation for tests and a PostgreSQL
//! implementation.

pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryMessageStore, InMemoryRelationalStore, InMemoryTx};
pub use outbox::{IdempotencyKey, OutboxEvent, OutboxEventId, OutboxRecord};
pub use postgres::{PostgresMessageStore, PostgresRelationalStore};
pub use store::{MessageStore, OutboxReader, RelationalStore};
