//! Idempotent outbox writes inside an open relational transaction.

use common::SagaId;
use domain::DomainEvent;
use store::{OutboxEvent, RelationalStore};

use crate::error::Result;

/// Outcome of an outbox write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxWrite {
    /// A new row was staged in the transaction.
    Inserted,
    /// A row with the same idempotency key exists; the event is already recorded.
    AlreadyRecorded,
}

/// Writes domain events to the outbox, collapsing duplicates to a single row.
pub struct OutboxWriter<'a, S: RelationalStore> {
    store: &'a S,
}

impl<'a, S: RelationalStore> OutboxWriter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Writes the single `E` event of a saga.
    pub async fn write<E: DomainEvent>(
        &self,
        tx: &mut S::Tx,
        saga_id: &SagaId,
        event: &E,
    ) -> Result<OutboxWrite> {
        let row = OutboxEvent::new(saga_id, event)?;
        self.write_row(tx, &row).await
    }

    /// Writes one of several `E` events of a saga, keyed additionally by `scope`.
    pub async fn write_scoped<E: DomainEvent>(
        &self,
        tx: &mut S::Tx,
        saga_id: &SagaId,
        event: &E,
        scope: &str,
    ) -> Result<OutboxWrite> {
        let row = OutboxEvent::scoped(saga_id, event, scope)?;
        self.write_row(tx, &row).await
    }

    /// Writes a prepared outbox row.
    ///
    /// A key found by the pre-check, or rejected by the unique constraint
    /// during a concurrent insert, counts as already recorded.
    pub async fn write_row(&self, tx: &mut S::Tx, row: &OutboxEvent) -> Result<OutboxWrite> {
        if self
            .store
            .outbox_key_exists(tx, &row.idempotency_key)
            .await?
        {
            return Ok(self.already_recorded(row));
        }

        match self.store.insert_outbox_event(tx, row).await {
            Ok(()) => {
                metrics::counter!("outbox_events_written", "event_type" => row.simple_event_type().to_string())
                    .increment(1);
                tracing::debug!(
                    saga_id = %row.saga_id,
                    key = %row.idempotency_key,
                    event_type = %row.event_type,
                    "outbox event written"
                );
                Ok(OutboxWrite::Inserted)
            }
            Err(e) if e.is_duplicate_key() => Ok(self.already_recorded(row)),
            Err(e) => Err(e.into()),
        }
    }

    fn already_recorded(&self, row: &OutboxEvent) -> OutboxWrite {
        metrics::counter!("outbox_duplicates_skipped").increment(1);
        tracing::info!(
            saga_id = %row.saga_id,
            key = %row.idempotency_key,
            "outbox event already recorded"
        );
        OutboxWrite::AlreadyRecorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{MessageId, RoomId, UserId};
    use domain::MessageSentEvent;
    use store::InMemoryRelationalStore;

    fn event() -> MessageSentEvent {
        MessageSentEvent {
            message_id: MessageId::new(),
            room_id: RoomId::new(),
            sender_id: UserId::new(),
            content: "hello".to_string(),
            mentions: vec![],
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_write_in_same_tx_is_already_recorded() {
        let store = InMemoryRelationalStore::new();
        let writer = OutboxWriter::new(&store);
        let saga_id = SagaId::new();

        let mut tx = store.begin().await.unwrap();
        let first = writer.write(&mut tx, &saga_id, &event()).await.unwrap();
        let second = writer.write(&mut tx, &saga_id, &event()).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(first, OutboxWrite::Inserted);
        assert_eq!(second, OutboxWrite::AlreadyRecorded);
        assert_eq!(store.outbox_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn write_after_commit_is_already_recorded() {
        let store = InMemoryRelationalStore::new();
        let writer = OutboxWriter::new(&store);
        let saga_id = SagaId::new();

        for expected in [OutboxWrite::Inserted, OutboxWrite::AlreadyRecorded] {
            let mut tx = store.begin().await.unwrap();
            let outcome = writer.write(&mut tx, &saga_id, &event()).await.unwrap();
            store.commit(tx).await.unwrap();
            assert_eq!(outcome, expected);
        }

        let rows = store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].event.idempotency_key.as_str(),
            format!("{}MessageSentEvent", saga_id)
        );
    }

    #[tokio::test]
    async fn racing_transactions_collapse_to_one_row() {
        let store = InMemoryRelationalStore::new();
        let writer = OutboxWriter::new(&store);
        let saga_id = SagaId::new();

        // Both pre-checks pass before either commits
        let mut tx1 = store.begin().await.unwrap();
        let mut tx2 = store.begin().await.unwrap();
        writer.write(&mut tx1, &saga_id, &event()).await.unwrap();
        writer.write(&mut tx2, &saga_id, &event()).await.unwrap();
        store.commit(tx1).await.unwrap();
        store.commit(tx2).await.unwrap();

        assert_eq!(store.outbox_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let store = InMemoryRelationalStore::new();
        store.set_fail_on_outbox_insert(true);
        let writer = OutboxWriter::new(&store);

        let mut tx = store.begin().await.unwrap();
        let result = writer.write(&mut tx, &SagaId::new(), &event()).await;
        assert!(result.is_err());
    }
}
