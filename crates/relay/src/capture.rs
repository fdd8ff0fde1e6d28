//! Change-capture consumer: the fast path from outbox rows to the broker.
//!
//! A log-based capture connector (outside this crate) mirrors every outbox
//! insert onto `<prefix>.events.<EventName>`, keyed by saga ID. The consumer
//! decodes each record, republishes the event on its internal topic and
//! marks the mirrored outbox row processed so the poller skips it.
//!
//! The row is identified by its idempotency key header. Records without one
//! fall back to marking every pending row of the same saga and event type.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use common::SagaId;
use futures_util::{Stream, StreamExt};
use store::{IdempotencyKey, OutboxReader};
use tokio::sync::broadcast;

use crate::broker::{
    BrokerMessage, HEADER_EVENT_TYPE, HEADER_IDEMPOTENCY_KEY, HEADER_SAGA_ID,
    HEADER_SCHEMA_VERSION, MessageBroker,
};
use crate::error::{RelayError, Result};
use crate::registry::{CURRENT_SCHEMA_VERSION, EventRegistry};

/// One record delivered by the capture connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub topic: String,
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// The outbox row's payload column.
    pub payload: String,
}

impl CaptureRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl From<BrokerMessage> for CaptureRecord {
    fn from(message: BrokerMessage) -> Self {
        Self {
            topic: message.topic,
            key: Some(message.key),
            headers: message.headers,
            payload: message.payload,
        }
    }
}

/// Turns a broker subscription into a stream of capture records.
///
/// Lagging behind the channel drops the overwritten records; the poller
/// picks up their rows later.
pub fn subscription_feed(
    receiver: broadcast::Receiver<BrokerMessage>,
) -> impl Stream<Item = CaptureRecord> {
    futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => return Some((CaptureRecord::from(message), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "capture feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// What [`CaptureConsumer::handle`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Republished; `marked` outbox rows were flagged processed.
    Relayed { marked: u64 },
    /// Could not be resolved or decoded; the row stays unprocessed for the poller.
    Skipped,
}

/// Consumes change-capture records and relays them to the broker.
pub struct CaptureConsumer<R, B> {
    outbox: Arc<R>,
    broker: Arc<B>,
    registry: Arc<EventRegistry>,
    topic_prefix: String,
}

impl<R: OutboxReader, B: MessageBroker> CaptureConsumer<R, B> {
    /// Creates a consumer for topics under `<topic_prefix>.events.`.
    pub fn new(
        outbox: Arc<R>,
        broker: Arc<B>,
        registry: Arc<EventRegistry>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            outbox,
            broker,
            registry,
            topic_prefix: format!("{}.events.", topic_prefix.into()),
        }
    }

    /// Returns true if `topic` is a capture topic this consumer handles.
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topic_suffix(topic).is_some()
    }

    fn topic_suffix<'t>(&self, topic: &'t str) -> Option<&'t str> {
        topic
            .strip_prefix(&self.topic_prefix)
            .filter(|suffix| !suffix.is_empty())
    }

    /// Relays one capture record.
    ///
    /// Unknown or undecodable events are logged and reported as
    /// [`CaptureOutcome::Skipped`]. Any other failure is returned so the
    /// broker client redelivers the record.
    #[tracing::instrument(skip(self, record), fields(topic = %record.topic))]
    pub async fn handle(&self, record: &CaptureRecord) -> Result<CaptureOutcome> {
        match self.relay(record).await {
            Ok(marked) => {
                metrics::counter!("relay_events_relayed_total", "path" => "capture").increment(1);
                Ok(CaptureOutcome::Relayed { marked })
            }
            Err(e) if e.is_unrelayable() => {
                metrics::counter!("relay_events_skipped_total", "path" => "capture").increment(1);
                tracing::warn!(error = %e, "capture record skipped; row left for the poller");
                Ok(CaptureOutcome::Skipped)
            }
            Err(e) => {
                metrics::counter!("relay_capture_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn relay(&self, record: &CaptureRecord) -> Result<u64> {
        let event_type = record
            .headers
            .get(HEADER_EVENT_TYPE)
            .map(String::as_str)
            .or_else(|| self.topic_suffix(&record.topic))
            .ok_or_else(|| RelayError::UnknownEventType {
                event_type: record.topic.clone(),
                version: CURRENT_SCHEMA_VERSION,
            })?;

        let version = record
            .headers
            .get(HEADER_SCHEMA_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(CURRENT_SCHEMA_VERSION);

        let saga_id = record
            .headers
            .get(HEADER_SAGA_ID)
            .or(record.key.as_ref())
            .ok_or_else(|| RelayError::MissingSagaId {
                topic: record.topic.clone(),
            })?;

        let descriptor = self.registry.resolve(event_type, version)?;
        let event = descriptor.decode(&record.payload)?;

        self.broker
            .publish(BrokerMessage::relayed(&descriptor.topic, saga_id, &event)?)
            .await?;

        let marked = match record.headers.get(HEADER_IDEMPOTENCY_KEY) {
            Some(key) => {
                let key = IdempotencyKey::from_string(key.as_str());
                u64::from(self.outbox.mark_processed_by_key(&key).await?)
            }
            None => {
                self.outbox
                    .mark_processed(
                        &SagaId::from_string(saga_id.as_str()),
                        &domain::qualified_event_type(descriptor.tag),
                    )
                    .await?
            }
        };

        tracing::debug!(%saga_id, event_type = descriptor.tag, marked, "capture record relayed");
        Ok(marked)
    }

    /// Consumes `records` until the stream ends or `shutdown` resolves.
    ///
    /// Records on foreign topics are ignored. Failed records are logged;
    /// redelivery is up to the producer of the stream.
    pub async fn run<St, F>(&self, records: St, shutdown: F)
    where
        St: Stream<Item = CaptureRecord>,
        F: Future<Output = ()>,
    {
        let mut records = std::pin::pin!(records);
        let mut shutdown = std::pin::pin!(shutdown);
        tracing::info!(prefix = %self.topic_prefix, "capture consumer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = records.next() => {
                    let Some(record) = next else { break };
                    if !self.matches_topic(&record.topic) {
                        continue;
                    }
                    if let Err(e) = self.handle(&record).await {
                        tracing::error!(topic = %record.topic, error = %e, "capture record failed");
                    }
                }
            }
        }

        tracing::info!("capture consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::poller::OutboxPoller;
    use chrono::Utc;
    use common::{FriendRequestId, FriendshipId, MessageId, RoomId, UserId};
    use domain::{DomainEvent, FriendAddedEvent, MessageSentEvent};
    use store::{InMemoryRelationalStore, OutboxEvent, RelationalStore};

    struct Fixture {
        store: Arc<InMemoryRelationalStore>,
        broker: Arc<InMemoryBroker>,
        consumer: CaptureConsumer<InMemoryRelationalStore, InMemoryBroker>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRelationalStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = CaptureConsumer::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::new(EventRegistry::chat_events("chat")),
            "chat",
        );
        Fixture {
            store,
            broker,
            consumer,
        }
    }

    fn sent_event() -> MessageSentEvent {
        MessageSentEvent {
            message_id: MessageId::new(),
            room_id: RoomId::new(),
            sender_id: UserId::new(),
            content: "hi".to_string(),
            mentions: vec![],
            sent_at: Utc::now(),
        }
    }

    async fn write_row(store: &InMemoryRelationalStore, saga_id: &SagaId) -> OutboxEvent {
        let row = OutboxEvent::new(saga_id, &sent_event()).unwrap();
        let mut tx = store.begin().await.unwrap();
        store.insert_outbox_event(&mut tx, &row).await.unwrap();
        store.commit(tx).await.unwrap();
        row
    }

    #[test]
    fn topic_matching() {
        let f = fixture();
        assert!(f.consumer.matches_topic("chat.events.MessageSentEvent"));
        assert!(!f.consumer.matches_topic("chat.events."));
        assert!(!f.consumer.matches_topic("other.events.MessageSentEvent"));
    }

    #[tokio::test]
    async fn relays_using_topic_suffix_and_key() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-1");
        let row = write_row(&f.store, &saga_id).await;

        let record = CaptureRecord::new("chat.events.MessageSentEvent", row.payload.clone())
            .with_key("saga-1");
        let outcome = f.consumer.handle(&record).await.unwrap();

        assert_eq!(outcome, CaptureOutcome::Relayed { marked: 1 });
        let published = f.broker.published_to("chat.message.sent").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "saga-1");
        assert_eq!(
            published[0].headers.get(HEADER_EVENT_TYPE),
            Some(&MessageSentEvent::qualified_event_type())
        );
        assert_eq!(f.store.count_unprocessed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn header_event_type_wins_over_topic() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-2");
        let row = write_row(&f.store, &saga_id).await;

        let record = CaptureRecord::new("chat.events.outbox", row.payload.clone())
            .with_header(HEADER_SAGA_ID, "saga-2")
            .with_header(HEADER_EVENT_TYPE, row.event_type.clone());
        let outcome = f.consumer.handle(&record).await.unwrap();

        assert_eq!(outcome, CaptureOutcome::Relayed { marked: 1 });
    }

    #[tokio::test]
    async fn key_header_marks_only_the_mirrored_row() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-8");
        let (alice, bob) = (UserId::new(), UserId::new());
        let request_id = FriendRequestId::new();

        let mut rows = Vec::new();
        let mut tx = f.store.begin().await.unwrap();
        for (user_id, friend_id) in [(alice, bob), (bob, alice)] {
            let event = FriendAddedEvent {
                user_id,
                friend_id,
                friendship_id: FriendshipId::new(),
                request_id,
                occurred_at: Utc::now(),
            };
            let row = OutboxEvent::scoped(&saga_id, &event, &user_id.to_string()).unwrap();
            f.store.insert_outbox_event(&mut tx, &row).await.unwrap();
            rows.push(row);
        }
        f.store.commit(tx).await.unwrap();

        // Only the first row's record reaches the consumer
        let record = CaptureRecord::new("chat.events.FriendAddedEvent", rows[0].payload.clone())
            .with_key("saga-8")
            .with_header(HEADER_IDEMPOTENCY_KEY, rows[0].idempotency_key.as_str());
        let outcome = f.consumer.handle(&record).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::Relayed { marked: 1 });

        let pending = f.store.fetch_unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.idempotency_key, rows[1].idempotency_key);

        let poller = OutboxPoller::new(
            Arc::clone(&f.store),
            Arc::clone(&f.broker),
            Arc::new(EventRegistry::chat_events("chat")),
        );
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.relayed, 1);
        assert_eq!(f.broker.published_to("chat.friend.added").await.len(), 2);
        assert_eq!(f.store.count_unprocessed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivered_record_with_key_marks_nothing_new() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-9");
        let row = write_row(&f.store, &saga_id).await;

        let record = CaptureRecord::new("chat.events.MessageSentEvent", row.payload.clone())
            .with_key("saga-9")
            .with_header(HEADER_IDEMPOTENCY_KEY, row.idempotency_key.as_str());
        assert_eq!(
            f.consumer.handle(&record).await.unwrap(),
            CaptureOutcome::Relayed { marked: 1 }
        );
        assert_eq!(
            f.consumer.handle(&record).await.unwrap(),
            CaptureOutcome::Relayed { marked: 0 }
        );
        assert_eq!(f.broker.published_to("chat.message.sent").await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_event_is_skipped_and_row_kept() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-3");
        write_row(&f.store, &saga_id).await;

        let record = CaptureRecord::new("chat.events.UserBannedEvent", "{}").with_key("saga-3");
        let outcome = f.consumer.handle(&record).await.unwrap();

        assert_eq!(outcome, CaptureOutcome::Skipped);
        assert!(f.broker.published().await.is_empty());
        assert_eq!(f.store.count_unprocessed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_skipped() {
        let f = fixture();
        let record =
            CaptureRecord::new("chat.events.MessageSentEvent", "not json").with_key("saga-4");

        assert_eq!(
            f.consumer.handle(&record).await.unwrap(),
            CaptureOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn broker_failure_is_returned_for_redelivery() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-5");
        let row = write_row(&f.store, &saga_id).await;
        f.broker.set_fail_on_publish(true);

        let record =
            CaptureRecord::new("chat.events.MessageSentEvent", row.payload).with_key("saga-5");
        let err = f.consumer.handle(&record).await.unwrap_err();

        assert!(matches!(err, RelayError::Broker { .. }));
        assert_eq!(f.store.count_unprocessed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_drains_stream_and_ignores_foreign_topics() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-6");
        let row = write_row(&f.store, &saga_id).await;

        let records = futures_util::stream::iter(vec![
            CaptureRecord::new("audit.events.MessageSentEvent", row.payload.clone())
                .with_key("saga-6"),
            CaptureRecord::new("chat.events.MessageSentEvent", row.payload).with_key("saga-6"),
        ]);
        f.consumer
            .run(records, std::future::pending::<()>())
            .await;

        assert_eq!(f.broker.published().await.len(), 1);
        assert_eq!(f.store.count_unprocessed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscription_feed_relays_connector_output() {
        let f = fixture();
        let saga_id = SagaId::from_string("saga-7");
        let row = write_row(&f.store, &saga_id).await;

        let feed = subscription_feed(f.broker.subscribe());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let consumer = f.consumer;
        let broker = Arc::clone(&f.broker);
        let running = tokio::spawn(async move {
            consumer
                .run(feed, async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        // The connector publishes the row onto the capture topic
        broker
            .publish(
                BrokerMessage::new("chat.events.MessageSentEvent", "saga-7", row.payload)
                    .with_header(HEADER_SAGA_ID, "saga-7"),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if f.store.count_unprocessed().await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let _ = stop_tx.send(());
        running.await.unwrap();

        assert_eq!(f.store.count_unprocessed().await.unwrap(), 0);
        assert_eq!(broker.published_to("chat.message.sent").await.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture();
        let (_tx, rx) = tokio::sync::mpsc::channel::<CaptureRecord>(1);
        let records = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|record| (record, rx))
        });

        f.consumer.run(records, async {}).await;
        assert!(f.broker.published().await.is_empty());
    }
}
