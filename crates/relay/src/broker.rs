//! Message broker port and an in-process implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use domain::ChatEvent;
use tokio::sync::{RwLock, broadcast};

use crate::error::{RelayError, Result};

/// Header carrying the saga ID of a relayed event.
pub const HEADER_SAGA_ID: &str = "sagaId";

/// Header carrying the event type of a relayed event.
pub const HEADER_EVENT_TYPE: &str = "eventType";

/// Header carrying the schema version of a relayed event.
pub const HEADER_SCHEMA_VERSION: &str = "schemaVersion";

/// Header carrying the idempotency key of the outbox row a capture record mirrors.
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotencyKey";

const CHANNEL_CAPACITY: usize = 1024;

/// A keyed message bound for a broker topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partitioning key. Relayed events use the saga ID so one saga's events stay ordered.
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: String,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: String) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Builds the internal-topic message for a relayed domain event.
    pub fn relayed(topic: &str, saga_id: &str, event: &ChatEvent) -> Result<Self> {
        Ok(Self::new(topic, saga_id, event.to_payload()?)
            .with_header(HEADER_SAGA_ID, saga_id)
            .with_header(
                HEADER_EVENT_TYPE,
                domain::qualified_event_type(event.event_type()),
            ))
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Publishes messages to the application's broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: BrokerMessage) -> Result<()>;
}

/// In-process broker backed by a tokio broadcast channel.
///
/// Keeps every published message for inspection and fans it out to live
/// subscribers.
#[derive(Clone)]
pub struct InMemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    published: Arc<RwLock<Vec<BrokerMessage>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            published: Arc::new(RwLock::new(Vec::new())),
            fail_on_publish: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerMessage> {
        self.sender.subscribe()
    }

    /// Configures the broker to reject publishes.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns every published message.
    pub async fn published(&self) -> Vec<BrokerMessage> {
        self.published.read().await.clone()
    }

    /// Returns the messages published to `topic`.
    pub async fn published_to(&self, topic: &str) -> Vec<BrokerMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(RelayError::Broker {
                topic: message.topic,
                reason: "injected failure".to_string(),
            });
        }

        tracing::debug!(topic = %message.topic, key = %message.key, "message published");
        self.published.write().await.push(message.clone());
        // No live subscribers is fine
        let _ = self.sender.send(message);
        Ok(())
    }
}
