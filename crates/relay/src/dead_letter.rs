//! Dead-letter publishing onto a broker topic.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{DeadLetterMessage, DeadLetterPublisher, EscalationError};

use crate::broker::{BrokerMessage, HEADER_SAGA_ID, MessageBroker};

/// Default topic for saga dead letters.
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "chat.saga.dead-letter";

/// Publishes saga dead letters as camelCase JSON, keyed by saga ID.
pub struct BrokerDeadLetterPublisher<B> {
    broker: Arc<B>,
    topic: String,
}

impl<B: MessageBroker> BrokerDeadLetterPublisher<B> {
    pub fn new(broker: Arc<B>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl<B: MessageBroker> DeadLetterPublisher for BrokerDeadLetterPublisher<B> {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<(), EscalationError> {
        let payload = serde_json::to_string(message)?;
        let record = BrokerMessage::new(&self.topic, &message.saga_id, payload)
            .with_header(HEADER_SAGA_ID, &message.saga_id)
            .with_header("sagaType", &message.saga_type);

        tracing::info!(
            topic = %self.topic,
            saga_id = %message.saga_id,
            saga_type = %message.saga_type,
            "publishing saga dead letter"
        );
        self.broker
            .publish(record)
            .await
            .map_err(|e| EscalationError::PublishFailed(e.to_string()))
    }
}
