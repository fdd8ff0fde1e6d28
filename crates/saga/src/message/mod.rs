//! Message saga: persist a chat message, update its room, publish its events.
//!
//! Steps:
//! 1. `SaveMessageStep` writes the message document (own commit)
//! 2. `UpdateChatRoomStep` opens a relational transaction and stages the room update
//! 3. `PublishMessageEventsStep` joins that transaction, writes the outbox rows and commits

mod steps;

use std::collections::BTreeMap;
use std::sync::Arc;

use domain::{ChatMessage, ChatRoom};
use store::{MessageStore, RelationalStore};

use crate::context::{FlowContext, SagaContext};
use crate::error::Result;
use crate::escalation::Escalator;
use crate::orchestrator::SagaOrchestrator;
use crate::step::SagaStep;

pub use steps::{PublishMessageEventsStep, SaveMessageStep, UpdateChatRoomStep};

/// Saga type name used in logs and dead letters.
pub const SAGA_TYPE: &str = "MessageSaga";

/// Per-invocation state of the message saga.
pub struct MessageSagaContext<S: RelationalStore> {
    pub saga: SagaContext,
    /// The message as submitted.
    pub message: ChatMessage,
    /// The message as stored, with its ID. Set by step 1.
    pub saved_message: Option<ChatMessage>,
    /// The room before step 2 updated it.
    pub room_before: Option<ChatRoom>,
    /// The room as step 2 saved it.
    pub room_after: Option<ChatRoom>,
    /// Relational transaction opened by step 2 and committed by step 3.
    pub tx: Option<S::Tx>,
}

impl<S: RelationalStore> MessageSagaContext<S> {
    /// Creates a context with a fresh saga ID.
    pub fn new(message: ChatMessage) -> Self {
        Self {
            saga: SagaContext::new(),
            message,
            saved_message: None,
            room_before: None,
            room_after: None,
            tx: None,
        }
    }
}

impl<S: RelationalStore + 'static> FlowContext for MessageSagaContext<S> {
    fn saga(&self) -> &SagaContext {
        &self.saga
    }

    fn saga_mut(&mut self) -> &mut SagaContext {
        &mut self.saga
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "sagaId": self.saga.saga_id.as_str(),
            "state": self.saga.state,
            "executedSteps": self.saga.executed_steps,
            "roomId": self.message.room_id.to_string(),
            "senderId": self.message.sender_id.to_string(),
            "messageId": self
                .saved_message
                .as_ref()
                .and_then(|m| m.id)
                .map(|id| id.to_string()),
            "error": self.saga.error_message(),
        })
    }

    fn participants(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("senderId".to_string(), self.message.sender_id.to_string()),
            ("roomId".to_string(), self.message.room_id.to_string()),
        ])
    }
}

/// Persists a chat message across the document store, the room aggregate and the outbox.
pub struct MessageSaga<S: RelationalStore> {
    orchestrator: SagaOrchestrator<MessageSagaContext<S>>,
}

impl<S: RelationalStore + 'static> MessageSaga<S> {
    /// Creates the saga over the given stores.
    pub fn new<M: MessageStore + 'static>(messages: Arc<M>, store: Arc<S>) -> Self {
        let steps: Vec<Arc<dyn SagaStep<MessageSagaContext<S>>>> = vec![
            Arc::new(SaveMessageStep::new(messages)),
            Arc::new(UpdateChatRoomStep::new(Arc::clone(&store))),
            Arc::new(PublishMessageEventsStep::new(store)),
        ];
        Self {
            orchestrator: SagaOrchestrator::new(SAGA_TYPE, steps),
        }
    }

    /// Sets the escalator invoked when compensation fails.
    pub fn with_escalator(mut self, escalator: Arc<Escalator>) -> Self {
        self.orchestrator = self.orchestrator.with_escalator(escalator);
        self
    }

    /// Returns the declared step names.
    pub fn step_names(&self) -> Vec<String> {
        self.orchestrator.step_names()
    }

    /// Runs the saga for `message` and returns the final context.
    #[tracing::instrument(skip(self, message), fields(room_id = %message.room_id, sender_id = %message.sender_id))]
    pub async fn execute(&self, message: ChatMessage) -> Result<MessageSagaContext<S>> {
        self.orchestrator
            .execute(MessageSagaContext::new(message))
            .await
    }
}
