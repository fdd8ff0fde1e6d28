//! Saga coordination for the chat backend.
//!
//! This crate provides a generic orchestrator for linear sagas with
//! reverse-order compensation, and the two concrete flows built on it:
//!
//! - [`MessageSaga`]: save the message document, update the room metadata,
//!   write `MessageSentEvent` (and `MentionEvent`) to the outbox
//! - [`FriendRequestSaga`]: accept the request, create both friendships,
//!   write one `FriendAddedEvent` per side, retrying on version conflicts
//!
//! Outbox rows are written through [`OutboxWriter`] inside the same
//! relational transaction as the state they describe. When compensation
//! fails the [`Escalator`] emits a dead letter and a critical alert.

pub mod context;
pub mod error;
pub mod escalation;
pub mod friend_request;
pub mod message;
pub mod orchestrator;
pub mod outbox_writer;
pub mod state;
pub mod step;

pub use context::{FlowContext, SagaContext};
pub use error::{Result, SagaError};
pub use escalation::{
    ALERT_LEVEL_CRITICAL, AlertSender, CriticalAlert, DeadLetterMessage, DeadLetterPublisher,
    EscalationError, EscalationReport, Escalator, RecordingAlertSender,
    RecordingDeadLetterPublisher,
};
pub use friend_request::{FriendRequestSaga, FriendRequestSagaContext, RetryPolicy};
pub use message::{MessageSaga, MessageSagaContext};
pub use orchestrator::SagaOrchestrator;
pub use outbox_writer::{OutboxWrite, OutboxWriter};
pub use state::SagaState;
pub use step::SagaStep;
