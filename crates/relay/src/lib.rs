//! Outbox relay for the chat saga coordination core.
//!
//! Two paths move committed outbox rows onto the broker:
//! - [`CaptureConsumer`] handles change-capture records within milliseconds
//!   of the insert
//! - [`OutboxPoller`] periodically republishes anything still unprocessed
//!
//! Both decode through the versioned [`EventRegistry`] and publish through
//! the [`MessageBroker`] port.

pub mod broker;
pub mod capture;
pub mod dead_letter;
pub mod error;
pub mod poller;
pub mod registry;

pub use broker::{
    BrokerMessage, HEADER_EVENT_TYPE, HEADER_IDEMPOTENCY_KEY, HEADER_SAGA_ID, HEADER_SCHEMA_VERSION,
    InMemoryBroker, MessageBroker,
};
pub use capture::{CaptureConsumer, CaptureOutcome, CaptureRecord, subscription_feed};
pub use dead_letter::{BrokerDeadLetterPublisher, DEFAULT_DEAD_LETTER_TOPIC};
pub use error::{RelayError, Result};
pub use poller::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL, OutboxPoller, PollReport};
pub use registry::{CURRENT_SCHEMA_VERSION, EventDescriptor, EventRegistry};
