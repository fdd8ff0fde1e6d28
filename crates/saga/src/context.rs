//! Per-invocation saga state.

use std::collections::BTreeMap;

use common::SagaId;

use crate::error::SagaError;
use crate::state::SagaState;

/// Identity, execution history and outcome of one saga invocation.
///
/// Created fresh for every invocation and discarded once the caller has
/// inspected it. Nothing here is persisted.
#[derive(Debug, Default)]
pub struct SagaContext {
    pub saga_id: SagaId,
    pub state: SagaState,
    /// Names of the steps whose forward action succeeded, in execution order.
    pub executed_steps: Vec<String>,
    /// The failure that stopped forward progress.
    pub error: Option<SagaError>,
}

impl SagaContext {
    /// Creates a context with a fresh saga ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context with the given saga ID.
    pub fn with_id(saga_id: SagaId) -> Self {
        Self {
            saga_id,
            ..Self::default()
        }
    }

    /// Returns true if the saga completed every step.
    pub fn is_completed(&self) -> bool {
        self.state == SagaState::Completed
    }

    /// Returns the message of the recorded failure, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// A flow-specific context embedding the base [`SagaContext`].
pub trait FlowContext: Send + 'static {
    /// Returns the base context.
    fn saga(&self) -> &SagaContext;

    /// Returns the base context mutably.
    fn saga_mut(&mut self) -> &mut SagaContext;

    /// Serializes the flow's key fields for a dead-letter record.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "sagaId": self.saga().saga_id.as_str(),
            "state": self.saga().state,
            "executedSteps": self.saga().executed_steps,
        })
    }

    /// Participant identifiers attached to operator alerts.
    fn participants(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl FlowContext for SagaContext {
    fn saga(&self) -> &SagaContext {
        self
    }

    fn saga_mut(&mut self) -> &mut SagaContext {
        self
    }
}
