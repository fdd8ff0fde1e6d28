//! Friend-request saga: accept a request, create both friendships, publish the events.
//!
//! Step 1 commits on its own under an optimistic version check. Steps 2 and
//! 3 share one relational transaction so the friendships and their outbox
//! rows become visible together. The whole saga is retried with a fresh
//! context when step 1 loses a version race.

mod steps;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{FriendRequestId, FriendshipId, UserId};
use domain::{FriendRequestSnapshot, Friendship};
use store::RelationalStore;

use crate::context::{FlowContext, SagaContext};
use crate::error::Result;
use crate::escalation::Escalator;
use crate::orchestrator::SagaOrchestrator;
use crate::state::SagaState;
use crate::step::SagaStep;

pub use steps::{AcceptFriendRequestStep, CreateFriendshipsStep, PublishFriendEventsStep};

/// Saga type name used in logs and dead letters.
pub const SAGA_TYPE: &str = "FriendRequestSaga";

/// Per-invocation state of the friend-request saga.
pub struct FriendRequestSagaContext<S: RelationalStore> {
    pub saga: SagaContext,
    pub request_id: FriendRequestId,
    /// The user accepting the request.
    pub receiver_id: UserId,
    /// Set by step 1 from the stored request.
    pub requester_id: Option<UserId>,
    /// Status and response time before step 1 accepted the request.
    pub prior: Option<FriendRequestSnapshot>,
    /// Friendship records staged by step 2.
    pub friendships: Vec<Friendship>,
    /// Relational transaction opened by step 2 and committed by step 3.
    pub tx: Option<S::Tx>,
}

impl<S: RelationalStore> FriendRequestSagaContext<S> {
    /// Creates a context with a fresh saga ID.
    pub fn new(request_id: FriendRequestId, receiver_id: UserId) -> Self {
        Self {
            saga: SagaContext::new(),
            request_id,
            receiver_id,
            requester_id: None,
            prior: None,
            friendships: Vec::new(),
            tx: None,
        }
    }

    /// IDs of the friendship records created by step 2.
    pub fn friendship_ids(&self) -> Vec<FriendshipId> {
        self.friendships.iter().map(|f| f.id).collect()
    }
}

impl<S: RelationalStore + 'static> FlowContext for FriendRequestSagaContext<S> {
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
            "requestId": self.request_id.to_string(),
            "requesterId": self.requester_id.map(|id| id.to_string()),
            "receiverId": self.receiver_id.to_string(),
            "priorStatus": self.prior.map(|p| p.status.as_str()),
            "friendshipIds": self
                .friendship_ids()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            "error": self.saga.error_message(),
        })
    }

    fn participants(&self) -> BTreeMap<String, String> {
        let mut participants = BTreeMap::from([
            ("requestId".to_string(), self.request_id.to_string()),
            ("receiverId".to_string(), self.receiver_id.to_string()),
        ]);
        if let Some(requester_id) = self.requester_id {
            participants.insert("requesterId".to_string(), requester_id.to_string());
        }
        participants
    }
}

/// Backoff schedule for version-conflict retries.
///
/// The n-th delay is slept before the n-th attempt, so the schedule length
/// is the attempt bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_millis(10),
            Duration::from_millis(100),
        ])
    }
}

impl RetryPolicy {
    /// Creates a policy from a backoff schedule. An empty schedule means one attempt.
    pub fn new(mut backoff: Vec<Duration>) -> Self {
        if backoff.is_empty() {
            backoff.push(Duration::ZERO);
        }
        Self { backoff }
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> usize {
        self.backoff.len()
    }

    /// Returns the delay slept before each attempt.
    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }
}

/// Accepts friend requests across the relational store and the outbox.
pub struct FriendRequestSaga<S: RelationalStore> {
    orchestrator: SagaOrchestrator<FriendRequestSagaContext<S>>,
    retry: RetryPolicy,
}

impl<S: RelationalStore + 'static> FriendRequestSaga<S> {
    /// Creates the saga over the given store with the default retry policy.
    pub fn new(store: Arc<S>) -> Self {
        let steps: Vec<Arc<dyn SagaStep<FriendRequestSagaContext<S>>>> = vec![
            Arc::new(AcceptFriendRequestStep::new(Arc::clone(&store))),
            Arc::new(CreateFriendshipsStep::new(Arc::clone(&store))),
            Arc::new(PublishFriendEventsStep::new(store)),
        ];
        Self {
            orchestrator: SagaOrchestrator::new(SAGA_TYPE, steps),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the escalator invoked when compensation fails.
    pub fn with_escalator(mut self, escalator: Arc<Escalator>) -> Self {
        self.orchestrator = self.orchestrator.with_escalator(escalator);
        self
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the declared step names.
    pub fn step_names(&self) -> Vec<String> {
        self.orchestrator.step_names()
    }

    /// Accepts `request_id` on behalf of `receiver_id`.
    ///
    /// Each attempt runs with a fresh context. Only a version conflict is
    /// retried; any other outcome, or running out of attempts, returns the
    /// last context as-is.
    #[tracing::instrument(skip(self), fields(saga_type = SAGA_TYPE))]
    pub async fn accept(
        &self,
        request_id: FriendRequestId,
        receiver_id: UserId,
    ) -> Result<FriendRequestSagaContext<S>> {
        let backoff = self.retry.backoff();
        let mut attempt = 0;

        loop {
            let delay = backoff[attempt];
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            let ctx = self
                .orchestrator
                .execute(FriendRequestSagaContext::new(request_id, receiver_id))
                .await?;

            let conflicted = ctx.saga.state != SagaState::Completed
                && ctx
                    .saga
                    .error
                    .as_ref()
                    .is_some_and(|e| e.is_version_conflict());

            if !conflicted || attempt == backoff.len() {
                if conflicted {
                    metrics::counter!("saga_retries_exhausted_total", "saga_type" => SAGA_TYPE)
                        .increment(1);
                    tracing::warn!(attempt, "version conflict retries exhausted");
                }
                return Ok(ctx);
            }

            metrics::counter!("saga_retries_total", "saga_type" => SAGA_TYPE).increment(1);
            tracing::info!(attempt, saga_id = %ctx.saga.saga_id, "version conflict, retrying");
        }
    }
}
