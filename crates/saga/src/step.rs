use async_trait::async_trait;

use crate::error::Result;

/// A unit of saga work with a forward action and a compensating action.
///
/// `execute` mutates one store. `Ok` means the forward effect is durable;
/// the orchestrator then records [`SagaStep::name`] in the context's
/// executed steps. `compensate` undoes that effect and must be idempotent:
/// it reports `Ok` when the forward effect never happened or was already
/// undone.
#[async_trait]
pub trait SagaStep<C>: Send + Sync {
    /// Stable step name used in logs and dead-letter records.
    fn name(&self) -> &'static str;

    /// Runs the forward action.
    async fn execute(&self, ctx: &mut C) -> Result<()>;

    /// Undoes the forward action.
    async fn compensate(&self, ctx: &mut C) -> Result<()>;
}
