//! Saga orchestrator for running linear step lists with reverse compensation.

use std::sync::Arc;

use crate::context::FlowContext;
use crate::error::{Result, SagaError};
use crate::escalation::{EscalationReport, Escalator};
use crate::state::SagaState;
use crate::step::SagaStep;

/// Executes an ordered list of steps against a context.
///
/// On the first failing step the orchestrator compensates every executed
/// step in reverse order, best-effort. If any compensation fails the saga
/// ends in [`SagaState::Failed`] and is handed to the [`Escalator`].
pub struct SagaOrchestrator<C> {
    saga_type: &'static str,
    steps: Arc<[Arc<dyn SagaStep<C>>]>,
    escalator: Option<Arc<Escalator>>,
}

impl<C> Clone for SagaOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            saga_type: self.saga_type,
            steps: Arc::clone(&self.steps),
            escalator: self.escalator.clone(),
        }
    }
}

impl<C: FlowContext> SagaOrchestrator<C> {
    /// Creates an orchestrator for `saga_type` with the given step list.
    pub fn new(saga_type: &'static str, steps: Vec<Arc<dyn SagaStep<C>>>) -> Self {
        Self {
            saga_type,
            steps: steps.into(),
            escalator: None,
        }
    }

    /// Sets the escalator invoked when compensation fails.
    pub fn with_escalator(mut self, escalator: Arc<Escalator>) -> Self {
        self.escalator = Some(escalator);
        self
    }

    /// Returns the saga type name.
    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Returns the declared step names, in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    /// Runs the saga to a terminal state and returns the context.
    ///
    /// The run happens on its own task, so dropping the returned future does
    /// not interrupt a step or compensation. Step failures are reported
    /// through the context's state, not as an `Err`.
    #[tracing::instrument(skip(self, ctx), fields(saga_type = self.saga_type, saga_id = %ctx.saga().saga_id))]
    pub async fn execute(&self, ctx: C) -> Result<C> {
        let saga_id = ctx.saga().saga_id.clone();
        let run = self.clone();

        match tokio::spawn(async move { run.run(ctx).await }).await {
            Ok(ctx) => Ok(ctx),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SagaError::Interrupted { saga_id }),
        }
    }

    async fn run(&self, mut ctx: C) -> C {
        metrics::counter!("saga_executions_total", "saga_type" => self.saga_type).increment(1);
        let saga_start = std::time::Instant::now();
        let saga_id = ctx.saga().saga_id.clone();

        for step in self.steps.iter() {
            tracing::info!(step = step.name(), "saga step started");

            match step.execute(&mut ctx).await {
                Ok(()) => {
                    ctx.saga_mut().executed_steps.push(step.name().to_string());
                }
                Err(e) => {
                    metrics::counter!("saga_step_failures_total", "step" => step.name())
                        .increment(1);
                    tracing::warn!(step = step.name(), error = %e, "saga step failed");
                    ctx.saga_mut().error = Some(e);
                    break;
                }
            }
        }

        if ctx.saga().error.is_none() {
            ctx.saga_mut().state = SagaState::Completed;
            let duration = saga_start.elapsed().as_secs_f64();
            metrics::histogram!("saga_duration_seconds").record(duration);
            metrics::counter!("saga_completed", "saga_type" => self.saga_type).increment(1);
            tracing::info!(%saga_id, duration, "saga completed successfully");
            return ctx;
        }

        ctx.saga_mut().state = SagaState::Compensating;
        let failures = self.compensate(&mut ctx).await;

        if failures.is_empty() {
            ctx.saga_mut().state = SagaState::Compensated;
            metrics::counter!("saga_compensated", "saga_type" => self.saga_type).increment(1);
            tracing::warn!(%saga_id, "saga compensated");
        } else {
            ctx.saga_mut().state = SagaState::Failed;
            metrics::counter!("saga_failed", "saga_type" => self.saga_type).increment(1);
            tracing::error!(%saga_id, failed_compensations = failures.len(), "saga failed");
            let report = self.escalation_report(&ctx, &failures);
            self.escalate(report).await;
        }

        metrics::histogram!("saga_duration_seconds").record(saga_start.elapsed().as_secs_f64());
        ctx
    }

    /// Compensates executed steps in reverse order, returning the failures.
    async fn compensate(&self, ctx: &mut C) -> Vec<SagaError> {
        let executed = ctx.saga().executed_steps.clone();
        let mut failures = Vec::new();

        for name in executed.iter().rev() {
            let Some(step) = self.steps.iter().find(|s| s.name() == name) else {
                continue;
            };

            match step.compensate(ctx).await {
                Ok(()) => tracing::info!(step = step.name(), "compensation step completed"),
                Err(e) => {
                    tracing::error!(step = step.name(), error = %e, "compensation step failed");
                    failures.push(SagaError::CompensationFailed {
                        step: step.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    fn escalation_report(&self, ctx: &C, failures: &[SagaError]) -> EscalationReport {
        let mut details = ctx.saga().error_message().unwrap_or_default();
        for failure in failures {
            details.push_str("; ");
            details.push_str(&failure.to_string());
        }

        EscalationReport {
            saga_id: ctx.saga().saga_id.clone(),
            saga_type: self.saga_type.to_string(),
            declared_steps: self.step_names(),
            error_details: details,
            snapshot: ctx.snapshot(),
            participants: ctx.participants(),
        }
    }

    async fn escalate(&self, report: EscalationReport) {
        match &self.escalator {
            Some(escalator) => escalator.escalate(&report).await,
            None => tracing::error!(
                saga_id = %report.saga_id,
                saga_type = self.saga_type,
                error = %report.error_details,
                "no escalator configured; saga requires manual intervention"
            ),
        }
    }
}
