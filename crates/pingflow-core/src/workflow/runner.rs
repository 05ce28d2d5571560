//! Workflow runner: advances a claimed run until it sleeps, backs off,
//! finishes, or fails.
//!
//! Every state change is written back with a compare-and-swap on the run's
//! version, so a worker whose lease was taken over can never overwrite the
//! new owner's progress. Losing the swap surfaces as `DuplicateClaim`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pingflow_types::workflow::{RunState, WorkflowRun};

use super::executor::{StepExecutor, StepOutcome};
use super::registry::WorkflowRegistry;
use crate::clock::Clock;
use crate::engine::EngineError;
use crate::repository::run_store::RunStore;

pub struct WorkflowRunner<S: RunStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    executor: StepExecutor,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
}

impl<S: RunStore> WorkflowRunner<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<WorkflowRegistry>,
        executor: StepExecutor,
        clock: Arc<dyn Clock>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            clock,
            lease_ttl,
        }
    }

    /// Drive `run`, which `worker_id` must have claimed, as far as it goes.
    ///
    /// Terminal runs are returned untouched. Returns the run as last
    /// persisted.
    pub async fn advance(&self, mut run: WorkflowRun, worker_id: &str) -> Result<WorkflowRun, EngineError> {
        if run.state.is_terminal() {
            return Ok(run);
        }
        if run.state != RunState::Running || run.lease_owner.as_deref() != Some(worker_id) {
            return Err(EngineError::NotClaimed(run.id));
        }

        let Some(definition) = self.registry.get(&run.definition_id) else {
            let now = self.clock.now();
            tracing::error!(
                run_id = %run.id,
                definition_id = run.definition_id.as_str(),
                "run references an unknown workflow definition"
            );
            run.state = RunState::Failed;
            run.error = Some(format!("unknown workflow definition '{}'", run.definition_id));
            run.release_lease();
            self.persist(&mut run, now).await?;
            return Ok(run);
        };

        loop {
            let now = self.clock.now();
            let Some(step) = definition.steps.get(run.cursor) else {
                run.state = RunState::Completed;
                run.error = None;
                run.release_lease();
                self.persist(&mut run, now).await?;
                tracing::info!(
                    run_id = %run.id,
                    definition_id = run.definition_id.as_str(),
                    steps = run.cursor,
                    "run completed"
                );
                return Ok(run);
            };

            match self.executor.execute(&mut run, step, now).await {
                StepOutcome::Completed(_) => {
                    run.cursor += 1;
                    run.error = None;
                    self.persist(&mut run, now).await?;
                }
                StepOutcome::Suspended(wake_at) => {
                    run.state = RunState::Sleeping;
                    run.wake_at = Some(wake_at);
                    run.release_lease();
                    self.persist(&mut run, now).await?;
                    tracing::info!(
                        run_id = %run.id,
                        step = step.name.as_str(),
                        wake_at = %wake_at,
                        "run sleeping"
                    );
                    return Ok(run);
                }
                StepOutcome::Retry { delay, error } => {
                    run.state = RunState::Pending;
                    run.retry_at = Some(now + delay);
                    run.error = Some(error);
                    run.release_lease();
                    self.persist(&mut run, now).await?;
                    return Ok(run);
                }
                StepOutcome::Fatal(error) => {
                    tracing::error!(run_id = %run.id, step = step.name.as_str(), error = %error, "run failed");
                    run.state = RunState::Failed;
                    run.error = Some(error);
                    run.release_lease();
                    self.persist(&mut run, now).await?;
                    return Ok(run);
                }
            }
        }
    }

    /// Compare-and-swap `run` into the store, renewing the lease when the
    /// run stays `Running`.
    async fn persist(&self, run: &mut WorkflowRun, now: DateTime<Utc>) -> Result<(), EngineError> {
        if run.state == RunState::Running {
            run.lease_expires_at = Some(now + self.lease_ttl);
        }
        run.updated_at = now;

        match self.store.update_run(run, run.version).await {
            Ok(()) => {
                run.version += 1;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(run_id = %run.id, error = %e, "lost run to another worker");
                Err(EngineError::DuplicateClaim(run.id))
            }
            Err(e) => Err(EngineError::Store(e)),
        }
    }
}
