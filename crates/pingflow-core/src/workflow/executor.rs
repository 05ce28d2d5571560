//! Step executor: runs a single step of a run with memoization and retry.
//!
//! The executor never touches the store. It reads and extends the run's
//! memo table in memory and reports what should happen next; the runner
//! decides how to persist that.
//!
//! # Memo semantics
//!
//! - `Run` step: memo holds the step's JSON result. A hit returns it without
//!   invoking the body.
//! - `SleepUntil` step: the target is computed the first time the step is
//!   reached and kept in `run.wake_at` while the run sleeps. The memo
//!   `{"wake_at": ...}` is written only once `now >= wake_at`.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use pingflow_types::config::RetryPolicy;
use pingflow_types::workflow::{StepMemo, WorkflowRun};
use serde_json::{Value, json};

use super::retry::RetryHandler;
use super::step::{StepContext, StepError, StepKind, StepSpec};

/// Default watchdog for a single step body.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What the runner should do after executing one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished (now or earlier); move the cursor past it.
    Completed(Value),
    /// Durable sleep not over yet; park the run until the instant.
    Suspended(DateTime<Utc>),
    /// Transient failure with attempts left; try again after `delay`.
    Retry { delay: Duration, error: String },
    /// Permanent failure; the run fails with this message.
    Fatal(String),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepExecutor {
    policy: RetryPolicy,
    step_timeout: StdDuration,
}

impl StepExecutor {
    pub fn new(policy: RetryPolicy, step_timeout: StdDuration) -> Self {
        Self {
            policy,
            step_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `step` against `run` at `now`.
    ///
    /// On success the memo entry is added to `run.step_memo` and the
    /// attempt counter is reset. On failure `run.attempt` is incremented.
    pub async fn execute(&self, run: &mut WorkflowRun, step: &StepSpec, now: DateTime<Utc>) -> StepOutcome {
        match &step.kind {
            StepKind::SleepUntil(wake_fn) => {
                if let Some(result) = run.memo(&step.name) {
                    return StepOutcome::Completed(result.clone());
                }

                let wake_at = match run.wake_at {
                    Some(wake_at) => wake_at,
                    None => {
                        let ctx = StepContext::for_run(run, &step.name, now);
                        let wake_at = wake_fn(&ctx);
                        run.wake_at = Some(wake_at);
                        wake_at
                    }
                };

                if now < wake_at {
                    tracing::debug!(
                        run_id = %run.id,
                        step = step.name.as_str(),
                        wake_at = %wake_at,
                        "step sleeping"
                    );
                    StepOutcome::Suspended(wake_at)
                } else {
                    let result = json!({ "wake_at": wake_at });
                    record(run, &step.name, result.clone(), now);
                    run.wake_at = None;
                    StepOutcome::Completed(result)
                }
            }
            StepKind::Run(action) => {
                if let Some(result) = run.memo(&step.name) {
                    tracing::debug!(run_id = %run.id, step = step.name.as_str(), "skipping memoized step");
                    return StepOutcome::Completed(result.clone());
                }

                let ctx = StepContext::for_run(run, &step.name, now);
                let started = std::time::Instant::now();
                let result = tokio::time::timeout(self.step_timeout, action.call(ctx)).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                let error = match result {
                    Ok(Ok(value)) => {
                        record(run, &step.name, value.clone(), now);
                        run.attempt = 0;
                        tracing::info!(
                            run_id = %run.id,
                            step = step.name.as_str(),
                            elapsed_ms,
                            "step completed"
                        );
                        return StepOutcome::Completed(value);
                    }
                    Ok(Err(StepError::Fatal(msg))) => {
                        tracing::warn!(run_id = %run.id, step = step.name.as_str(), error = %msg, "step failed fatally");
                        return StepOutcome::Fatal(format!("step '{}' failed: {msg}", step.name));
                    }
                    Ok(Err(StepError::Transient(msg))) => msg,
                    Err(_elapsed) => format!("timed out after {}s", self.step_timeout.as_secs()),
                };

                run.attempt += 1;
                if RetryHandler::should_retry(&self.policy, run.attempt) {
                    let delay = RetryHandler::backoff_delay(&self.policy, run.attempt);
                    tracing::warn!(
                        run_id = %run.id,
                        step = step.name.as_str(),
                        attempt = run.attempt,
                        retry_in_secs = delay.num_seconds(),
                        error = %error,
                        "step failed, will retry"
                    );
                    StepOutcome::Retry {
                        delay,
                        error: format!("step '{}' attempt {}: {error}", step.name, run.attempt),
                    }
                } else {
                    tracing::warn!(
                        run_id = %run.id,
                        step = step.name.as_str(),
                        attempts = run.attempt,
                        error = %error,
                        "step exhausted its retries"
                    );
                    StepOutcome::Fatal(format!(
                        "step '{}' failed after {} attempts: {error}",
                        step.name, run.attempt
                    ))
                }
            }
        }
    }
}

/// Insert a memo entry unless one already exists.
fn record(run: &mut WorkflowRun, step_name: &str, result: Value, now: DateTime<Utc>) {
    run.step_memo
        .entry(step_name.to_string())
        .or_insert(StepMemo {
            result,
            completed_at: now,
        });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
