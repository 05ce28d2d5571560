//! Step bodies and the context they run with.
//!
//! A workflow is an ordered list of named steps. Each step is either an
//! action (`Run`) whose JSON result is memoized, or a durable sleep
//! (`SleepUntil`) whose wake time is computed once and memoized the same way.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use pingflow_types::error::RepositoryError;
use pingflow_types::event::Event;
use pingflow_types::workflow::{CronFire, RunTrigger, WorkflowRun};
use serde_json::Value;
use uuid::Uuid;

use crate::mail::MailError;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure reported by a step body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Worth retrying with backoff (network, store, mail relay).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (bad payload, missing record). Fails the run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StepError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StepError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Fatal(_))
    }

    /// The message without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            StepError::Transient(m) | StepError::Fatal(m) => m,
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(e: RepositoryError) -> Self {
        StepError::Transient(e.to_string())
    }
}

impl From<MailError> for StepError {
    fn from(e: MailError) -> Self {
        StepError::Transient(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Read-only view of a run handed to a step body.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub definition_id: String,
    pub step_name: String,
    pub trigger: RunTrigger,
    pub created_at: DateTime<Utc>,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub now: DateTime<Utc>,
    memo: HashMap<String, Value>,
}

impl StepContext {
    pub fn for_run(run: &WorkflowRun, step_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run.id,
            definition_id: run.definition_id.clone(),
            step_name: step_name.to_string(),
            trigger: run.trigger.clone(),
            created_at: run.created_at,
            attempt: run.attempt + 1,
            now,
            memo: run
                .step_memo
                .iter()
                .map(|(name, m)| (name.clone(), m.result.clone()))
                .collect(),
        }
    }

    pub fn event(&self) -> Option<&Event> {
        self.trigger.event()
    }

    pub fn cron_fire(&self) -> Option<&CronFire> {
        match &self.trigger {
            RunTrigger::Cron(fire) => Some(fire),
            RunTrigger::Event(_) => None,
        }
    }

    /// A payload field of the triggering event.
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.event().and_then(|e| e.data.get(key))
    }

    /// A required string payload field. Missing or non-string is fatal.
    pub fn require_str(&self, key: &str) -> Result<&str, StepError> {
        self.data(key)
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::fatal(format!("event payload is missing string field '{key}'")))
    }

    /// Result of an earlier step of the same run.
    pub fn memo(&self, step_name: &str) -> Option<&Value> {
        self.memo.get(step_name)
    }
}

// ---------------------------------------------------------------------------
// Step bodies
// ---------------------------------------------------------------------------

pub type StepFuture = BoxFuture<'static, Result<Value, StepError>>;

/// An action step body.
///
/// Implemented for any `Fn(StepContext) -> impl Future` closure, so
/// definitions can pass async closures directly.
pub trait StepAction: Send + Sync {
    fn call(&self, ctx: StepContext) -> StepFuture;
}

impl<F, Fut> StepAction for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    fn call(&self, ctx: StepContext) -> StepFuture {
        Box::pin(self(ctx))
    }
}

/// Computes the wake time of a sleep step.
pub type WakeFn = Arc<dyn Fn(&StepContext) -> DateTime<Utc> + Send + Sync>;

/// What a step does.
#[derive(Clone)]
pub enum StepKind {
    Run(Arc<dyn StepAction>),
    SleepUntil(WakeFn),
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Run(_) => f.write_str("Run"),
            StepKind::SleepUntil(_) => f.write_str("SleepUntil"),
        }
    }
}

/// A named step within a definition.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
}

/// Wake `delay` after the run was created.
pub fn after_creation(delay: Duration) -> impl Fn(&StepContext) -> DateTime<Utc> + Send + Sync + 'static {
    move |ctx| ctx.created_at + delay
}
