//! Workflow definitions: a trigger plus an ordered list of named steps.
//!
//! Definitions are built in code with a small builder and registered once at
//! startup. Step order is execution order; a run's cursor indexes into it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pingflow_types::workflow::TriggerConfig;

use super::step::{StepAction, StepContext, StepKind, StepSpec};

/// Immutable description of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Unique id, also used as the run's `definition_id`.
    pub id: String,
    pub trigger: TriggerConfig,
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Start a definition triggered by events named `event_name`.
    pub fn on_event(id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: TriggerConfig::Event {
                name: event_name.into(),
            },
            steps: Vec::new(),
        }
    }

    /// Start a definition triggered by a calendar schedule.
    ///
    /// `timezone` is an IANA name; `None` means UTC unless the schedule
    /// carries its own `TZ=` prefix.
    pub fn on_cron(id: impl Into<String>, schedule: impl Into<String>, timezone: Option<&str>) -> Self {
        Self {
            id: id.into(),
            trigger: TriggerConfig::Cron {
                schedule: schedule.into(),
                timezone: timezone.map(str::to_string),
            },
            steps: Vec::new(),
        }
    }

    /// Append an action step.
    pub fn run<A>(mut self, name: impl Into<String>, action: A) -> Self
    where
        A: StepAction + 'static,
    {
        self.steps.push(StepSpec {
            name: name.into(),
            kind: StepKind::Run(Arc::new(action)),
        });
        self
    }

    /// Append a durable sleep. `wake_at` is evaluated once; the result is
    /// memoized, so later replays reuse the same instant.
    pub fn sleep_until<F>(mut self, name: impl Into<String>, wake_at: F) -> Self
    where
        F: Fn(&StepContext) -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.steps.push(StepSpec {
            name: name.into(),
            kind: StepKind::SleepUntil(Arc::new(wake_at)),
        });
        self
    }

    /// Event name this definition listens to, if event-triggered.
    pub fn event_name(&self) -> Option<&str> {
        match &self.trigger {
            TriggerConfig::Event { name } => Some(name),
            TriggerConfig::Cron { .. } => None,
        }
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }
}
