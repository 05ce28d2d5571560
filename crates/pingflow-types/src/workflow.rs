//! Workflow domain types for pingflow.
//!
//! `WorkflowRun` is the unit of durable execution: everything the engine
//! needs to resume a run after a restart is on this record, including the
//! step memo table. Definitions themselves hold closures and live in
//! `pingflow-core`; only their trigger configuration is plain data.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow definition is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Exact-name event trigger.
    Event {
        /// Event name to match (no wildcards).
        name: String,
    },
    /// Calendar schedule trigger.
    Cron {
        /// Cron expression or human-readable schedule string.
        schedule: String,
        /// IANA timezone (e.g. "America/New_York"); UTC when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Run State
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for a worker (new, woken, or backing off after a retry).
    Pending,
    /// Claimed by a worker holding the lease.
    Running,
    /// Parked until `wake_at`.
    Sleeping,
    Completed,
    Failed,
}

impl RunState {
    /// Completed and Failed runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Sleeping => "sleeping",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "sleeping" => Ok(RunState::Sleeping),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            other => Err(format!("invalid run state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger snapshot
// ---------------------------------------------------------------------------

/// A single cron fire that created a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronFire {
    /// Normalized schedule expression.
    pub schedule: String,
    /// Timezone the schedule was evaluated in.
    pub timezone: String,
    /// The scheduled slot this run belongs to.
    pub scheduled_for: DateTime<Utc>,
    /// When the scheduler actually observed the slot.
    pub fired_at: DateTime<Utc>,
}

/// Snapshot of whatever created the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    Event(Event),
    Cron(CronFire),
}

impl RunTrigger {
    /// The triggering event, if this run was event-driven.
    pub fn event(&self) -> Option<&Event> {
        match self {
            RunTrigger::Event(e) => Some(e),
            RunTrigger::Cron(_) => None,
        }
    }

    /// Short label for logs and tables.
    pub fn label(&self) -> String {
        match self {
            RunTrigger::Event(e) => format!("event:{}", e.name),
            RunTrigger::Cron(c) => format!("cron:{}", c.scheduled_for.to_rfc3339()),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// Recorded result of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMemo {
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// One durable execution instance of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 (or UUIDv5 for deduplicated triggers).
    pub id: Uuid,
    /// Owning definition id.
    pub definition_id: String,
    /// Event or cron fire that created the run.
    pub trigger: RunTrigger,
    pub state: RunState,
    /// Index of the next step to execute. Never decreases.
    pub cursor: usize,
    /// Completed step results keyed by step name.
    #[serde(default)]
    pub step_memo: HashMap<String, StepMemo>,
    /// Wake time; set only while `Sleeping`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Earliest time a `Pending` run may be claimed again after a retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Failed attempts of the current step; reset when a step succeeds.
    #[serde(default)]
    pub attempt: u32,
    /// Last error (the fatal one for Failed runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optimistic concurrency version, bumped by every store write.
    #[serde(default)]
    pub version: u64,
    /// Worker currently holding the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh `Pending` run at cursor 0.
    pub fn new(id: Uuid, definition_id: impl Into<String>, trigger: RunTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id,
            definition_id: definition_id.into(),
            trigger,
            state: RunState::Pending,
            cursor: 0,
            step_memo: HashMap::new(),
            wake_at: None,
            retry_at: None,
            attempt: 0,
            error: None,
            version: 0,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Memoized result for a step, if the step already completed.
    pub fn memo(&self, step_name: &str) -> Option<&serde_json::Value> {
        self.step_memo.get(step_name).map(|m| &m.result)
    }

    /// Drop the lease fields.
    pub fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Query filter for the observability read path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.state.is_none_or(|s| s == run.state)
            && self
                .definition_id
                .as_deref()
                .is_none_or(|d| d == run.definition_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
