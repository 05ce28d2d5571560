//! Run store trait definition.
//!
//! The run store is the only shared mutable resource in the engine. Every
//! mutation of a run goes through either an atomic claim or a
//! compare-and-swap on the run's `version`; there is no read-then-write path.

use chrono::{DateTime, Duration, Utc};
use pingflow_types::error::RepositoryError;
use pingflow_types::workflow::{RunFilter, WorkflowRun};
use uuid::Uuid;

/// Durable storage for workflow runs, their step memos and cron markers.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run. Returns `false` (and writes nothing) if a run with
    /// the same id already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a run, memo table included.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs matching `filter`, newest first.
    fn list_runs(
        &self,
        filter: &RunFilter,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Write `run` if the stored version still equals `expected_version`.
    ///
    /// The stored version becomes `expected_version + 1` regardless of
    /// `run.version`. Memo entries are only ever added, never replaced.
    /// Returns `RepositoryError::Conflict` when another writer got there first.
    fn update_run(
        &self,
        run: &WorkflowRun,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Atomically lease up to `limit` runs that are due at `now`:
    /// `Pending` runs whose `retry_at` is unset or passed, and `Running`
    /// runs whose lease has expired. Claimed runs come back `Running`
    /// with `worker_id` as lease owner and the version bumped.
    fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Atomically lease one specific run under the same rules as
    /// `claim_due`. Returns `None` if the run is not claimable right now
    /// (leased by someone else, sleeping, backing off, or terminal).
    fn claim_run(
        &self,
        run_id: &Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Move every `Sleeping` run with `wake_at <= now` back to `Pending`.
    /// `wake_at` is kept; the sleep step clears it when it completes.
    /// Returns the ids that were woken.
    fn wake_due(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Cron markers
    // -----------------------------------------------------------------------

    /// The last scheduled slot recorded for a cron definition.
    fn get_cron_marker(
        &self,
        definition_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>, RepositoryError>> + Send;

    /// Set the marker to `next` only if it still equals `expected`,
    /// stamping the change at `now`. Returns `false` when another scheduler
    /// moved it first.
    fn set_cron_marker(
        &self,
        definition_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Claim rules shared by store implementations
// ---------------------------------------------------------------------------

/// Whether a worker may lease `run` at `now`.
///
/// Must agree with the SQL predicate used by the SQLite store.
pub fn is_claimable(run: &WorkflowRun, now: DateTime<Utc>) -> bool {
    use pingflow_types::workflow::RunState;

    match run.state {
        RunState::Pending => run.retry_at.is_none_or(|at| at <= now),
        RunState::Running => run.lease_expires_at.is_none_or(|at| at <= now),
        RunState::Sleeping | RunState::Completed | RunState::Failed => false,
    }
}

/// Apply a lease to `run` in place, bumping its version.
pub fn apply_claim(run: &mut WorkflowRun, worker_id: &str, now: DateTime<Utc>, lease_ttl: Duration) {
    use pingflow_types::workflow::RunState;

    run.state = RunState::Running;
    run.retry_at = None;
    run.lease_owner = Some(worker_id.to_string());
    run.lease_expires_at = Some(now + lease_ttl);
    run.version += 1;
    run.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingflow_types::event::Event;
    use pingflow_types::workflow::{RunState, RunTrigger};

    fn run_at(now: DateTime<Utc>) -> WorkflowRun {
        let event = Event::from_json("user.created", serde_json::json!({}), now);
        WorkflowRun::new(Uuid::now_v7(), "sync-user-created", RunTrigger::Event(event), now)
    }

    #[test]
    fn pending_run_claimable_unless_backing_off() {
        let now = Utc::now();
        let mut run = run_at(now);
        assert!(is_claimable(&run, now));

        run.retry_at = Some(now + Duration::seconds(30));
        assert!(!is_claimable(&run, now));
        assert!(is_claimable(&run, now + Duration::seconds(30)));
    }

    #[test]
    fn running_run_claimable_only_after_lease_expiry() {
        let now = Utc::now();
        let mut run = run_at(now);
        apply_claim(&mut run, "w1", now, Duration::seconds(300));
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.version, 1);
        assert_eq!(run.lease_owner.as_deref(), Some("w1"));

        assert!(!is_claimable(&run, now + Duration::seconds(299)));
        assert!(is_claimable(&run, now + Duration::seconds(300)));
    }

    #[test]
    fn sleeping_and_terminal_runs_never_claimable() {
        let now = Utc::now();
        let mut run = run_at(now);
        run.state = RunState::Sleeping;
        run.wake_at = Some(now - Duration::hours(1));
        assert!(!is_claimable(&run, now));

        run.wake_at = None;
        run.state = RunState::Completed;
        assert!(!is_claimable(&run, now));
        run.state = RunState::Failed;
        assert!(!is_claimable(&run, now));
    }
}
