//! In-process `RunStore` backed by `DashMap`.
//!
//! Every claim and compare-and-swap happens while holding the entry's shard
//! lock, so the single-writer-per-run rule holds across tasks sharing one
//! store. Used by tests and by embedders that do not need durability.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pingflow_types::error::RepositoryError;
use pingflow_types::workflow::{RunFilter, RunState, WorkflowRun};
use uuid::Uuid;

use super::run_store::{RunStore, apply_claim, is_claimable};

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, WorkflowRun>,
    cron_markers: DashMap<String, DateTime<Utc>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(true)
            }
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn update_run(&self, run: &WorkflowRun, expected_version: u64) -> Result<(), RepositoryError> {
        let mut stored = self.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict(format!(
                "run {} is at version {}, expected {expected_version}",
                run.id, stored.version
            )));
        }

        let mut next = run.clone();
        for (name, memo) in stored.step_memo.drain() {
            next.step_memo.insert(name, memo);
        }
        next.version = expected_version + 1;
        *stored = next;
        Ok(())
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut claimed = Vec::new();
        for mut entry in self.runs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let run = entry.value_mut();
            if is_claimable(run, now) {
                apply_claim(run, worker_id, now, lease_ttl);
                claimed.push(run.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_run(
        &self,
        run_id: &Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let Some(mut stored) = self.runs.get_mut(run_id) else {
            return Ok(None);
        };
        if !is_claimable(&stored, now) {
            return Ok(None);
        }
        apply_claim(&mut stored, worker_id, now, lease_ttl);
        Ok(Some(stored.clone()))
    }

    async fn wake_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let mut woken = Vec::new();
        for mut entry in self.runs.iter_mut() {
            let run = entry.value_mut();
            let due = run.state == RunState::Sleeping && run.wake_at.is_some_and(|at| at <= now);
            if due {
                run.state = RunState::Pending;
                run.version += 1;
                run.updated_at = now;
                woken.push(run.id);
            }
        }
        Ok(woken)
    }

    async fn get_cron_marker(&self, definition_id: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        Ok(self.cron_markers.get(definition_id).map(|m| *m.value()))
    }

    async fn set_cron_marker(
        &self,
        definition_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        match (self.cron_markers.entry(definition_id.to_string()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(next);
                Ok(true)
            }
            (Entry::Occupied(mut slot), Some(prev)) if *slot.get() == prev => {
                slot.insert(next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pingflow_types::event::Event;
    use pingflow_types::workflow::{RunTrigger, StepMemo};
    use serde_json::json;

    fn sample_run(now: DateTime<Utc>) -> WorkflowRun {
        let event = Event::from_json("story.created", json!({"storyId": "s1"}), now);
        WorkflowRun::new(Uuid::now_v7(), "story-expiry", RunTrigger::Event(event), now)
    }

    #[tokio::test]
    async fn create_run_rejects_duplicate_id() {
        let store = InMemoryRunStore::new();
        let run = sample_run(Utc::now());
        assert!(store.create_run(&run).await.unwrap());
        assert!(!store.create_run(&run).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_run_is_compare_and_swap() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let mut run = sample_run(now);
        store.create_run(&run).await.unwrap();

        run.cursor = 1;
        store.update_run(&run, 0).await.unwrap();
        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.cursor, 1);

        // Stale writer still believes version 0
        let err = store.update_run(&run, 0).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_run_never_drops_memo_entries() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let mut run = sample_run(now);
        run.step_memo.insert(
            "wait-24-hours".to_string(),
            StepMemo { result: json!("first"), completed_at: now },
        );
        store.create_run(&run).await.unwrap();

        let mut stale = run.clone();
        stale.step_memo.clear();
        stale.step_memo.insert(
            "delete-story".to_string(),
            StepMemo { result: json!("second"), completed_at: now },
        );
        store.update_run(&stale, 0).await.unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.memo("wait-24-hours"), Some(&json!("first")));
        assert_eq!(stored.memo("delete-story"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn claim_run_is_exclusive_until_lease_expires() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = sample_run(now);
        store.create_run(&run).await.unwrap();
        let ttl = Duration::seconds(60);

        let first = store.claim_run(&run.id, "w1", now, ttl).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_run(&run.id, "w2", now, ttl).await.unwrap();
        assert!(second.is_none());

        let reclaimed = store
            .claim_run(&run.id, "w2", now + ttl, ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));
        assert_eq!(reclaimed.version, 2);
    }

    #[tokio::test]
    async fn claim_due_respects_limit_and_state() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.create_run(&sample_run(now)).await.unwrap();
        }
        let mut sleeping = sample_run(now);
        sleeping.state = RunState::Sleeping;
        sleeping.wake_at = Some(now + Duration::hours(1));
        store.create_run(&sleeping).await.unwrap();

        let batch = store.claim_due("w1", now, Duration::seconds(60), 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let rest = store.claim_due("w2", now, Duration::seconds(60), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        let none = store.claim_due("w3", now, Duration::seconds(60), 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn wake_due_moves_sleepers_to_pending() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let mut run = sample_run(now);
        run.state = RunState::Sleeping;
        run.wake_at = Some(now + Duration::hours(24));
        store.create_run(&run).await.unwrap();

        assert!(store.wake_due(now + Duration::hours(23)).await.unwrap().is_empty());
        let woken = store.wake_due(now + Duration::hours(24)).await.unwrap();
        assert_eq!(woken, vec![run.id]);

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Pending);
        assert_eq!(stored.wake_at, run.wake_at);
    }

    #[tokio::test]
    async fn cron_marker_compare_and_swap() {
        let store = InMemoryRunStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::days(1);

        assert!(store.get_cron_marker("digest").await.unwrap().is_none());
        assert!(store.set_cron_marker("digest", None, t0, t0).await.unwrap());
        assert!(!store.set_cron_marker("digest", None, t1, t0).await.unwrap());
        assert!(store.set_cron_marker("digest", Some(t0), t1, t0).await.unwrap());
        assert!(!store.set_cron_marker("digest", Some(t0), t1, t0).await.unwrap());
        assert_eq!(store.get_cron_marker("digest").await.unwrap(), Some(t1));
    }

    #[tokio::test]
    async fn list_runs_filters_newest_first() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let older = sample_run(now - Duration::minutes(5));
        let newer = sample_run(now);
        store.create_run(&older).await.unwrap();
        store.create_run(&newer).await.unwrap();

        let all = store.list_runs(&RunFilter::default(), 10).await.unwrap();
        assert_eq!(all[0].id, newer.id);
        assert_eq!(all[1].id, older.id);

        let failed = store
            .list_runs(&RunFilter { state: Some(RunState::Failed), definition_id: None }, 10)
            .await
            .unwrap();
        assert!(failed.is_empty());
    }
}
