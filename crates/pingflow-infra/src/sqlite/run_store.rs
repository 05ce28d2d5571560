//! SQLite run store implementation.
//!
//! Implements `RunStore` from `pingflow-core` using sqlx with split
//! read/write pools. Every mutation runs on the single writer connection:
//! claims are one `UPDATE ... RETURNING` statement and updates are guarded
//! by `WHERE version = ?`, so no two workers can both win a run.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use pingflow_core::repository::run_store::RunStore;
use pingflow_types::error::RepositoryError;
use pingflow_types::workflow::{RunFilter, RunState, RunTrigger, StepMemo, WorkflowRun};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_error};

/// SQLite-backed implementation of `RunStore`.
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const RUN_SELECT: &str = "SELECT id, definition_id, trigger_json, state, step_cursor, wake_at, retry_at, attempt, \
     error, version, lease_owner, lease_expires_at, created_at, updated_at FROM workflow_runs";

/// Claim predicate; `?3` is the current time. Must agree with
/// `pingflow_core::repository::run_store::is_claimable`.
const CLAIMABLE: &str = "((state = 'pending' AND (retry_at IS NULL OR retry_at <= ?3)) \
     OR (state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?3)))";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    definition_id: String,
    trigger_json: String,
    state: String,
    step_cursor: i64,
    wake_at: Option<String>,
    retry_at: Option<String>,
    attempt: i64,
    error: Option<String>,
    version: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            trigger_json: row.try_get("trigger_json")?,
            state: row.try_get("state")?,
            step_cursor: row.try_get("step_cursor")?,
            wake_at: row.try_get("wake_at")?,
            retry_at: row.try_get("retry_at")?,
            attempt: row.try_get("attempt")?,
            error: row.try_get("error")?,
            version: row.try_get("version")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self, step_memo: HashMap<String, StepMemo>) -> Result<WorkflowRun, RepositoryError> {
        let state: RunState = self.state.parse().map_err(RepositoryError::Query)?;
        let trigger: RunTrigger = serde_json::from_str(&self.trigger_json)
            .map_err(|e| RepositoryError::Query(format!("invalid trigger JSON: {e}")))?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            definition_id: self.definition_id,
            trigger,
            state,
            cursor: self.step_cursor as usize,
            step_memo,
            wake_at: self.wake_at.as_deref().map(parse_datetime).transpose()?,
            retry_at: self.retry_at.as_deref().map(parse_datetime).transpose()?,
            attempt: self.attempt as u32,
            error: self.error,
            version: self.version as u64,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fetch_memos(conn: &mut SqliteConnection, run_id: &str) -> Result<HashMap<String, StepMemo>, RepositoryError> {
    let rows = sqlx::query("SELECT step_name, result, completed_at FROM workflow_step_memos WHERE run_id = ?")
        .bind(run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;

    let mut memos = HashMap::with_capacity(rows.len());
    for row in &rows {
        let step_name: String = row.try_get("step_name").map_err(query_error)?;
        let result: String = row.try_get("result").map_err(query_error)?;
        let completed_at: String = row.try_get("completed_at").map_err(query_error)?;
        let result = serde_json::from_str(&result)
            .map_err(|e| RepositoryError::Query(format!("invalid memo JSON for step {step_name}: {e}")))?;
        memos.insert(
            step_name,
            StepMemo {
                result,
                completed_at: parse_datetime(&completed_at)?,
            },
        );
    }
    Ok(memos)
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
    let sql = format!("{RUN_SELECT} WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;

    let Some(row) = row else {
        return Ok(None);
    };
    let r = RunRow::from_row(&row).map_err(query_error)?;
    let memos = fetch_memos(conn, run_id).await?;
    Ok(Some(r.into_run(memos)?))
}

/// Insert memo rows that do not exist yet. Existing rows are left alone.
async fn insert_memos(conn: &mut SqliteConnection, run: &WorkflowRun) -> Result<(), RepositoryError> {
    for (step_name, memo) in &run.step_memo {
        let result = serde_json::to_string(&memo.result)
            .map_err(|e| RepositoryError::Query(format!("serialize memo for step {step_name}: {e}")))?;
        sqlx::query(
            "INSERT OR IGNORE INTO workflow_step_memos (run_id, step_name, result, completed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(step_name)
        .bind(&result)
        .bind(format_datetime(&memo.completed_at))
        .execute(&mut *conn)
        .await
        .map_err(query_error)?;
    }
    Ok(())
}

/// Load the runs named by `rows` (each carrying an `id` column), oldest first.
async fn fetch_claimed(
    conn: &mut SqliteConnection,
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowRun>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id").map_err(query_error)?;
        if let Some(run) = fetch_run(conn, &id).await? {
            runs.push(run);
        }
    }
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(runs)
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let trigger_json = serde_json::to_string(&run.trigger)
            .map_err(|e| RepositoryError::Query(format!("serialize trigger: {e}")))?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO workflow_runs
               (id, definition_id, trigger_json, state, step_cursor, wake_at, retry_at, attempt,
                error, version, lease_owner, lease_expires_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition_id)
        .bind(&trigger_json)
        .bind(run.state.as_str())
        .bind(run.cursor as i64)
        .bind(run.wake_at.as_ref().map(format_datetime))
        .bind(run.retry_at.as_ref().map(format_datetime))
        .bind(run.attempt as i64)
        .bind(&run.error)
        .bind(run.version as i64)
        .bind(&run.lease_owner)
        .bind(run.lease_expires_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_memos(&mut tx, run).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(true)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        fetch_run(&mut conn, &run_id.to_string()).await
    }

    async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let sql = format!(
            "{RUN_SELECT} WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR definition_id = ?2)
             ORDER BY created_at DESC, id DESC LIMIT ?3"
        );

        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        let rows = sqlx::query(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.definition_id.as_deref())
            .bind(i64::from(limit))
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_error)?;
            let memos = fetch_memos(&mut conn, &r.id).await?;
            runs.push(r.into_run(memos)?);
        }
        Ok(runs)
    }

    async fn update_run(&self, run: &WorkflowRun, expected_version: u64) -> Result<(), RepositoryError> {
        let run_id = run.id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 state = ?, step_cursor = ?, wake_at = ?, retry_at = ?, attempt = ?, error = ?,
                 version = ?, lease_owner = ?, lease_expires_at = ?, updated_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(run.state.as_str())
        .bind(run.cursor as i64)
        .bind(run.wake_at.as_ref().map(format_datetime))
        .bind(run.retry_at.as_ref().map(format_datetime))
        .bind(run.attempt as i64)
        .bind(&run.error)
        .bind((expected_version + 1) as i64)
        .bind(&run.lease_owner)
        .bind(run.lease_expires_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.updated_at))
        .bind(&run_id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM workflow_runs WHERE id = ?")
                .bind(&run_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
            return match current {
                None => Err(RepositoryError::NotFound),
                Some((version,)) => Err(RepositoryError::Conflict(format!(
                    "run {run_id} is at version {version}, expected {expected_version}"
                ))),
            };
        }

        insert_memos(&mut tx, run).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let sql = format!(
            "UPDATE workflow_runs
             SET state = 'running', retry_at = NULL, lease_owner = ?1, lease_expires_at = ?2,
                 version = version + 1, updated_at = ?3
             WHERE id IN (
                 SELECT id FROM workflow_runs WHERE {CLAIMABLE}
                 ORDER BY created_at, id LIMIT ?4
             )
             RETURNING id"
        );

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(format_datetime(&(now + lease_ttl)))
            .bind(format_datetime(&now))
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error)?;

        let runs = fetch_claimed(&mut tx, &rows).await?;
        tx.commit().await.map_err(query_error)?;

        if !runs.is_empty() {
            tracing::debug!(worker_id, claimed = runs.len(), "claimed due runs");
        }
        Ok(runs)
    }

    async fn claim_run(
        &self,
        run_id: &Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let sql = format!(
            "UPDATE workflow_runs
             SET state = 'running', retry_at = NULL, lease_owner = ?1, lease_expires_at = ?2,
                 version = version + 1, updated_at = ?3
             WHERE id = ?4 AND {CLAIMABLE}
             RETURNING id"
        );

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(format_datetime(&(now + lease_ttl)))
            .bind(format_datetime(&now))
            .bind(run_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error)?;

        let run = fetch_claimed(&mut tx, &rows).await?.into_iter().next();
        tx.commit().await.map_err(query_error)?;
        Ok(run)
    }

    async fn wake_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE workflow_runs
             SET state = 'pending', version = version + 1, updated_at = ?1
             WHERE state = 'sleeping' AND wake_at IS NOT NULL AND wake_at <= ?1
             RETURNING id",
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn get_cron_marker(&self, definition_id: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT last_slot FROM cron_markers WHERE definition_id = ?")
            .bind(definition_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|(slot,)| parse_datetime(&slot)).transpose()
    }

    async fn set_cron_marker(
        &self,
        definition_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now = format_datetime(&now);
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT OR IGNORE INTO cron_markers (definition_id, last_slot, updated_at) VALUES (?, ?, ?)",
                )
                .bind(definition_id)
                .bind(format_datetime(&next))
                .bind(&now)
                .execute(&self.pool.writer)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE cron_markers SET last_slot = ?, updated_at = ? WHERE definition_id = ? AND last_slot = ?",
                )
                .bind(format_datetime(&next))
                .bind(&now)
                .bind(definition_id)
                .bind(format_datetime(&expected))
                .execute(&self.pool.writer)
                .await
            }
        }
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pingflow_types::event::Event;
    use serde_json::json;

    async fn test_store() -> (tempfile::TempDir, SqliteRunStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteRunStore::new(pool))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 18, 30, 0).unwrap()
    }

    fn sample_run(created_at: DateTime<Utc>) -> WorkflowRun {
        let event = Event::from_json("connection.requested", json!({"connectionId": "c1"}), created_at);
        WorkflowRun::new(Uuid::now_v7(), "connection-request-reminder", RunTrigger::Event(event), created_at)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (_dir, store) = test_store().await;
        let mut run = sample_run(t0());
        run.step_memo.insert(
            "send-connection-request-mail".to_string(),
            StepMemo { result: json!({"sent": true}), completed_at: t0() },
        );

        assert!(store.create_run(&run).await.unwrap());
        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored, run);
        assert!(store.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_run_ignores_duplicate_id() {
        let (_dir, store) = test_store().await;
        let run = sample_run(t0());
        assert!(store.create_run(&run).await.unwrap());

        let mut other = run.clone();
        other.definition_id = "story-expiry".to_string();
        assert!(!store.create_run(&other).await.unwrap());

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.definition_id, "connection-request-reminder");
    }

    #[tokio::test]
    async fn update_run_is_compare_and_swap() {
        let (_dir, store) = test_store().await;
        let mut run = sample_run(t0());
        store.create_run(&run).await.unwrap();

        run.cursor = 1;
        run.attempt = 2;
        run.error = Some("relay down".to_string());
        store.update_run(&run, 0).await.unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.cursor, 1);
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.error.as_deref(), Some("relay down"));

        let err = store.update_run(&run, 0).await.unwrap_err();
        assert!(err.is_conflict());

        let missing = sample_run(t0());
        assert!(matches!(store.update_run(&missing, 0).await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn update_run_never_replaces_memo_entries() {
        let (_dir, store) = test_store().await;
        let mut run = sample_run(t0());
        run.step_memo.insert(
            "wait-24-hours".to_string(),
            StepMemo { result: json!("first"), completed_at: t0() },
        );
        store.create_run(&run).await.unwrap();

        let mut stale = run.clone();
        stale.step_memo.insert(
            "wait-24-hours".to_string(),
            StepMemo { result: json!("overwritten"), completed_at: t0() },
        );
        stale.step_memo.insert(
            "delete-story".to_string(),
            StepMemo { result: json!("second"), completed_at: t0() },
        );
        store.update_run(&stale, 0).await.unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.memo("wait-24-hours"), Some(&json!("first")));
        assert_eq!(stored.memo("delete-story"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn claim_due_leases_each_run_once() {
        let (_dir, store) = test_store().await;
        let a = sample_run(t0());
        let b = sample_run(t0() + Duration::seconds(1));
        store.create_run(&a).await.unwrap();
        store.create_run(&b).await.unwrap();

        let ttl = Duration::minutes(5);
        let first = store.claim_due("w1", t0(), ttl, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, a.id);
        assert_eq!(first[0].state, RunState::Running);
        assert_eq!(first[0].lease_owner.as_deref(), Some("w1"));
        assert_eq!(first[0].lease_expires_at, Some(t0() + ttl));
        assert_eq!(first[0].version, 1);

        let second = store.claim_due("w2", t0(), ttl, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, b.id);

        assert!(store.claim_due("w3", t0(), ttl, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_retry_at_and_lease_expiry() {
        let (_dir, store) = test_store().await;
        let mut run = sample_run(t0());
        run.retry_at = Some(t0() + Duration::seconds(30));
        store.create_run(&run).await.unwrap();

        let ttl = Duration::minutes(5);
        assert!(store.claim_run(&run.id, "w1", t0(), ttl).await.unwrap().is_none());

        let at = t0() + Duration::seconds(30);
        let claimed = store.claim_run(&run.id, "w1", at, ttl).await.unwrap().unwrap();
        assert!(claimed.retry_at.is_none());

        // Held by w1 until the lease runs out
        assert!(store.claim_run(&run.id, "w2", at + Duration::minutes(1), ttl).await.unwrap().is_none());
        let taken = store.claim_run(&run.id, "w2", at + ttl, ttl).await.unwrap().unwrap();
        assert_eq!(taken.lease_owner.as_deref(), Some("w2"));
        assert_eq!(taken.version, 2);
    }

    #[tokio::test]
    async fn terminal_and_sleeping_runs_are_not_claimable() {
        let (_dir, store) = test_store().await;
        let mut done = sample_run(t0());
        done.state = RunState::Completed;
        let mut asleep = sample_run(t0());
        asleep.state = RunState::Sleeping;
        asleep.wake_at = Some(t0() + Duration::hours(24));
        store.create_run(&done).await.unwrap();
        store.create_run(&asleep).await.unwrap();

        let later = t0() + Duration::days(2);
        assert!(store.claim_due("w1", later, Duration::minutes(5), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wake_due_moves_sleepers_to_pending() {
        let (_dir, store) = test_store().await;
        let mut run = sample_run(t0());
        run.state = RunState::Sleeping;
        run.wake_at = Some(t0() + Duration::hours(24));
        store.create_run(&run).await.unwrap();

        assert!(store.wake_due(t0() + Duration::hours(23)).await.unwrap().is_empty());
        let woken = store.wake_due(t0() + Duration::hours(24)).await.unwrap();
        assert_eq!(woken, vec![run.id]);

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Pending);
        assert_eq!(stored.wake_at, run.wake_at);
        assert_eq!(stored.version, 1);

        // Already pending; a second scan finds nothing
        assert!(store.wake_due(t0() + Duration::hours(25)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_runs_filters_newest_first() {
        let (_dir, store) = test_store().await;
        let older = sample_run(t0() - Duration::minutes(5));
        let mut newer = sample_run(t0());
        newer.definition_id = "story-expiry".to_string();
        store.create_run(&older).await.unwrap();
        store.create_run(&newer).await.unwrap();

        let all = store.list_runs(&RunFilter::default(), 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        let filtered = store
            .list_runs(
                &RunFilter { state: Some(RunState::Pending), definition_id: Some("story-expiry".to_string()) },
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, newer.id);

        let failed = store
            .list_runs(&RunFilter { state: Some(RunState::Failed), definition_id: None }, 10)
            .await
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(store.list_runs(&RunFilter::default(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cron_marker_compare_and_swap() {
        let (_dir, store) = test_store().await;
        let slot = Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap();
        let next = slot + Duration::days(1);

        assert!(store.get_cron_marker("daily-digest").await.unwrap().is_none());
        assert!(store.set_cron_marker("daily-digest", None, slot, t0()).await.unwrap());
        assert!(!store.set_cron_marker("daily-digest", None, slot, t0()).await.unwrap());
        assert_eq!(store.get_cron_marker("daily-digest").await.unwrap(), Some(slot));

        assert!(!store.set_cron_marker("daily-digest", Some(next), next, t0()).await.unwrap());
        assert!(store.set_cron_marker("daily-digest", Some(slot), next, t0()).await.unwrap());
        assert!(!store.set_cron_marker("daily-digest", Some(slot), next, t0()).await.unwrap());
        assert_eq!(store.get_cron_marker("daily-digest").await.unwrap(), Some(next));
    }

    #[tokio::test]
    async fn cron_marker_stamped_with_caller_time() {
        let (_dir, store) = test_store().await;
        let slot = Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap();
        let now = slot + Duration::seconds(20);
        assert!(store.set_cron_marker("daily-digest", None, slot, now).await.unwrap());

        let (updated_at,): (String,) =
            sqlx::query_as("SELECT updated_at FROM cron_markers WHERE definition_id = 'daily-digest'")
                .fetch_one(&store.pool.reader)
                .await
                .unwrap();
        assert_eq!(parse_datetime(&updated_at).unwrap(), now);
    }
    #[tokio::test]
    async fn runs_resume_after_restart_without_repeating_steps() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        use pingflow_core::clock::{Clock, ManualClock};
        use pingflow_core::engine::Engine;
        use pingflow_core::workflow::definition::WorkflowDefinition;
        use pingflow_core::workflow::step::{StepContext, StepError, after_creation};
        use pingflow_types::config::EngineConfig;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("restart.db").display());
        let first_calls = Arc::new(AtomicU32::new(0));
        let last_calls = Arc::new(AtomicU32::new(0));

        let definition = |first: Arc<AtomicU32>, last: Arc<AtomicU32>| {
            WorkflowDefinition::on_event("remind", "connection.requested")
                .run("send-first", move |_ctx: StepContext| {
                    let first = Arc::clone(&first);
                    async move {
                        first.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, StepError>(json!({"sent": true}))
                    }
                })
                .sleep_until("wait-24-hours", after_creation(Duration::hours(24)))
                .run("send-reminder", move |_ctx: StepContext| {
                    let last = Arc::clone(&last);
                    async move {
                        last.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, StepError>(json!({"reminded": true}))
                    }
                })
        };

        let clock = ManualClock::new(t0());
        let run_id = {
            let store = Arc::new(SqliteRunStore::new(DatabasePool::new(&url).await.unwrap()));
            let engine = Engine::builder(store, EngineConfig::default())
                .clock(Arc::new(clock.clone()))
                .register(definition(Arc::clone(&first_calls), Arc::clone(&last_calls)))
                .build()
                .unwrap();
            let ids = engine
                .submit_event("connection.requested", json!({"connectionId": "c1"}))
                .await
                .unwrap();
            engine.drain("w1").await.unwrap();
            let run = engine.get_run(&ids[0]).await.unwrap().unwrap();
            assert_eq!(run.state, RunState::Sleeping);
            assert_eq!(run.wake_at, Some(t0() + Duration::hours(24)));
            assert!(run.memo("wait-24-hours").is_none());
            ids[0]
        };

        // A fresh process opens the same database file.
        clock.advance(Duration::hours(24));
        let store = Arc::new(SqliteRunStore::new(DatabasePool::new(&url).await.unwrap()));
        let engine = Engine::builder(store, EngineConfig::default())
            .clock(Arc::new(clock.clone()))
            .register(definition(Arc::clone(&first_calls), Arc::clone(&last_calls)))
            .build()
            .unwrap();
        engine.scan_due(clock.now()).await.unwrap();
        engine.drain("w2").await.unwrap();

        let run = engine.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(last_calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.memo("send-reminder"), Some(&json!({"reminded": true})));
        assert_eq!(run.step_memo["wait-24-hours"].completed_at, t0() + Duration::hours(24));
        assert!(run.wake_at.is_none());
    }
}
