//! The engine: one value owning the registry, store and worker loops.
//!
//! `EngineBuilder` registers every definition up front and fails fast on a
//! bad one. The resulting `Engine` is the whole public surface: submit
//! events, read runs, and either drive work by hand (`run_due`, `tick`,
//! `scan_due`) or hand it to `spawn_workers` for the background loops.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use pingflow_types::config::EngineConfig;
use pingflow_types::error::RepositoryError;
use pingflow_types::event::Event;
use pingflow_types::workflow::{RunFilter, WorkflowRun};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::repository::run_store::RunStore;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::dispatcher::EventDispatcher;
use crate::workflow::executor::StepExecutor;
use crate::workflow::registry::{RegistryError, WorkflowRegistry};
use crate::workflow::runner::WorkflowRunner;
use crate::workflow::scheduler::CronScheduler;
use crate::workflow::timer::SleepManager;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another worker holds (or took over) the run.
    #[error("run {0} is claimed by another worker")]
    DuplicateClaim(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// `advance` was called without holding the run's lease.
    #[error("run {0} is not claimed by this worker")]
    NotClaimed(Uuid),

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("registration error: {0}")]
    Registration(#[from] RegistryError),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

pub struct EngineBuilder<S: RunStore> {
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    definitions: Vec<WorkflowDefinition>,
}

impl<S: RunStore> EngineBuilder<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            definitions: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn register_all(mut self, definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// Validate the lease settings and every definition, then assemble the
    /// engine.
    pub fn build(self) -> Result<Engine<S>, EngineError> {
        validate_leases(&self.config)?;

        let mut registry = WorkflowRegistry::new();
        for definition in self.definitions {
            registry.register(definition)?;
        }
        let registry = Arc::new(registry);

        let lease_ttl = secs(self.config.lease_ttl_secs);
        let executor = StepExecutor::new(
            self.config.retry.clone(),
            StdDuration::from_secs(self.config.step_timeout_secs),
        );

        tracing::info!(
            definitions = registry.len(),
            cron = registry.cron_entries().len(),
            "workflow engine built"
        );

        Ok(Engine {
            dispatcher: EventDispatcher::new(Arc::clone(&self.store), Arc::clone(&registry)),
            runner: WorkflowRunner::new(
                Arc::clone(&self.store),
                Arc::clone(&registry),
                executor,
                Arc::clone(&self.clock),
                lease_ttl,
            ),
            sleeper: SleepManager::new(Arc::clone(&self.store)),
            scheduler: CronScheduler::new(Arc::clone(&self.store), Arc::clone(&registry)),
            instance_id: Uuid::now_v7().simple().to_string(),
            store: self.store,
            registry,
            clock: self.clock,
            config: self.config,
            lease_ttl,
        })
    }
}

/// A lease must be non-zero and outlive the step watchdog, otherwise a
/// second worker can reclaim a run whose step body is still executing.
fn validate_leases(config: &EngineConfig) -> Result<(), EngineError> {
    if config.lease_ttl_secs == 0 {
        return Err(EngineError::InvalidConfig("lease_ttl_secs must be at least 1".to_string()));
    }
    if config.step_timeout_secs == 0 {
        return Err(EngineError::InvalidConfig("step_timeout_secs must be at least 1".to_string()));
    }
    if config.step_timeout_secs >= config.lease_ttl_secs {
        return Err(EngineError::InvalidConfig(format!(
            "step_timeout_secs ({}) must be less than lease_ttl_secs ({})",
            config.step_timeout_secs, config.lease_ttl_secs
        )));
    }
    Ok(())
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S: RunStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    lease_ttl: Duration,
    instance_id: String,
    dispatcher: EventDispatcher<S>,
    runner: WorkflowRunner<S>,
    sleeper: SleepManager<S>,
    scheduler: CronScheduler<S>,
}

impl<S: RunStore> Engine<S> {
    pub fn builder(store: Arc<S>, config: EngineConfig) -> EngineBuilder<S> {
        EngineBuilder::new(store, config)
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Intake and reads
    // -----------------------------------------------------------------------

    /// Submit an event by name and JSON payload. Returns the ids of the
    /// runs it started (empty if nothing listens to it).
    pub async fn submit_event(&self, name: &str, data: Value) -> Result<Vec<Uuid>, EngineError> {
        let now = self.clock.now();
        self.submit(Event::from_json(name, data, now)).await
    }

    /// Submit a fully formed event (e.g. one carrying an idempotency key).
    pub async fn submit(&self, event: Event) -> Result<Vec<Uuid>, EngineError> {
        let now = self.clock.now();
        Ok(self.dispatcher.dispatch(&event, now).await?)
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter, limit: u32) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.store.list_runs(filter, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Driving work
    // -----------------------------------------------------------------------

    /// Claim one specific run for `worker_id` and advance it.
    ///
    /// A terminal run is returned as-is. A run someone else holds, or one
    /// that is sleeping or backing off, yields `DuplicateClaim`.
    pub async fn advance_run(&self, run_id: &Uuid, worker_id: &str) -> Result<WorkflowRun, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;
        if run.state.is_terminal() {
            return Ok(run);
        }

        let now = self.clock.now();
        let claimed = self
            .store
            .claim_run(run_id, worker_id, now, self.lease_ttl)
            .await?
            .ok_or(EngineError::DuplicateClaim(*run_id))?;
        self.runner.advance(claimed, worker_id).await
    }

    /// Claim a batch of due runs and advance each. Returns how many were
    /// claimed.
    pub async fn run_due(&self, worker_id: &str) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim_due(worker_id, now, self.lease_ttl, self.config.claim_batch)
            .await?;
        let count = claimed.len();

        for run in claimed {
            let run_id = run.id;
            match self.runner.advance(run, worker_id).await {
                Ok(_) => {}
                Err(EngineError::DuplicateClaim(_)) => {
                    tracing::warn!(%run_id, worker_id, "run taken over mid-advance");
                }
                Err(e) => {
                    tracing::error!(%run_id, worker_id, error = %e, "failed to advance run");
                }
            }
        }
        Ok(count)
    }

    /// Keep calling `run_due` until nothing is claimable. Returns the total
    /// number of claims.
    pub async fn drain(&self, worker_id: &str) -> Result<usize, EngineError> {
        let mut total = 0;
        loop {
            let n = self.run_due(worker_id).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Fire due cron slots.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.scheduler.tick(now).await?)
    }

    /// Wake sleeping runs that are due.
    pub async fn scan_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.sleeper.scan_due(now).await?)
    }
}

impl<S: RunStore + 'static> Engine<S> {
    /// Spawn the background loops: `workers` claim loops, one sleep
    /// scanner and one cron ticker. All stop when `cancel` fires.
    pub fn spawn_workers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let poll = StdDuration::from_secs(self.config.poll_interval_secs.max(1));
        let cron = StdDuration::from_secs(self.config.cron_interval_secs.max(1));
        let mut handles = Vec::with_capacity(self.config.workers + 2);

        for n in 0..self.config.workers.max(1) {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            let worker_id = format!("{}-w{n}", self.instance_id);
            handles.push(tokio::spawn(async move {
                tracing::info!(worker_id = worker_id.as_str(), "worker started");
                loop {
                    match engine.run_due(&worker_id).await {
                        // Keep going while there is a backlog
                        Ok(n) if n > 0 => continue,
                        Ok(_) => {}
                        Err(e) => tracing::error!(worker_id = worker_id.as_str(), error = %e, "worker poll failed"),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                tracing::info!(worker_id = worker_id.as_str(), "worker stopped");
            }));
        }

        let engine = Arc::clone(self);
        let scanner_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = engine.scan_due(engine.now()).await {
                    tracing::error!(error = %e, "sleep scan failed");
                }
                tokio::select! {
                    _ = scanner_cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }));

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = engine.tick(engine.now()).await {
                    tracing::error!(error = %e, "cron tick failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(cron) => {}
                }
            }
        }));

        handles
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;
    use pingflow_types::config::RetryPolicy;
    use pingflow_types::workflow::RunState;
    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::repository::memory::InMemoryRunStore;
    use crate::workflow::step::{StepContext, StepError, after_creation};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 15, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 30,
                max_delay_secs: 3600,
            },
            ..EngineConfig::default()
        }
    }

    fn build(
        definitions: Vec<WorkflowDefinition>,
    ) -> (Engine<InMemoryRunStore>, Arc<InMemoryRunStore>, ManualClock) {
        let store = Arc::new(InMemoryRunStore::new());
        let clock = ManualClock::new(t0());
        let engine = Engine::builder(Arc::clone(&store), config())
            .clock(Arc::new(clock.clone()))
            .register_all(definitions)
            .build()
            .unwrap();
        (engine, store, clock)
    }

    fn counter_step(
        def: WorkflowDefinition,
        name: &'static str,
        counter: Arc<AtomicU32>,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> WorkflowDefinition {
        def.run(name, move |_ctx: StepContext| {
            let counter = Arc::clone(&counter);
            let log = Arc::clone(&log);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                log.lock().unwrap().push(name);
                Ok::<_, StepError>(json!({ "step": name }))
            }
        })
    }

    #[tokio::test]
    async fn steps_run_in_order_and_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));
        let mut def = WorkflowDefinition::on_event("ordered", "go");
        for name in ["a", "b", "c"] {
            def = counter_step(def, name, Arc::clone(&counter), Arc::clone(&log));
        }
        let (engine, _store, _clock) = build(vec![def]);

        let ids = engine.submit_event("go", json!({})).await.unwrap();
        let run = engine.advance_run(&ids[0], "w1").await.unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.cursor, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(run.lease_owner.is_none());

        let stored = engine.get_run(&ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Completed);
        assert_eq!(stored.memo("b"), Some(&json!({"step": "b"})));
    }

    #[tokio::test]
    async fn completed_steps_never_rerun_on_retry_or_duplicate_claim() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(AtomicU32::new(0));
        let flaky_calls = Arc::new(AtomicU32::new(0));

        let calls = Arc::clone(&flaky_calls);
        let def = counter_step(
            WorkflowDefinition::on_event("memo", "go"),
            "first",
            Arc::clone(&first),
            Arc::clone(&log),
        )
        .run("flaky", move |_ctx: StepContext| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepError::transient("blip"))
                } else {
                    Ok(json!("done"))
                }
            }
        });
        let (engine, _store, clock) = build(vec![def]);

        let id = engine.submit_event("go", json!({})).await.unwrap()[0];
        let run = engine.advance_run(&id, "w1").await.unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.cursor, 1);
        assert_eq!(run.retry_at, Some(t0() + Duration::seconds(30)));

        // Backing off: nobody may claim it yet
        assert!(matches!(
            engine.advance_run(&id, "w2").await,
            Err(EngineError::DuplicateClaim(_))
        ));

        clock.advance(Duration::seconds(30));
        let run = engine.advance_run(&id, "w2").await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

        // Terminal: advancing again is a no-op
        let again = engine.advance_run(&id, "w3").await.unwrap();
        assert_eq!(again, run);
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_claim_is_rejected() {
        let def = WorkflowDefinition::on_event("solo", "go")
            .run("s", |_ctx: StepContext| async { Ok::<_, StepError>(json!(1)) });
        let (engine, store, _clock) = build(vec![def]);
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];

        store
            .claim_run(&id, "other", t0(), Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            engine.advance_run(&id, "w1").await,
            Err(EngineError::DuplicateClaim(_))
        ));
    }

    #[tokio::test]
    async fn stale_worker_loses_compare_and_swap() {
        let def = WorkflowDefinition::on_event("solo", "go")
            .run("s", |_ctx: StepContext| async { Ok::<_, StepError>(json!(1)) });
        let (engine, store, clock) = build(vec![def]);
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];

        let ttl = Duration::seconds(300);
        let stale = store.claim_run(&id, "w1", t0(), ttl).await.unwrap().unwrap();
        clock.advance(ttl);
        // Lease expired; w2 reclaims and finishes
        let run = engine.advance_run(&id, "w2").await.unwrap();
        assert_eq!(run.state, RunState::Completed);

        let err = engine.runner.advance(stale, "w1").await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateClaim(_)));
        let stored = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Completed);
    }

    #[tokio::test]
    async fn always_failing_step_hits_retry_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let def = WorkflowDefinition::on_event("doomed", "go").run("send", move |_ctx: StepContext| {
            let counted = Arc::clone(&counted);
            async move {
                let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<serde_json::Value, _>(StepError::transient(format!("relay down #{n}")))
            }
        });
        let (engine, _store, clock) = build(vec![def]);
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];

        let mut delays = Vec::new();
        let mut run = engine.advance_run(&id, "w").await.unwrap();
        while run.state == RunState::Pending {
            let retry_at = run.retry_at.unwrap();
            delays.push((retry_at - clock.now()).num_seconds());
            clock.set(retry_at);
            run = engine.advance_run(&id, "w").await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays, vec![30, 60]);
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_deref().unwrap().contains("relay down #3"));
    }

    #[tokio::test]
    async fn sleep_resumes_only_after_wake_time() {
        let woke = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&woke);
        let def = WorkflowDefinition::on_event("napper", "go")
            .sleep_until("wait", after_creation(Duration::hours(24)))
            .run("after", move |_ctx: StepContext| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StepError>(json!(null))
                }
            });
        let (engine, _store, clock) = build(vec![def]);
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];
        let wake_at = t0() + Duration::hours(24);

        let run = engine.advance_run(&id, "w").await.unwrap();
        assert_eq!(run.state, RunState::Sleeping);
        assert_eq!(run.wake_at, Some(wake_at));
        let stored = engine.get_run(&id).await.unwrap().unwrap();
        assert!(stored.memo("wait").is_none());

        clock.set(wake_at - Duration::seconds(1));
        assert!(engine.scan_due(clock.now()).await.unwrap().is_empty());
        assert_eq!(engine.drain("w").await.unwrap(), 0);
        assert_eq!(woke.load(Ordering::SeqCst), 0);

        clock.set(wake_at + Duration::seconds(1));
        assert_eq!(engine.scan_due(clock.now()).await.unwrap(), vec![id]);
        assert_eq!(engine.drain("w").await.unwrap(), 1);
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        let run = engine.get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert!(run.wake_at.is_none());
        assert_eq!(run.step_memo["wait"].completed_at, wake_at + Duration::seconds(1));
    }

    #[tokio::test]
    async fn unmatched_event_is_noop() {
        let def = WorkflowDefinition::on_event("solo", "go")
            .run("s", |_ctx: StepContext| async { Ok::<_, StepError>(json!(1)) });
        let (engine, store, _clock) = build(vec![def]);

        assert!(engine.submit_event("stop", json!({"x": 1})).await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_run_and_bad_registration() {
        let (engine, _store, _clock) = build(vec![]);
        assert!(matches!(
            engine.advance_run(&Uuid::now_v7(), "w").await,
            Err(EngineError::RunNotFound(_))
        ));

        let store = Arc::new(InMemoryRunStore::new());
        let result = Engine::builder(store, EngineConfig::default())
            .register(WorkflowDefinition::on_event("empty", "go"))
            .build();
        assert!(matches!(result, Err(EngineError::Registration(_))));
    }

    #[tokio::test]
    async fn lease_must_outlive_step_timeout() {
        let bad = [
            EngineConfig { lease_ttl_secs: 0, ..config() },
            EngineConfig { step_timeout_secs: 0, ..config() },
            EngineConfig { lease_ttl_secs: 60, step_timeout_secs: 60, ..config() },
            EngineConfig { lease_ttl_secs: 30, step_timeout_secs: 90, ..config() },
        ];
        for cfg in bad {
            let result = Engine::builder(Arc::new(InMemoryRunStore::new()), cfg).build();
            assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        }

        let ok = EngineConfig { lease_ttl_secs: 61, step_timeout_secs: 60, ..config() };
        assert!(Engine::builder(Arc::new(InMemoryRunStore::new()), ok).build().is_ok());
    }

    #[tokio::test]
    async fn leased_run_is_not_taken_by_second_worker() {
        let def = WorkflowDefinition::on_event("solo", "go")
            .run("s", |_ctx: StepContext| async { Ok::<_, StepError>(json!(1)) });
        let (engine, store, clock) = build(vec![def]);
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];

        let lease = Duration::seconds(engine.config().lease_ttl_secs as i64);
        assert!(store.claim_run(&id, "a", clock.now(), lease).await.unwrap().is_some());
        assert!(matches!(
            engine.advance_run(&id, "b").await,
            Err(EngineError::DuplicateClaim(_))
        ));
    }

    #[tokio::test]
    async fn spawned_workers_stop_on_cancel() {
        let def = WorkflowDefinition::on_event("solo", "go")
            .run("s", |_ctx: StepContext| async { Ok::<_, StepError>(json!(1)) });
        let store = Arc::new(InMemoryRunStore::new());
        let engine = Arc::new(
            Engine::builder(Arc::clone(&store), EngineConfig { workers: 2, ..EngineConfig::default() })
                .register(def)
                .build()
                .unwrap(),
        );
        let id = engine.submit_event("go", json!({})).await.unwrap()[0];

        let cancel = CancellationToken::new();
        let handles = engine.spawn_workers(cancel.clone());
        assert_eq!(handles.len(), 4);

        let mut done = false;
        for _ in 0..100 {
            let run = engine.get_run(&id).await.unwrap().unwrap();
            if run.state == RunState::Completed {
                done = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(done);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
