//! Sleep manager: moves sleeping runs back to `Pending` when due.
//!
//! The scan is idempotent and carries no in-memory timers, so a restart
//! loses nothing: sleeping runs are found again by `wake_at`. Wake latency
//! is bounded by the scan interval (`poll_interval_secs`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pingflow_types::error::RepositoryError;
use uuid::Uuid;

use crate::repository::run_store::RunStore;

pub struct SleepManager<S: RunStore> {
    store: Arc<S>,
}

impl<S: RunStore> SleepManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Wake every run whose `wake_at <= now`. Returns the woken ids.
    pub async fn scan_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let woken = self.store.wake_due(now).await?;
        for run_id in &woken {
            tracing::info!(%run_id, "run woke from sleep");
        }
        Ok(woken)
    }
}
