//! Durable workflow engine internals.
//!
//! - `step` -- step bodies, `StepContext` and `StepError`
//! - `definition` -- definition builder (trigger + ordered steps)
//! - `registry` -- definition lookup by id, event name and schedule
//! - `retry` -- retry decisions and exponential backoff
//! - `executor` -- executes one step against a run with memoization
//! - `runner` -- drives a claimed run step by step, persisting as it goes
//! - `timer` -- wakes sleeping runs whose time has come
//! - `scheduler` -- cron parsing and slot firing
//! - `dispatcher` -- turns events into runs

pub mod definition;
pub mod dispatcher;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod step;
pub mod timer;

use uuid::Uuid;

/// Namespace for run ids derived from a deduplication key.
const RUN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1c_52f4_9b0e_4d3a_8f57_21c8_d4e0_b913);

/// Stable run id for `(definition_id, key)`.
///
/// Used for cron slots and keyed event deliveries so redelivery resolves to
/// the existing run.
pub fn deterministic_run_id(definition_id: &str, key: &str) -> Uuid {
    let name = format!("{definition_id}\n{key}");
    Uuid::new_v5(&RUN_ID_NAMESPACE, name.as_bytes())
}
