//! Cron scheduler for schedule-triggered workflows.
//!
//! Provides:
//! - Standard 5-field cron parsing with an optional `TZ=<zone>` prefix
//! - Human-readable schedule normalization ("every 5 minutes" -> cron)
//! - Timezone-aware next-occurrence computation (DST handled by croner)
//! - A pull-based `tick` that fires each slot at most once, guarded by a
//!   per-definition marker in the run store

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use pingflow_types::error::RepositoryError;
use pingflow_types::workflow::{CronFire, RunTrigger, WorkflowRun};
use uuid::Uuid;

use super::deterministic_run_id;
use super::registry::WorkflowRegistry;
use crate::repository::run_store::RunStore;

/// Skipped slots are counted up to this many; longer outages report the cap.
const MAX_COUNTED_SKIPS: u32 = 1_000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from parsing schedules or computing occurrences.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("schedule '{schedule}' has no occurrence after {after}")]
    NoOccurrence { schedule: String, after: DateTime<Utc> },
}

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 5-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - "every N minutes"     -> "*/N * * * *"
/// - "every N hours"       -> "0 */N * * *"
/// - "every minute"        -> "* * * * *"
/// - "every hour"          -> "0 * * * *"
/// - "every day"           -> "0 0 * * *"
/// - "every day at HH:MM"  -> "MM HH * * *"
/// - "hourly"              -> "0 * * * *"
/// - "daily"               -> "0 0 * * *"
///
/// Anything with five space-separated fields is returned as-is and left
/// for croner to validate.
pub fn normalize_schedule(input: &str) -> Result<String, ScheduleError> {
    let trimmed = input.trim();

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(parts.join(" "));
    }

    let lower = trimmed.to_lowercase();

    if lower == "every minute" || lower == "minutely" {
        return Ok("* * * * *".to_string());
    }
    if lower == "every hour" || lower == "hourly" {
        return Ok("0 * * * *".to_string());
    }
    if lower == "every day" || lower == "daily" {
        return Ok("0 0 * * *".to_string());
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let time_parts: Vec<&str> = at_part.split(':').collect();
            if time_parts.len() == 2 {
                let hour: u32 = time_parts[0]
                    .trim()
                    .parse()
                    .map_err(|_| ScheduleError::InvalidSchedule(input.to_string()))?;
                let minute: u32 = time_parts[1]
                    .trim()
                    .parse()
                    .map_err(|_| ScheduleError::InvalidSchedule(input.to_string()))?;
                if hour < 24 && minute < 60 {
                    return Ok(format!("{minute} {hour} * * *"));
                }
            }
            return Err(ScheduleError::InvalidSchedule(input.to_string()));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0]
                .parse()
                .map_err(|_| ScheduleError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(ScheduleError::InvalidSchedule(
                    "interval must be > 0".to_string(),
                ));
            }
            let unit = words[1].trim_end_matches('s');
            return match unit {
                "minute" => Ok(format!("*/{n} * * * *")),
                "hour" => Ok(format!("0 */{n} * * *")),
                _ => Err(ScheduleError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(ScheduleError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

/// Split a leading `TZ=<zone>` off a schedule string.
pub fn split_timezone_prefix(input: &str) -> (Option<&str>, &str) {
    let trimmed = input.trim_start();
    match trimmed.strip_prefix("TZ=") {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((zone, schedule)) => (Some(zone), schedule.trim()),
            None => (Some(rest), ""),
        },
        None => (None, trimmed.trim_end()),
    }
}

// ---------------------------------------------------------------------------
// CronSchedule
// ---------------------------------------------------------------------------

/// A parsed schedule bound to a timezone.
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    cron: croner::Cron,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl CronSchedule {
    /// Parse `schedule` in `timezone` (IANA name, UTC when `None`).
    ///
    /// A `TZ=` prefix on the schedule wins when no timezone is given; when
    /// both are given they must agree.
    pub fn parse(schedule: &str, timezone: Option<&str>) -> Result<Self, ScheduleError> {
        let (prefix_zone, body) = split_timezone_prefix(schedule);
        let zone_name = match (prefix_zone, timezone) {
            (Some(p), Some(t)) if p != t => {
                return Err(ScheduleError::InvalidSchedule(format!(
                    "schedule timezone '{p}' conflicts with trigger timezone '{t}'"
                )));
            }
            (Some(p), _) => p,
            (None, Some(t)) => t,
            (None, None) => "UTC",
        };
        let timezone = Tz::from_str(zone_name)
            .map_err(|_| ScheduleError::UnknownTimezone(zone_name.to_string()))?;

        let expression = normalize_schedule(body)?;
        let cron = expression
            .parse::<croner::Cron>()
            .map_err(|e| ScheduleError::InvalidSchedule(format!("{expression}: {e}")))?;

        Ok(Self {
            expression,
            timezone,
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First slot strictly after `after` (or at it, when `inclusive`).
    pub fn next_after(&self, after: DateTime<Utc>, inclusive: bool) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, inclusive)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ScheduleError::NoOccurrence {
                schedule: self.expression.clone(),
                after,
            })
    }

    /// Last slot at or before `at`.
    pub fn previous_at_or_before(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = at.with_timezone(&self.timezone);
        self.cron
            .find_previous_occurrence(&local, true)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ScheduleError::NoOccurrence {
                schedule: self.expression.clone(),
                after: at,
            })
    }

    /// Most recent slot in `(after, now]`, with the number of earlier slots
    /// in that window that it supersedes (capped at `MAX_COUNTED_SKIPS`).
    pub fn latest_due(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<(DateTime<Utc>, u32)>, ScheduleError> {
        let first = self.next_after(after, false)?;
        if first > now {
            return Ok(None);
        }
        let latest = self.previous_at_or_before(now)?.max(first);

        let mut skipped = 0u32;
        let mut slot = first;
        while slot < latest && skipped < MAX_COUNTED_SKIPS {
            skipped += 1;
            slot = self.next_after(slot, false)?;
        }
        Ok(Some((latest, skipped)))
    }
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Creates runs for cron-triggered definitions.
///
/// Stateless between ticks: the last fired slot of each definition lives in
/// the run store, so any number of scheduler instances may tick the same
/// store and each slot still yields one run.
pub struct CronScheduler<S: RunStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
}

impl<S: RunStore> CronScheduler<S> {
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry>) -> Self {
        Self { store, registry }
    }

    /// Fire every cron slot that has come due at `now`.
    ///
    /// Returns ids of runs this call created. With no marker recorded yet,
    /// a definition only fires if `now` is exactly on a slot; otherwise
    /// `now` becomes its baseline. Missed slots are coalesced into a run
    /// for the most recent one.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let mut created = Vec::new();

        for entry in self.registry.cron_entries() {
            let definition_id = entry.definition_id.as_str();
            let marker = self.store.get_cron_marker(definition_id).await?;

            let due = match marker {
                Some(last) => entry.schedule.latest_due(last, now),
                None => entry
                    .schedule
                    .next_after(now, true)
                    .map(|slot| (slot == now).then_some((slot, 0))),
            };
            let due = match due {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(definition_id, error = %e, "cron occurrence computation failed");
                    continue;
                }
            };

            let Some((slot, skipped)) = due else {
                if marker.is_none() {
                    self.store.set_cron_marker(definition_id, None, now, now).await?;
                    tracing::debug!(definition_id, baseline = %now, "cron baseline recorded");
                }
                continue;
            };

            if skipped > 0 {
                tracing::warn!(
                    definition_id,
                    skipped,
                    slot = %slot,
                    "coalesced missed cron slots into the latest one"
                );
            }

            let run_id = deterministic_run_id(definition_id, &slot.to_rfc3339());
            let run = WorkflowRun::new(
                run_id,
                definition_id,
                RunTrigger::Cron(CronFire {
                    schedule: entry.schedule.expression().to_string(),
                    timezone: entry.schedule.timezone().name().to_string(),
                    scheduled_for: slot,
                    fired_at: now,
                }),
                now,
            );
            let inserted = self.store.create_run(&run).await?;

            if !self.store.set_cron_marker(definition_id, marker, slot, now).await? {
                tracing::debug!(definition_id, slot = %slot, "cron marker moved by another scheduler");
            }

            if inserted {
                tracing::info!(%run_id, definition_id, slot = %slot, "cron run created");
                created.push(run_id);
            }
        }

        Ok(created)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRunStore;
    use crate::workflow::definition::WorkflowDefinition;
    use crate::workflow::step::{StepContext, StepError};
    use chrono::{Duration, TimeZone, Timelike};
    use serde_json::json;

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_normalize_standard_cron_passthrough() {
        assert_eq!(normalize_schedule("0  9 * * *").unwrap(), "0 9 * * *");
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "*/5 * * * *");
    }

    #[test]
    fn test_normalize_every_n_units() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "*/5 * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 */2 * * *");
        assert_eq!(normalize_schedule("every 1 minute").unwrap(), "*/1 * * * *");
    }

    #[test]
    fn test_normalize_keywords() {
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 * * * *");
        assert_eq!(normalize_schedule("daily").unwrap(), "0 0 * * *");
        assert_eq!(normalize_schedule("Every Minute").unwrap(), "* * * * *");
    }

    #[test]
    fn test_normalize_every_day_at_time() {
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "30 9 * * *");
        assert!(normalize_schedule("every day at 24:00").is_err());
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every 10 seconds").is_err());
    }

    #[test]
    fn test_split_timezone_prefix() {
        assert_eq!(
            split_timezone_prefix("TZ=America/New_York 0 9 * * *"),
            (Some("America/New_York"), "0 9 * * *")
        );
        assert_eq!(split_timezone_prefix(" 0 9 * * * "), (None, "0 9 * * *"));
    }

    // -------------------------------------------------------------------
    // CronSchedule
    // -------------------------------------------------------------------

    #[test]
    fn test_parse_rejects_unknown_timezone() {
        let err = CronSchedule::parse("0 9 * * *", Some("Mars/Olympus")).unwrap_err();
        assert_eq!(err, ScheduleError::UnknownTimezone("Mars/Olympus".to_string()));
    }

    #[test]
    fn test_parse_rejects_conflicting_timezones() {
        assert!(CronSchedule::parse("TZ=Europe/Paris 0 9 * * *", Some("America/New_York")).is_err());
        assert!(CronSchedule::parse("TZ=America/New_York 0 9 * * *", Some("America/New_York")).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_expression() {
        assert!(CronSchedule::parse("61 9 * * *", None).is_err());
    }

    #[test]
    fn test_next_after_follows_local_time_across_dst() {
        let schedule = CronSchedule::parse("TZ=America/New_York 0 9 * * *", None).unwrap();

        // EST (UTC-5) before the 2026-03-08 switch, EDT (UTC-4) after.
        let before = Utc.with_ymd_and_hms(2026, 3, 7, 15, 0, 0).unwrap();
        let next = schedule.next_after(before, false).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 8, 13, 0, 0).unwrap());

        let after = schedule.next_after(next, false).unwrap();
        assert_eq!(after, Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap());

        let winter = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(winter, false).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_latest_due_coalesces() {
        let schedule = CronSchedule::parse("0 * * * *", None).unwrap();
        let last = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();

        assert!(schedule.latest_due(last, last + Duration::minutes(59)).unwrap().is_none());

        let (slot, skipped) = schedule
            .latest_due(last, last + Duration::minutes(330))
            .unwrap()
            .unwrap();
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).unwrap());
        assert_eq!(skipped, 4);
    }

    #[test]
    fn test_latest_due_after_year_long_outage_of_minutely_schedule() {
        let schedule = CronSchedule::parse("* * * * *", None).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 30).unwrap();

        let (slot, skipped) = schedule.latest_due(last, now).unwrap().unwrap();
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap());
        assert_eq!(skipped, MAX_COUNTED_SKIPS);
    }

    #[test]
    fn test_previous_at_or_before_respects_timezone() {
        let schedule = CronSchedule::parse("0 9 * * *", Some("America/New_York")).unwrap();
        // 2026-03-09 is after the spring-forward; 09:00 EDT is 13:00 UTC
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 20, 0, 0).unwrap();
        assert_eq!(
            schedule.previous_at_or_before(at).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap()
        );
        let on_slot = Utc.with_ymd_and_hms(2026, 3, 9, 13, 0, 0).unwrap();
        assert_eq!(schedule.previous_at_or_before(on_slot).unwrap(), on_slot);
    }

    // -------------------------------------------------------------------
    // CronScheduler::tick
    // -------------------------------------------------------------------

    fn digest_registry() -> Arc<WorkflowRegistry> {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowDefinition::on_cron("digest", "0 9 * * *", Some("America/New_York"))
                    .run("noop", |_ctx: StepContext| async { Ok::<_, StepError>(json!(null)) }),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_tick_every_minute_across_dst_fires_once_per_day() {
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = CronScheduler::new(Arc::clone(&store), digest_registry());
        let ny = chrono_tz::America::New_York;

        let start = Utc.with_ymd_and_hms(2026, 3, 6, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let mut fired = Vec::new();
        let mut now = start;
        while now <= end {
            for id in scheduler.tick(now).await.unwrap() {
                let run = store.get_run(&id).await.unwrap().unwrap();
                let RunTrigger::Cron(fire) = run.trigger else {
                    panic!("expected cron trigger");
                };
                fired.push(fire.scheduled_for);
            }
            now += Duration::minutes(1);
        }

        assert_eq!(fired.len(), 4, "one run per local day");
        for slot in &fired {
            let local = slot.with_timezone(&ny);
            assert_eq!((local.hour(), local.minute()), (9, 0));
        }
        let days: Vec<u32> = fired
            .iter()
            .map(|s| chrono::Datelike::day(&s.with_timezone(&ny)))
            .collect();
        assert_eq!(days, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_tick_twice_on_same_slot_creates_one_run() {
        let store = Arc::new(InMemoryRunStore::new());
        let registry = digest_registry();
        let a = CronScheduler::new(Arc::clone(&store), Arc::clone(&registry));
        let b = CronScheduler::new(Arc::clone(&store), registry);

        let baseline = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        assert!(a.tick(baseline).await.unwrap().is_empty());

        // 09:00 EDT
        let slot = Utc.with_ymd_and_hms(2026, 6, 2, 13, 0, 30).unwrap();
        let first = a.tick(slot).await.unwrap();
        let second = b.tick(slot).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_after_outage_fires_latest_slot_only() {
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = CronScheduler::new(Arc::clone(&store), digest_registry());

        let baseline = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        scheduler.tick(baseline).await.unwrap();

        let back = Utc.with_ymd_and_hms(2026, 6, 5, 20, 0, 0).unwrap();
        let created = scheduler.tick(back).await.unwrap();
        assert_eq!(created.len(), 1);

        let run = store.get_run(&created[0]).await.unwrap().unwrap();
        let RunTrigger::Cron(fire) = run.trigger else {
            panic!("expected cron trigger");
        };
        assert_eq!(fire.scheduled_for, Utc.with_ymd_and_hms(2026, 6, 5, 13, 0, 0).unwrap());
        assert_eq!(fire.fired_at, back);
    }

    #[tokio::test]
    async fn test_first_tick_exactly_on_slot_fires() {
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = CronScheduler::new(Arc::clone(&store), digest_registry());

        let slot = Utc.with_ymd_and_hms(2026, 6, 2, 13, 0, 0).unwrap();
        assert_eq!(scheduler.tick(slot).await.unwrap().len(), 1);
        assert_eq!(store.get_cron_marker("digest").await.unwrap(), Some(slot));
    }
}
