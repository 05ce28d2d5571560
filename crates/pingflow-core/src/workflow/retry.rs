//! Retry decisions and exponential backoff for failing steps.

use chrono::Duration;
use pingflow_types::config::RetryPolicy;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// No internal state; all logic is in associated functions that take the
/// policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a step that has now failed `failures` times may run again.
    ///
    /// `max_attempts` counts every execution, so a policy of 5 allows four
    /// retries after the first failure.
    pub fn should_retry(policy: &RetryPolicy, failures: u32) -> bool {
        failures < policy.max_attempts
    }

    /// Delay before the retry that follows failure number `failures`
    /// (1-based): `min(base * 2^(failures - 1), max)`.
    pub fn backoff_delay(policy: &RetryPolicy, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let secs = policy
            .base_delay_secs
            .saturating_mul(factor)
            .min(policy.max_delay_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}
