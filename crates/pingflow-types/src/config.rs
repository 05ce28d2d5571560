//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every field
//! has a default so an empty or missing file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine and its binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker poll cadence for due runs and the sleep scanner, in seconds.
    ///
    /// This bounds the worst-case wake latency of a sleeping run.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Cron tick cadence in seconds.
    #[serde(default = "default_cron_interval_secs")]
    pub cron_interval_secs: u64,

    /// How long a claimed run stays leased without a store write.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Watchdog timeout for a single `Run` step body.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Number of concurrent worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum runs claimed per worker poll.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,

    /// Retry and backoff policy for failing steps.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Base URL linked from notification emails.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    #[serde(default)]
    pub mail: MailConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_cron_interval_secs() -> u64 {
    60
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    4
}

fn default_claim_batch() -> usize {
    16
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cron_interval_secs: default_cron_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            workers: default_workers(),
            claim_batch: default_claim_batch(),
            retry: RetryPolicy::default(),
            frontend_url: default_frontend_url(),
            mail: MailConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Exponential backoff policy: `delay(n) = min(base * 2^(n-1), max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed for one step, the first execution included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Outbound mail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// HTTP relay endpoint. When absent, emails are only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mail_from() -> String {
    "PingUp <no-reply@pingup.local>".to_string()
}

fn default_mail_timeout_secs() -> u64 {
    10
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: default_mail_from(),
            relay_url: None,
            timeout_secs: default_mail_timeout_secs(),
        }
    }
}

/// Listen address for the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3400
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
