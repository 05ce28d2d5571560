//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.pingflow/` unless
//! `PINGFLOW_DATA_DIR` says otherwise) and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use pingflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "PINGFLOW_DATA_DIR";

/// Resolve the data directory: `PINGFLOW_DATA_DIR`, else `~/.pingflow`,
/// else `./.pingflow` when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pingflow")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Clamp values that would stall the engine.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.workers == 0 {
        tracing::warn!("workers = 0 in config.toml, using 1");
        config.workers = 1;
    }
    if config.claim_batch == 0 {
        config.claim_batch = 1;
    }
    if config.retry.max_attempts == 0 {
        tracing::warn!("retry.max_attempts = 0 in config.toml, using 1");
        config.retry.max_attempts = 1;
    }
    config.poll_interval_secs = config.poll_interval_secs.max(1);
    config.cron_interval_secs = config.cron_interval_secs.max(1);
    config.step_timeout_secs = config.step_timeout_secs.max(1);
    // A lease must outlive the longest step body
    if config.lease_ttl_secs <= config.step_timeout_secs {
        let lease_ttl_secs = config.step_timeout_secs.saturating_mul(2);
        tracing::warn!(
            lease_ttl_secs = config.lease_ttl_secs,
            step_timeout_secs = config.step_timeout_secs,
            "lease_ttl_secs must exceed step_timeout_secs, using {lease_ttl_secs}"
        );
        config.lease_ttl_secs = lease_ttl_secs;
    }
    config
}
