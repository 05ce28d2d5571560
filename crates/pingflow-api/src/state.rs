//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the concrete engine used by both CLI and REST API. The
//! engine is generic over its run store; AppState pins it to SQLite and
//! registers the social workflows against the SQLite directory and the
//! configured mailer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pingflow_core::engine::Engine;
use pingflow_core::social::{SocialDeps, definitions};
use pingflow_infra::config::{load_engine_config, resolve_data_dir};
use pingflow_infra::mail::ConfiguredMailer;
use pingflow_infra::sqlite::directory::SqliteDirectory;
use pingflow_infra::sqlite::pool::{DatabasePool, database_url};
use pingflow_infra::sqlite::run_store::SqliteRunStore;
use pingflow_types::config::EngineConfig;

pub type ConcreteEngine = Engine<SqliteRunStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;
        let config = load_engine_config(&data_dir).await;
        Self::open(&data_dir, config).await
    }

    /// Open the database under `data_dir` and build the engine.
    pub async fn open(data_dir: &Path, config: EngineConfig) -> anyhow::Result<Self> {
        let db_url = format!("{}?mode=rwc", database_url(data_dir));
        let db_pool = DatabasePool::new(&db_url).await?;

        let deps = SocialDeps {
            directory: Arc::new(SqliteDirectory::new(db_pool.clone())),
            mailer: Arc::new(ConfiguredMailer::from_config(&config.mail)?),
            frontend_url: config.frontend_url.clone(),
        };

        let store = Arc::new(SqliteRunStore::new(db_pool.clone()));
        let engine = Engine::builder(store, config)
            .register_all(definitions(deps))
            .build()?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            definitions = engine.registry().len(),
            "application state ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            data_dir: data_dir.to_path_buf(),
            db_pool,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// State over a throwaway data directory. Keep the `TempDir` alive.
    pub async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path(), EngineConfig::default()).await.unwrap();
        (dir, state)
    }
}
