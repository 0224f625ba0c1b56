//! Application state wiring the engine together.
//!
//! AppState pins the generic `WorkflowManager` to the SQLite journal and
//! registers the handlers this binary knows about.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use waypoint_core::event::EventBus;
use waypoint_core::workflow::{LeaseSettings, WorkflowManager};
use waypoint_infra::config::load_engine_config;
use waypoint_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use waypoint_infra::sqlite::pool::database_url;
use waypoint_infra::sqlite::{DatabasePool, SqliteWorkflowJournal};
use waypoint_types::config::EngineConfig;

use crate::demo;

/// Manager pinned to the SQLite journal.
pub type ConcreteManager = WorkflowManager<SqliteWorkflowJournal>;

/// Shared application state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConcreteManager,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, open the journal,
    /// wire the manager.
    pub async fn init(json: bool) -> anyhow::Result<Self> {
        Self::init_in(resolve_data_dir(), json).await
    }

    /// Same as [`AppState::init`] with an explicit data directory.
    pub async fn init_in(data_dir: PathBuf, json: bool) -> anyhow::Result<Self> {
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url(&data_dir, &config.database_file);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open journal at {db_url}"))?;

        let lease = LeaseSettings::new(Duration::from_secs(config.lease_secs));
        tracing::debug!(owner = %lease.owner, ttl_secs = config.lease_secs, "driver lease settings");

        let manager = WorkflowManager::with_lease(
            SqliteWorkflowJournal::new(db_pool.clone()),
            demo::step_registry(),
            demo::completion_registry(json),
            EventBus::new(config.event_capacity),
            lease,
        );

        Ok(Self {
            manager,
            config,
            data_dir,
            db_pool,
        })
    }
}
