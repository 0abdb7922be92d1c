//! Application state wiring the SQLite adapters into a saga orchestrator.
//!
//! The CLI never registers workflow definitions; it reads what engine
//! processes wrote to the shared database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stellara_core::saga::SagaOrchestrator;
use stellara_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use stellara_infra::sqlite::idempotency::SqliteLedger;
use stellara_infra::sqlite::pool::DatabasePool;
use stellara_infra::sqlite::workflow::SqliteWorkflowStore;
use stellara_types::config::EngineConfig;

/// Orchestrator pinned to the SQLite store and ledger.
pub type ConcreteOrchestrator = SagaOrchestrator<SqliteWorkflowStore, SqliteLedger>;

/// Shared state for CLI commands.
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let database_url = resolve_database_url(&config, &data_dir);
        let db_url = if database_url.contains('?') || database_url.contains(":memory:") {
            database_url.clone()
        } else {
            format!("{database_url}?mode=rwc")
        };

        let pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        let orchestrator = SagaOrchestrator::new(
            SqliteWorkflowStore::new(pool.clone()),
            SqliteLedger::new(pool.clone()),
            &config,
        );

        tracing::debug!(data_dir = %data_dir.display(), %database_url, "app state initialized");

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            config,
            data_dir,
            database_url,
            pool,
        })
    }
}
