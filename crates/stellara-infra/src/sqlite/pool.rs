//! SQLite connection pools for the saga database.
//!
//! One writer connection serializes every run, step and ledger write in the
//! process. Readers run in parallel against the WAL snapshot and are opened
//! read-only, so a query path can never take the write lock by accident.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// File name of the saga database inside the data directory.
pub const DATABASE_FILE: &str = "stellara.db";

/// Sizing and lock-wait settings for [`DatabasePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub reader_connections: u32,
    /// How long a connection waits on a locked database before `SQLITE_BUSY`.
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            reader_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Reader and writer pools over one WAL-mode database file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open with default [`PoolSettings`].
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::open(database_url, PoolSettings::default()).await
    }

    /// Open the database, creating the file if missing, and apply pending
    /// migrations before any reader connects.
    pub async fn open(database_url: &str, settings: PoolSettings) -> Result<Self, sqlx::Error> {
        let connect = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(settings.busy_timeout);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(settings.reader_connections.max(1))
            .connect_with(connect.read_only(true))
            .await?;

        tracing::debug!(
            database_url,
            readers = settings.reader_connections,
            "opened saga database"
        );
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// `sqlite://{data_dir}/stellara.db`
pub fn database_url_for(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

/// Database URL under the resolved data directory.
pub fn default_database_url() -> String {
    database_url_for(&crate::config::resolve_data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp(dir: &tempfile::TempDir, settings: PoolSettings) -> DatabasePool {
        let url = format!("{}?mode=rwc", database_url_for(dir.path()));
        DatabasePool::open(&url, settings).await.unwrap()
    }

    #[tokio::test]
    async fn test_migrations_create_saga_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_temp(&dir, PoolSettings::default()).await;

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' \
             ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        assert_eq!(names, ["idempotency_ledger", "workflow_runs", "workflow_steps"]);
        assert!(dir.path().join(DATABASE_FILE).exists());
    }

    #[tokio::test]
    async fn test_writer_uses_wal_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_temp(&dir, PoolSettings::default()).await;

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_reader_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PoolSettings {
            reader_connections: 2,
            ..PoolSettings::default()
        };
        let pool = open_temp(&dir, settings).await;

        let result = sqlx::query("DELETE FROM idempotency_ledger")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
        pool.close().await;
        assert!(pool.writer.is_closed());
    }

    #[tokio::test]
    async fn test_reopening_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        open_temp(&dir, PoolSettings::default()).await.close().await;
        let pool = open_temp(&dir, PoolSettings::default()).await;

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_url_points_into_data_dir() {
        let url = database_url_for(Path::new("/var/lib/stellara"));
        assert_eq!(url, "sqlite:///var/lib/stellara/stellara.db");
        assert!(default_database_url().ends_with(DATABASE_FILE));
    }
}
