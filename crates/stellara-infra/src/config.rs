//! Engine configuration loader for Stellara.
//!
//! Reads `config.toml` from the data directory (`~/.stellara/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use stellara_types::config::EngineConfig;

/// Minimum idempotency retention window in seconds (safety floor).
const MIN_RETENTION_SECS: u64 = 60;

/// Resolve the data directory.
///
/// Priority:
/// 1. `STELLARA_DATA_DIR` environment variable
/// 2. `~/.stellara`
/// 3. `.stellara` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STELLARA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stellara");
    }

    PathBuf::from(".stellara")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - The retention window is raised to at least 60 seconds.
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

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    let retention = resolve_retention_secs(&config);
    if retention != config.idempotency_retention_secs {
        tracing::warn!(
            configured = config.idempotency_retention_secs,
            applied = retention,
            "idempotency retention below minimum"
        );
        config.idempotency_retention_secs = retention;
    }
    config
}

/// The retention window with the 60-second floor applied.
pub fn resolve_retention_secs(config: &EngineConfig) -> u64 {
    config.idempotency_retention_secs.max(MIN_RETENTION_SECS)
}

/// The database URL: explicit `database_url`, else `stellara.db` in `data_dir`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| crate::sqlite::pool::database_url_for(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.idempotency_retention_secs, 86_400);
    }

    #[tokio::test]
    async fn test_load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
default_max_retries = 4

[backoff]
strategy = "fixed"
base_delay_ms = 500
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_max_retries, 4);
        assert_eq!(config.backoff.base_delay_ms, 500);
        assert_eq!(config.default_step_timeout_secs, 300);
    }

    #[tokio::test]
    async fn test_load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_max_retries, 2);
    }

    #[tokio::test]
    async fn test_load_engine_config_applies_retention_floor() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "idempotency_retention_secs = 5")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.idempotency_retention_secs, MIN_RETENTION_SECS);
    }

    #[test]
    fn test_resolve_database_url_prefers_explicit_value() {
        let mut config = EngineConfig::default();
        let dir = Path::new("/data");
        assert_eq!(resolve_database_url(&config, dir), "sqlite:///data/stellara.db");

        config.database_url = Some("sqlite::memory:".to_string());
        assert_eq!(resolve_database_url(&config, dir), "sqlite::memory:");
    }
}
