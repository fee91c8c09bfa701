//! Configuration loader
//!
//! Loads configuration from:
//! 1. Default values
//! 2. The file named by `SECTION_CHECKPOINT_CONFIG`, or
//!    `./.section-checkpoint/checkpoint.toml` when the variable is unset
//!
//! A missing file is not an error; a malformed one is.

use crate::config::schema::EngineConfig;
use crate::error::{CheckpointError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "SECTION_CHECKPOINT_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for the default location
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a loader for an explicit file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    fn default_config_path() -> PathBuf {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(".section-checkpoint").join("checkpoint.toml"),
        }
    }

    /// Load configuration, layering the file (if present) over defaults
    pub async fn load(&self) -> Result<EngineConfig> {
        let mut config = if self.config_path.exists() {
            let config = Self::load_from_path(&self.config_path).await?;
            debug!(path = %self.config_path.display(), "Loaded checkpoint config");
            config
        } else {
            debug!(path = %self.config_path.display(), "Config file not found, using defaults");
            EngineConfig::default()
        };

        config.resolve_env_vars();

        info!(
            durable = config.storage.path.is_some(),
            "Checkpoint configuration loaded"
        );
        Ok(config)
    }

    async fn load_from_path(path: &Path) -> Result<EngineConfig> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CheckpointError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| CheckpointError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_returns_defaults_when_no_file() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::with_path(temp.path().join("missing.toml"));

        let config = loader.load().await.unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_load_file_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            path = "/var/lib/app/checkpoints.json"

            [media]
            remote_interval_ms = 5000

            [textual]
            restore_grace_ms = 250
            "#,
        )
        .unwrap();

        let config = ConfigLoader::with_path(&path).load().await.unwrap();
        assert_eq!(config.media.remote_interval_ms, 5000);
        assert_eq!(config.media.local_interval_ms, 1000);
        assert_eq!(config.textual.restore_grace_ms, 250);
        assert_eq!(
            config.storage_path(),
            Some(PathBuf::from("/var/lib/app/checkpoints.json"))
        );
    }

    #[tokio::test]
    async fn test_load_with_invalid_toml_syntax() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.toml");
        std::fs::write(&path, "[media\nend_guard_secs = ").unwrap();

        let result = ConfigLoader::with_path(&path).load().await;
        assert!(matches!(result, Err(CheckpointError::Config(_))));
    }
}
