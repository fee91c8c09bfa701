//! Configuration schema

use crate::record::CheckpointKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub textual: TextualConfig,

    #[serde(default)]
    pub expiry: ExpiryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the durable store file; in-memory storage when unset.
    /// Supports `${VAR}` expansion.
    pub path: Option<String>,
}

/// Media playback checkpointing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Sampling interval for players backed by a local media element
    pub local_interval_ms: u64,

    /// Sampling interval for remote player SDKs
    pub remote_interval_ms: u64,

    /// Minimum position change, in seconds, before a new write
    pub min_delta_secs: f64,

    /// Positions this close to the end count as finished
    pub end_guard_secs: f64,

    /// Allowed difference between stored and live duration
    pub duration_tolerance_secs: f64,

    /// Delay before the first restore attempt
    pub restore_grace_ms: u64,

    /// Delay between readiness checks while the player is still mounting
    pub ready_retry_ms: u64,

    /// Readiness checks before giving up on a restore
    pub ready_attempts: u32,

    /// Upper bound on a single liveness probe
    pub probe_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            local_interval_ms: 1000,
            remote_interval_ms: 2000,
            min_delta_secs: 1.0,
            end_guard_secs: 10.0,
            duration_tolerance_secs: 1.0,
            restore_grace_ms: 3000,
            ready_retry_ms: 500,
            ready_attempts: 6,
            probe_timeout_ms: 2000,
        }
    }
}

impl MediaConfig {
    pub fn local_interval(&self) -> Duration {
        Duration::from_millis(self.local_interval_ms)
    }

    pub fn remote_interval(&self) -> Duration {
        Duration::from_millis(self.remote_interval_ms)
    }

    pub fn restore_grace(&self) -> Duration {
        Duration::from_millis(self.restore_grace_ms)
    }

    pub fn ready_retry(&self) -> Duration {
        Duration::from_millis(self.ready_retry_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Transcript, form and generic state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TextualConfig {
    /// Delay before the first restore attempt
    pub restore_grace_ms: u64,
}

impl Default for TextualConfig {
    fn default() -> Self {
        Self {
            restore_grace_ms: 100,
        }
    }
}

impl TextualConfig {
    pub fn restore_grace(&self) -> Duration {
        Duration::from_millis(self.restore_grace_ms)
    }
}

/// Maximum checkpoint age per kind; unset means checkpoints never expire
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ExpiryConfig {
    pub generic_max_age_secs: Option<u64>,
    pub media_max_age_secs: Option<u64>,
    pub transcript_max_age_secs: Option<u64>,
    pub structured_form_max_age_secs: Option<u64>,
}

impl ExpiryConfig {
    pub fn max_age(&self, kind: CheckpointKind) -> Option<chrono::Duration> {
        let secs = match kind {
            CheckpointKind::Generic => self.generic_max_age_secs,
            CheckpointKind::Media => self.media_max_age_secs,
            CheckpointKind::Transcript => self.transcript_max_age_secs,
            CheckpointKind::StructuredForm => self.structured_form_max_age_secs,
        }?;
        chrono::Duration::try_seconds(i64::try_from(secs).ok()?)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Log format: "compact", "pretty", "full"
    pub format: String,

    /// Show timestamps
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            timestamps: true,
        }
    }
}

impl EngineConfig {
    /// Restore grace period for a kind
    pub fn restore_grace(&self, kind: CheckpointKind) -> Duration {
        match kind {
            CheckpointKind::Media => self.media.restore_grace(),
            _ => self.textual.restore_grace(),
        }
    }

    /// Resolve environment variables in configuration values
    ///
    /// Supports ${VAR_NAME} syntax
    pub fn resolve_env_vars(&mut self) {
        if let Some(ref path) = self.storage.path {
            self.storage.path = Some(Self::expand_env_var(path));
        }
    }

    fn expand_env_var(value: &str) -> String {
        if value.starts_with("${") && value.ends_with('}') {
            let var_name = &value[2..value.len() - 1];
            std::env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }

    /// Resolved storage path, if durable storage is configured
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage.path.as_ref().map(PathBuf::from)
    }
}
