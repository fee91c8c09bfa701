//! Error types for checkpoint operations
//!
//! Most of these never reach a consuming view. Storage, corruption and player
//! failures are folded into a [`RestoreOutcome`](crate::restore::RestoreOutcome)
//! or a silent no-op write and only show up in the logs. The variants exist so
//! the internal layers can tell the failure modes apart.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The store cannot be written at all for this session
    #[error("Storage unavailable")]
    StorageUnavailable,

    /// A single write was rejected because the store is full
    #[error("Storage full while writing key: {key}")]
    StorageFull { key: String },

    /// Stored data could not be parsed or failed shape validation
    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// Stored data is well-formed but belongs to a different context
    #[error("Stale record: {0}")]
    StaleRecord(String),

    /// The external player handle is torn down or rejected a call
    #[error("Player unreachable: {0}")]
    PlayerUnreachable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend error that is neither quota nor availability related
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether a failed write may succeed after freeing space
    pub fn is_recoverable_by_eviction(&self) -> bool {
        matches!(self, Self::StorageFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_key() {
        let err = CheckpointError::StorageFull {
            key: "intro_chat".to_string(),
        };
        assert_eq!(err.to_string(), "Storage full while writing key: intro_chat");
        assert!(err.is_recoverable_by_eviction());
        assert!(!CheckpointError::StorageUnavailable.is_recoverable_by_eviction());
    }
}
