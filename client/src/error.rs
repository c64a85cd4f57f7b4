//! Unified error handling for the sync client.

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Remote mirror error: {0}")]
    Mirror(String),

    #[error("Remote mirror unavailable")]
    MirrorUnavailable,

    #[error("Operation failed: {0}")]
    Execution(String),

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl SyncError {
    /// Whether the error comes from a checksum or format check.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            SyncError::Integrity(_)
                | SyncError::Engine(tether_engine::Error::ChecksumMismatch { .. })
        )
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_classification() {
        let mismatch = SyncError::from(tether_engine::Error::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert!(mismatch.is_integrity());
        assert!(SyncError::Integrity("bad".into()).is_integrity());
        assert!(!SyncError::SyncInProgress.is_integrity());
        assert_eq!(SyncError::SyncInProgress.to_string(), "Sync already in progress");
    }
}
