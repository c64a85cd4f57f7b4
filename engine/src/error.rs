//! Error types for the Tether engine.

use crate::ConflictId;
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Record errors
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    // Conflict errors
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(ConflictId),

    #[error("unknown conflict strategy: {0}")]
    UnknownStrategy(String),

    // Backup errors
    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    #[error("unsupported backup format version: {found} (max supported: {supported})")]
    UnsupportedBackupVersion { found: u32, supported: u32 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
