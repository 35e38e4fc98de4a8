//! Audit engine error types.

use thiserror::Error;
use uuid::Uuid;
use warden_storage::{ConfigError, StorageError};

/// Errors surfaced by the audit engine.
///
/// # Non-exhaustive
///
/// New variants may be added without a breaking release; downstream matches
/// need a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// The audit log store failed.
    #[error("Audit store error: {0}")]
    Storage(
        /// Underlying store failure.
        #[source]
        StorageError,
    ),

    /// Archiving entries before deletion failed after every retry.
    ///
    /// The entries were left in place; the next sweep retries them.
    #[error("Archive write failed after {attempts} attempt(s) for {entries} entries")]
    ArchiveWriteFailed {
        /// Number of archive attempts made.
        attempts: u32,
        /// Number of entries that could not be archived.
        entries: usize,
        /// Last archive failure.
        #[source]
        source: StorageError,
    },

    /// No entry with this id exists.
    #[error("Audit entry not found: {0}")]
    EntryNotFound(Uuid),

    /// An entry or export document could not be encoded or decoded.
    #[error("Audit serialization error: {0}")]
    Serialization(String),

    /// An imported entry failed its integrity check.
    #[error("Imported entry {0} failed integrity verification")]
    IntegrityMismatch(Uuid),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Webhook signing or delivery failed.
    #[error("Webhook error: {0}")]
    Webhook(String),
}

impl From<StorageError> for AuditError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_archive_failure_keeps_source() {
        let err = AuditError::ArchiveWriteFailed {
            attempts: 4,
            entries: 12,
            source: StorageError::connection("bucket unreachable"),
        };
        assert_eq!(err.to_string(), "Archive write failed after 4 attempt(s) for 12 entries");
        assert!(err.source().unwrap().to_string().contains("bucket unreachable"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: AuditError = ConfigError::Invalid("compliance mode needs archiving".into()).into();
        assert_eq!(err.to_string(), "invalid configuration: compliance mode needs archiving");
    }
}
