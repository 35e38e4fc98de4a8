//! Storage and configuration error types.
//!
//! Every store in the workspace (key records, sessions, audit entries,
//! archives) maps its failures onto [`StorageError`]. Callers use
//! [`StorageError::is_transient`] to decide between degrading (serving a
//! cached copy, retrying with backoff) and failing the request outright.
//!
//! ```
//! use warden_storage::{StorageError, StorageResult};
//!
//! fn lookup(session_id: &str) -> StorageResult<()> {
//!     Err(StorageError::not_found(format!("session:{session_id}")))
//! }
//!
//! assert!(!lookup("s-1").unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Shared boxed error used to keep `#[source]` chains cloneable.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by record stores.
///
/// # Non-exhaustive
///
/// New variants may be added without a breaking release; downstream matches
/// need a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The addressed record does not exist.
    #[error("Record not found: {key}")]
    NotFound {
        /// Identifier of the missing record.
        key: String,
    },

    /// A compare-and-swap lost against a concurrent writer.
    ///
    /// The caller should re-read the record and re-evaluate.
    #[error("Version conflict on {key}")]
    Conflict {
        /// Identifier of the contended record.
        key: String,
    },

    /// A record with the same identifier already exists.
    #[error("Record already exists: {key}")]
    AlreadyExists {
        /// Identifier of the duplicate record.
        key: String,
    },

    /// The backend could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// Backend-specific failure with no better classification.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its deadline.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a [`StorageError::NotFound`].
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a [`StorageError::Conflict`].
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a [`StorageError::AlreadyExists`].
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Creates a [`StorageError::Connection`] without a source.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a [`StorageError::Connection`] wrapping `source`.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a [`StorageError::Serialization`] without a source.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a [`StorageError::Serialization`] wrapping `source`.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a [`StorageError::Internal`] without a source.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a [`StorageError::Timeout`].
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` when the backend may recover on its own.
    ///
    /// Only connection failures and timeouts qualify. Everything else is a
    /// definitive answer from the backend.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Short single-line description suitable for structured log fields.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::NotFound { key } => format!("not_found({key})"),
            Self::Conflict { key } => format!("conflict({key})"),
            Self::AlreadyExists { key } => format!("already_exists({key})"),
            Self::Connection { message, .. } => format!("connection({message})"),
            Self::Serialization { message, .. } => format!("serialization({message})"),
            Self::Internal { message, .. } => format!("internal({message})"),
            Self::Timeout => "timeout".to_owned(),
        }
    }
}

/// Errors returned by validating configuration builders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its floor.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value, rendered for display.
        min: String,
        /// Value that was supplied, rendered for display.
        value: String,
    },

    /// A field is outside its allowed range.
    #[error("{field} must be within {range}, got {value}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Allowed range, rendered for display.
        range: String,
        /// Value that was supplied, rendered for display.
        value: String,
    },

    /// Two fields contradict each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error as _;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StorageError::connection("refused"), true)]
    #[case(StorageError::timeout(), true)]
    #[case(StorageError::not_found("k"), false)]
    #[case(StorageError::conflict("k"), false)]
    #[case(StorageError::already_exists("k"), false)]
    #[case(StorageError::serialization("bad json"), false)]
    #[case(StorageError::internal("boom"), false)]
    fn test_is_transient(#[case] err: StorageError, #[case] expected: bool) {
        assert_eq!(err.is_transient(), expected, "{err}");
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StorageError::connection_with_source("archive upload", io);
        let source = err.source().expect("source should be attached");
        assert_eq!(source.to_string(), "reset by peer");
    }

    #[test]
    fn test_detail_is_single_line() {
        assert_eq!(StorageError::conflict("session:abc").detail(), "conflict(session:abc)");
        assert_eq!(StorageError::timeout().detail(), "timeout");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "batch_size",
            min: "1".into(),
            value: "0".into(),
        };
        assert_eq!(err.to_string(), "batch_size must be at least 1, got 0");
    }
}
