//! Session error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_authn::{
    KeyError,
    error::{GENERIC_REJECTION, GENERIC_UNAVAILABLE},
};
use warden_storage::{ConfigError, SessionId, StorageError};

/// Session operation failures.
///
/// Errors that concern the presented credential are terminal for the
/// request and map to [`GENERIC_REJECTION`] for clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The refresh token matches no session.
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    /// A superseded refresh token was presented; the session is now revoked.
    #[error("Refresh token reuse detected for session {session_id}")]
    ReuseDetected {
        /// The revoked session.
        session_id: SessionId,
    },

    /// The session was revoked earlier.
    #[error("Session {session_id} is revoked")]
    SessionRevoked {
        /// The revoked session.
        session_id: SessionId,
    },

    /// The session outlived its absolute lifetime.
    #[error("Session {session_id} has expired")]
    SessionExpired {
        /// The expired session.
        session_id: SessionId,
    },

    /// No session with this id exists.
    #[error("Session {0} not found")]
    NotFound(SessionId),

    /// The session store failed.
    #[error("Session storage error: {0}")]
    Storage(
        /// Underlying store failure.
        #[source]
        StorageError,
    ),

    /// The access token could not be signed.
    #[error("Access token signing failed: {0}")]
    Signing(
        /// Underlying key store failure.
        #[source]
        KeyError,
    ),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Stable classification recorded in audit metadata.
    #[must_use]
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::InvalidRefreshToken => SessionErrorKind::InvalidRefreshToken,
            Self::ReuseDetected { .. } => SessionErrorKind::ReuseDetected,
            Self::SessionRevoked { .. } => SessionErrorKind::SessionRevoked,
            Self::SessionExpired { .. } => SessionErrorKind::SessionExpired,
            Self::NotFound(_) => SessionErrorKind::NotFound,
            Self::Storage(_) => SessionErrorKind::Storage,
            Self::Signing(_) => SessionErrorKind::Signing,
            Self::Config(_) => SessionErrorKind::Config,
        }
    }

    /// Text safe to return to the caller.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Storage(_) | Self::Signing(_) | Self::Config(_) => GENERIC_UNAVAILABLE,
            _ => GENERIC_REJECTION,
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<KeyError> for SessionError {
    fn from(err: KeyError) -> Self {
        Self::Signing(err)
    }
}

/// [`SessionError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionErrorKind {
    /// See [`SessionError::InvalidRefreshToken`].
    InvalidRefreshToken,
    /// See [`SessionError::ReuseDetected`].
    ReuseDetected,
    /// See [`SessionError::SessionRevoked`].
    SessionRevoked,
    /// See [`SessionError::SessionExpired`].
    SessionExpired,
    /// See [`SessionError::NotFound`].
    NotFound,
    /// See [`SessionError::Storage`].
    Storage,
    /// See [`SessionError::Signing`].
    Signing,
    /// See [`SessionError::Config`].
    Config,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidRefreshToken => "invalid_refresh_token",
            Self::ReuseDetected => "reuse_detected",
            Self::SessionRevoked => "session_revoked",
            Self::SessionExpired => "session_expired",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Signing => "signing",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
