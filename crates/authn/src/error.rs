//! Verification and key lifecycle error types.
//!
//! Verification errors are terminal for the request. Each carries enough
//! detail for logs, a stable [`VerificationErrorKind`] for audit metadata,
//! and a [`client_message`](VerificationError::client_message) that never
//! reveals which check failed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_storage::{ConfigError, StorageError, TenantId};

/// Message returned to clients for every credential rejection.
pub const GENERIC_REJECTION: &str = "invalid or expired credentials";

/// Message returned to clients when verification could not be completed.
pub const GENERIC_UNAVAILABLE: &str = "authentication temporarily unavailable";

/// Why a bearer token was rejected.
///
/// # Non-exhaustive
///
/// New variants may be added without a breaking release; downstream matches
/// need a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// The token is not three base64url segments of valid JSON.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The header names an algorithm outside the accepted list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No published key matches the token's `kid`, even after a refetch.
    #[error("Unknown signing key {kid} for tenant {tenant_id}")]
    UnknownKey {
        /// Tenant whose key set was consulted.
        tenant_id: TenantId,
        /// Key id from the token header.
        kid: String,
    },

    /// No key with the token's `kid` produced a valid signature.
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// `exp` is in the past, beyond the clock-skew tolerance.
    #[error("Token expired")]
    Expired,

    /// `nbf` is in the future, beyond the clock-skew tolerance.
    #[error("Token not yet valid")]
    NotYetValid,

    /// The token was issued for another tenant.
    #[error("Tenant mismatch: expected {expected}, token carries {actual}")]
    TenantMismatch {
        /// Tenant the caller expected.
        expected: TenantId,
        /// Tenant claimed by the token.
        actual: String,
    },

    /// `aud` does not name the expected audience.
    #[error("Audience mismatch: expected {expected}, token carries {actual}")]
    AudienceMismatch {
        /// Audience the caller expected.
        expected: String,
        /// Audience claimed by the token.
        actual: String,
    },

    /// `iss` does not name the configured issuer.
    #[error("Issuer mismatch: expected {expected}, token carries {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer claimed by the token.
        actual: String,
    },

    /// The key set could not be fetched and no usable cached copy exists.
    #[error("Key set for tenant {tenant_id} unavailable")]
    KeyFetchUnavailable {
        /// Tenant whose key set was requested.
        tenant_id: TenantId,
        /// Fetch failure.
        #[source]
        source: StorageError,
    },
}

impl VerificationError {
    /// Creates a [`VerificationError::MalformedToken`].
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedToken(message.into())
    }

    /// Creates a [`VerificationError::UnknownKey`].
    #[must_use]
    pub fn unknown_key(tenant_id: &TenantId, kid: impl Into<String>) -> Self {
        Self::UnknownKey { tenant_id: tenant_id.clone(), kid: kid.into() }
    }

    /// Stable classification recorded in audit metadata.
    #[must_use]
    pub fn kind(&self) -> VerificationErrorKind {
        match self {
            Self::MalformedToken(_) => VerificationErrorKind::MalformedToken,
            Self::UnsupportedAlgorithm(_) => VerificationErrorKind::UnsupportedAlgorithm,
            Self::UnknownKey { .. } => VerificationErrorKind::UnknownKey,
            Self::SignatureMismatch => VerificationErrorKind::SignatureMismatch,
            Self::Expired => VerificationErrorKind::Expired,
            Self::NotYetValid => VerificationErrorKind::NotYetValid,
            Self::TenantMismatch { .. } => VerificationErrorKind::TenantMismatch,
            Self::AudienceMismatch { .. } => VerificationErrorKind::AudienceMismatch,
            Self::IssuerMismatch { .. } => VerificationErrorKind::IssuerMismatch,
            Self::KeyFetchUnavailable { .. } => VerificationErrorKind::KeyFetchUnavailable,
        }
    }

    /// Text safe to return to the caller.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::KeyFetchUnavailable { .. } => GENERIC_UNAVAILABLE,
            _ => GENERIC_REJECTION,
        }
    }

    /// Returns `true` when the failure says nothing about the token itself.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::KeyFetchUnavailable { .. })
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => Self::SignatureMismatch,
            ErrorKind::InvalidAlgorithm => {
                Self::UnsupportedAlgorithm("algorithm does not match key".into())
            },
            ErrorKind::InvalidToken => Self::malformed("invalid JWT structure"),
            _ => Self::malformed(format!("JWT error: {err}")),
        }
    }
}

/// [`VerificationError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum VerificationErrorKind {
    /// See [`VerificationError::MalformedToken`].
    MalformedToken,
    /// See [`VerificationError::UnsupportedAlgorithm`].
    UnsupportedAlgorithm,
    /// See [`VerificationError::UnknownKey`].
    UnknownKey,
    /// See [`VerificationError::SignatureMismatch`].
    SignatureMismatch,
    /// See [`VerificationError::Expired`].
    Expired,
    /// See [`VerificationError::NotYetValid`].
    NotYetValid,
    /// See [`VerificationError::TenantMismatch`].
    TenantMismatch,
    /// See [`VerificationError::AudienceMismatch`].
    AudienceMismatch,
    /// See [`VerificationError::IssuerMismatch`].
    IssuerMismatch,
    /// See [`VerificationError::KeyFetchUnavailable`].
    KeyFetchUnavailable,
}

impl fmt::Display for VerificationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedToken => "malformed_token",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::UnknownKey => "unknown_key",
            Self::SignatureMismatch => "signature_mismatch",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::TenantMismatch => "tenant_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::KeyFetchUnavailable => "key_fetch_unavailable",
        };
        f.write_str(name)
    }
}

/// Signing-key lifecycle errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The cryptographic provider could not produce a key pair.
    #[error("Key generation failed: {0}")]
    KeyGenerationError(String),

    /// The tenant has no `Active` key to sign with.
    #[error("No active signing key for tenant {0}")]
    NoActiveKey(TenantId),

    /// A stored key could not be used to sign.
    #[error("Token signing failed: {0}")]
    Signing(String),

    /// Published key material is not a valid Ed25519 public key.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The key record store failed.
    #[error("Key storage error: {0}")]
    Storage(
        /// Underlying store failure.
        #[source]
        StorageError,
    ),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StorageError> for KeyError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// Result alias for verification.
pub type Result<T> = std::result::Result<T, VerificationError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error as _;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(VerificationError::malformed("x"), "malformed_token")]
    #[case(VerificationError::SignatureMismatch, "signature_mismatch")]
    #[case(VerificationError::Expired, "expired")]
    #[case(VerificationError::unknown_key(&TenantId::from("acme"), "k1"), "unknown_key")]
    #[case(
        VerificationError::TenantMismatch { expected: TenantId::from("acme"), actual: "globex".into() },
        "tenant_mismatch"
    )]
    fn test_kind_names(#[case] err: VerificationError, #[case] expected: &str) {
        assert_eq!(err.kind().to_string(), expected);
        assert_eq!(err.client_message(), GENERIC_REJECTION);
    }

    #[test]
    fn test_client_message_hides_detail() {
        let err = VerificationError::AudienceMismatch {
            expected: "billing".into(),
            actual: "admin".into(),
        };
        assert!(err.to_string().contains("billing"));
        assert!(!err.client_message().contains("audience"));
    }

    #[test]
    fn test_fetch_unavailable_keeps_source() {
        let err = VerificationError::KeyFetchUnavailable {
            tenant_id: TenantId::from("acme"),
            source: StorageError::timeout(),
        };
        assert!(err.is_unavailable());
        assert_eq!(err.client_message(), GENERIC_UNAVAILABLE);
        assert_eq!(err.source().unwrap().to_string(), "Operation timeout");
    }

    #[test]
    fn test_from_jsonwebtoken_signature_error() {
        let jwt_err =
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSignature);
        assert!(matches!(VerificationError::from(jwt_err), VerificationError::SignatureMismatch));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&VerificationErrorKind::KeyFetchUnavailable).unwrap();
        assert_eq!(json, "\"key_fetch_unavailable\"");
    }

    #[test]
    fn test_key_error_from_storage() {
        let err: KeyError = StorageError::connection("refused").into();
        assert_eq!(err.to_string(), "Key storage error: Connection error: refused");
        assert!(err.source().is_some());
    }
}
