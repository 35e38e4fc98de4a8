//! Session lifetime and rotation settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_storage::{ConfigError, RetryConfig};

/// Default access token lifetime (15 minutes).
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Default absolute session lifetime (30 days).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 3_600);

/// Default time a superseded refresh hash is kept for reuse detection (24 hours).
pub const DEFAULT_REUSE_DETECTION_WINDOW: Duration = Duration::from_secs(24 * 3_600);

/// Default cap on retained superseded hashes per session.
pub const DEFAULT_MAX_PREVIOUS_HASHES: usize = 8;

/// Default `aud` of issued access tokens.
pub const DEFAULT_AUDIENCE: &str = "api";

fn default_access_token_ttl() -> Duration {
    DEFAULT_ACCESS_TOKEN_TTL
}

fn default_session_ttl() -> Duration {
    DEFAULT_SESSION_TTL
}

fn default_reuse_detection_window() -> Duration {
    DEFAULT_REUSE_DETECTION_WINDOW
}

fn default_max_previous_hashes() -> usize {
    DEFAULT_MAX_PREVIOUS_HASHES
}

fn default_audience() -> String {
    DEFAULT_AUDIENCE.to_owned()
}

/// Session manager settings.
///
/// ```
/// use std::time::Duration;
/// use warden_session::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .access_token_ttl(Duration::from_secs(300))
///     .audience("billing")
///     .build()?;
/// assert_eq!(config.audience(), "billing");
/// # Ok::<(), warden_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSessionConfig")]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    access_token_ttl: Duration,
    #[serde(with = "humantime_serde")]
    session_ttl: Duration,
    #[serde(with = "humantime_serde")]
    reuse_detection_window: Duration,
    max_previous_hashes: usize,
    audience: String,
    revoke_retry: RetryConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSessionConfig {
    #[serde(with = "humantime_serde", default = "default_access_token_ttl")]
    access_token_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    session_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_reuse_detection_window")]
    reuse_detection_window: Duration,
    #[serde(default = "default_max_previous_hashes")]
    max_previous_hashes: usize,
    #[serde(default = "default_audience")]
    audience: String,
    #[serde(default)]
    revoke_retry: RetryConfig,
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSessionConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .access_token_ttl(raw.access_token_ttl)
            .session_ttl(raw.session_ttl)
            .reuse_detection_window(raw.reuse_detection_window)
            .max_previous_hashes(raw.max_previous_hashes)
            .audience(raw.audience)
            .revoke_retry(raw.revoke_retry)
            .build()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: default_access_token_ttl(),
            session_ttl: default_session_ttl(),
            reuse_detection_window: default_reuse_detection_window(),
            max_previous_hashes: default_max_previous_hashes(),
            audience: default_audience(),
            revoke_retry: RetryConfig::default(),
        }
    }
}

#[bon::bon]
impl SessionConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] for a zero TTL or zero retained hashes
    /// - [`ConfigError::Invalid`] if the access token outlives the session, or the audience is empty
    #[builder]
    pub fn new(
        #[builder(default = default_access_token_ttl())] access_token_ttl: Duration,
        #[builder(default = default_session_ttl())] session_ttl: Duration,
        #[builder(default = default_reuse_detection_window())] reuse_detection_window: Duration,
        #[builder(default = default_max_previous_hashes())] max_previous_hashes: usize,
        #[builder(into, default = default_audience())] audience: String,
        #[builder(default)] revoke_retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        if access_token_ttl.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "access_token_ttl",
                min: "1s".into(),
                value: "0s".into(),
            });
        }
        if max_previous_hashes == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_previous_hashes",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if access_token_ttl > session_ttl {
            return Err(ConfigError::Invalid(format!(
                "access_token_ttl ({access_token_ttl:?}) must not exceed session_ttl ({session_ttl:?})"
            )));
        }
        if audience.trim().is_empty() {
            return Err(ConfigError::Invalid("audience must not be empty".into()));
        }
        Ok(Self {
            access_token_ttl,
            session_ttl,
            reuse_detection_window,
            max_previous_hashes,
            audience,
            revoke_retry,
        })
    }

    /// Lifetime of each access token; capped by the session's own expiry.
    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    /// Absolute session lifetime from issue.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// How long a superseded refresh token still triggers reuse detection.
    #[must_use]
    pub fn reuse_detection_window(&self) -> Duration {
        self.reuse_detection_window
    }

    /// Most superseded hashes kept per session.
    #[must_use]
    pub fn max_previous_hashes(&self) -> usize {
        self.max_previous_hashes
    }

    /// `aud` of issued access tokens.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Backoff for revocation writes that hit a transient store failure.
    #[must_use]
    pub fn revoke_retry(&self) -> &RetryConfig {
        &self.revoke_retry
    }
}
