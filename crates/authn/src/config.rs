//! Configuration for the key store, key set cache and verifier.
//!
//! All three deserialize with `humantime` durations and reject unknown
//! fields. The builders validate and return [`ConfigError`], and
//! deserialization goes through the same builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_storage::ConfigError;

/// Issuer used when none is configured.
pub const DEFAULT_ISSUER: &str = "https://auth.warden.local";

/// Default upper bound on access token lifetime (1 hour).
pub const DEFAULT_MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(3_600);

/// Default margin added to a retiring key's deadline (30 seconds).
pub const DEFAULT_RETIREMENT_SKEW: Duration = Duration::from_secs(30);

/// Default time an `Expired` key is kept before deletion (24 hours).
pub const DEFAULT_EXPIRED_GRACE: Duration = Duration::from_secs(24 * 3_600);

/// Default TTL advertised for published key sets (5 minutes).
pub const DEFAULT_KEY_SET_TTL: Duration = Duration::from_secs(300);

/// Default limit on how long a cached key set may be served while the
/// source is down (1 hour).
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(3_600);

/// Default deadline for one key set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default clock-skew tolerance for `exp` and `nbf`.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Converts a configured duration for timestamp arithmetic.
///
/// Durations too large for chrono are clamped to a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::BelowMinimum { field, min: "1ms".into(), value: "0s".into() });
    }
    Ok(())
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_owned()
}

fn default_max_token_lifetime() -> Duration {
    DEFAULT_MAX_TOKEN_LIFETIME
}

fn default_retirement_skew() -> Duration {
    DEFAULT_RETIREMENT_SKEW
}

fn default_expired_grace() -> Duration {
    DEFAULT_EXPIRED_GRACE
}

fn default_key_set_ttl() -> Duration {
    DEFAULT_KEY_SET_TTL
}

fn default_max_staleness() -> Duration {
    DEFAULT_MAX_STALENESS
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_clock_skew() -> Duration {
    DEFAULT_CLOCK_SKEW
}

fn default_repeated_failure_window() -> Duration {
    Duration::from_secs(300)
}

fn default_repeated_failure_threshold() -> u32 {
    3
}

fn default_max_tracked_subjects() -> u64 {
    100_000
}

/// Signing-key lifecycle settings.
///
/// ```
/// use std::time::Duration;
/// use warden_authn::KeyStoreConfig;
///
/// let config = KeyStoreConfig::builder()
///     .issuer("https://auth.example.com")
///     .max_token_lifetime(Duration::from_secs(900))
///     .build()?;
/// assert_eq!(config.issuer(), "https://auth.example.com");
/// # Ok::<(), warden_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawKeyStoreConfig")]
pub struct KeyStoreConfig {
    pub(crate) issuer: String,
    #[serde(with = "humantime_serde")]
    pub(crate) max_token_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) retirement_skew: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) expired_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) published_ttl: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyStoreConfig {
    #[serde(default = "default_issuer")]
    issuer: String,
    #[serde(with = "humantime_serde", default = "default_max_token_lifetime")]
    max_token_lifetime: Duration,
    #[serde(with = "humantime_serde", default = "default_retirement_skew")]
    retirement_skew: Duration,
    #[serde(with = "humantime_serde", default = "default_expired_grace")]
    expired_grace_period: Duration,
    #[serde(with = "humantime_serde", default = "default_key_set_ttl")]
    published_ttl: Duration,
}

impl TryFrom<RawKeyStoreConfig> for KeyStoreConfig {
    type Error = ConfigError;

    fn try_from(raw: RawKeyStoreConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .issuer(raw.issuer)
            .max_token_lifetime(raw.max_token_lifetime)
            .retirement_skew(raw.retirement_skew)
            .expired_grace_period(raw.expired_grace_period)
            .published_ttl(raw.published_ttl)
            .build()
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            max_token_lifetime: default_max_token_lifetime(),
            retirement_skew: default_retirement_skew(),
            expired_grace_period: default_expired_grace(),
            published_ttl: default_key_set_ttl(),
        }
    }
}

#[bon::bon]
impl KeyStoreConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] for an empty issuer
    /// - [`ConfigError::BelowMinimum`] for a zero token lifetime or TTL
    #[builder]
    pub fn new(
        #[builder(into, default = default_issuer())] issuer: String,
        #[builder(default = default_max_token_lifetime())] max_token_lifetime: Duration,
        #[builder(default = default_retirement_skew())] retirement_skew: Duration,
        #[builder(default = default_expired_grace())] expired_grace_period: Duration,
        #[builder(default = default_key_set_ttl())] published_ttl: Duration,
    ) -> Result<Self, ConfigError> {
        non_empty("issuer", &issuer)?;
        non_zero("max_token_lifetime", max_token_lifetime)?;
        non_zero("published_ttl", published_ttl)?;
        Ok(Self { issuer, max_token_lifetime, retirement_skew, expired_grace_period, published_ttl })
    }

    /// `iss` of every token signed by the store.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Longest `exp - now` the store will sign.
    #[must_use]
    pub fn max_token_lifetime(&self) -> Duration {
        self.max_token_lifetime
    }

    /// Margin added to a retiring key's deadline.
    #[must_use]
    pub fn retirement_skew(&self) -> Duration {
        self.retirement_skew
    }

    /// Time an `Expired` key is kept before deletion.
    #[must_use]
    pub fn expired_grace_period(&self) -> Duration {
        self.expired_grace_period
    }

    /// TTL advertised with published key sets.
    #[must_use]
    pub fn published_ttl(&self) -> Duration {
        self.published_ttl
    }
}

/// Key set cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawKeySetCacheConfig")]
pub struct KeySetCacheConfig {
    #[serde(with = "humantime_serde")]
    pub(crate) ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) max_staleness: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) fetch_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeySetCacheConfig {
    #[serde(with = "humantime_serde", default = "default_key_set_ttl")]
    ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_max_staleness")]
    max_staleness: Duration,
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    fetch_timeout: Duration,
}

impl TryFrom<RawKeySetCacheConfig> for KeySetCacheConfig {
    type Error = ConfigError;

    fn try_from(raw: RawKeySetCacheConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .ttl(raw.ttl)
            .max_staleness(raw.max_staleness)
            .fetch_timeout(raw.fetch_timeout)
            .build()
    }
}

impl Default for KeySetCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_key_set_ttl(),
            max_staleness: default_max_staleness(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

#[bon::bon]
impl KeySetCacheConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] for a zero TTL or fetch timeout
    /// - [`ConfigError::Invalid`] if `max_staleness` is shorter than `ttl`
    #[builder]
    pub fn new(
        #[builder(default = default_key_set_ttl())] ttl: Duration,
        #[builder(default = default_max_staleness())] max_staleness: Duration,
        #[builder(default = default_fetch_timeout())] fetch_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        non_zero("ttl", ttl)?;
        non_zero("fetch_timeout", fetch_timeout)?;
        if max_staleness < ttl {
            return Err(ConfigError::Invalid(format!(
                "max_staleness ({max_staleness:?}) must be at least ttl ({ttl:?})"
            )));
        }
        Ok(Self { ttl, max_staleness, fetch_timeout })
    }

    /// Upper bound on how long a snapshot counts as fresh; the source's own
    /// TTL applies when shorter.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How long after caching a snapshot may still be served when a fetch
    /// fails transiently.
    #[must_use]
    pub fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    /// Deadline for one fetch.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }
}

/// Token verifier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVerifierConfig")]
pub struct VerifierConfig {
    pub(crate) issuer: String,
    #[serde(with = "humantime_serde")]
    pub(crate) clock_skew: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) repeated_failure_window: Duration,
    pub(crate) repeated_failure_threshold: u32,
    pub(crate) max_tracked_subjects: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVerifierConfig {
    #[serde(default = "default_issuer")]
    issuer: String,
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    clock_skew: Duration,
    #[serde(with = "humantime_serde", default = "default_repeated_failure_window")]
    repeated_failure_window: Duration,
    #[serde(default = "default_repeated_failure_threshold")]
    repeated_failure_threshold: u32,
    #[serde(default = "default_max_tracked_subjects")]
    max_tracked_subjects: u64,
}

impl TryFrom<RawVerifierConfig> for VerifierConfig {
    type Error = ConfigError;

    fn try_from(raw: RawVerifierConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .issuer(raw.issuer)
            .clock_skew(raw.clock_skew)
            .repeated_failure_window(raw.repeated_failure_window)
            .repeated_failure_threshold(raw.repeated_failure_threshold)
            .max_tracked_subjects(raw.max_tracked_subjects)
            .build()
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            clock_skew: default_clock_skew(),
            repeated_failure_window: default_repeated_failure_window(),
            repeated_failure_threshold: default_repeated_failure_threshold(),
            max_tracked_subjects: default_max_tracked_subjects(),
        }
    }
}

#[bon::bon]
impl VerifierConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] for an empty issuer
    /// - [`ConfigError::BelowMinimum`] for a zero failure window, threshold or tracking capacity
    #[builder]
    pub fn new(
        #[builder(into, default = default_issuer())] issuer: String,
        #[builder(default = default_clock_skew())] clock_skew: Duration,
        #[builder(default = default_repeated_failure_window())] repeated_failure_window: Duration,
        #[builder(default = default_repeated_failure_threshold())] repeated_failure_threshold: u32,
        #[builder(default = default_max_tracked_subjects())] max_tracked_subjects: u64,
    ) -> Result<Self, ConfigError> {
        non_empty("issuer", &issuer)?;
        non_zero("repeated_failure_window", repeated_failure_window)?;
        if repeated_failure_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "repeated_failure_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if max_tracked_subjects == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_tracked_subjects",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self {
            issuer,
            clock_skew,
            repeated_failure_window,
            repeated_failure_threshold,
            max_tracked_subjects,
        })
    }

    /// Expected `iss`.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Tolerance applied to `exp` and `nbf`.
    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Window in which failures for one subject are counted together.
    #[must_use]
    pub fn repeated_failure_window(&self) -> Duration {
        self.repeated_failure_window
    }

    /// Failures within the window at which events are raised to high risk.
    #[must_use]
    pub fn repeated_failure_threshold(&self) -> u32 {
        self.repeated_failure_threshold
    }

    /// Upper bound on subjects tracked for repeated failures.
    #[must_use]
    pub fn max_tracked_subjects(&self) -> u64 {
        self.max_tracked_subjects
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_pass_validation() {
        let d = KeyStoreConfig::default();
        let built = KeyStoreConfig::builder().build().unwrap();
        assert_eq!(built, d);
        assert_eq!(KeySetCacheConfig::builder().build().unwrap(), KeySetCacheConfig::default());
        assert_eq!(VerifierConfig::builder().build().unwrap(), VerifierConfig::default());
    }

    #[rstest]
    #[case(KeyStoreConfig::builder().issuer("  ").build().unwrap_err())]
    #[case(KeyStoreConfig::builder().max_token_lifetime(Duration::ZERO).build().unwrap_err())]
    #[case(KeySetCacheConfig::builder().fetch_timeout(Duration::ZERO).build().unwrap_err())]
    #[case(VerifierConfig::builder().repeated_failure_threshold(0).build().unwrap_err())]
    fn test_rejected(#[case] err: ConfigError) {
        assert!(matches!(err, ConfigError::Invalid(_) | ConfigError::BelowMinimum { .. }), "{err}");
    }

    #[test]
    fn test_staleness_must_cover_ttl() {
        let err = KeySetCacheConfig::builder()
            .ttl(Duration::from_secs(600))
            .max_staleness(Duration::from_secs(60))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_staleness"));
    }

    #[test]
    fn test_humantime_deserialization() {
        let config: KeySetCacheConfig =
            serde_json::from_str(r#"{"ttl": "2m", "fetch_timeout": "750ms"}"#).unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(120));
        assert_eq!(config.fetch_timeout(), Duration::from_millis(750));
        assert_eq!(config.max_staleness(), DEFAULT_MAX_STALENESS);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<VerifierConfig, _> = serde_json::from_str(r#"{"isuer": "typo"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialization_runs_builder_checks() {
        let err = serde_json::from_str::<KeySetCacheConfig>(r#"{"max_staleness": "1s"}"#).unwrap_err();
        assert!(err.to_string().contains("max_staleness"), "{err}");

        let err =
            serde_json::from_str::<VerifierConfig>(r#"{"repeated_failure_threshold": 0}"#).unwrap_err();
        assert!(err.to_string().contains("repeated_failure_threshold"), "{err}");

        let err = serde_json::from_str::<KeyStoreConfig>(r#"{"issuer": "  "}"#).unwrap_err();
        assert!(err.to_string().contains("issuer"), "{err}");
    }

    #[test]
    fn test_to_chrono_clamps() {
        assert_eq!(to_chrono(Duration::from_secs(90)), chrono::Duration::seconds(90));
        assert_eq!(to_chrono(Duration::MAX), chrono::Duration::days(36_500));
    }
}
