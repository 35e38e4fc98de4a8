//! Audit engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_storage::{ConfigError, RetryConfig};

/// Default number of entries that triggers an early flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum time an entry waits in the batch.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on entries held in memory while the store is unreachable.
pub const DEFAULT_MAX_PENDING: usize = 100_000;

/// Default score at or above which an entry is high risk.
pub const DEFAULT_HIGH_RISK_THRESHOLD: f64 = 0.7;

/// Tunables for [`AuditEngine`](crate::AuditEngine).
///
/// ```
/// use std::time::Duration;
/// use warden_audit::AuditConfig;
///
/// let config = AuditConfig::builder()
///     .batch_size(50)
///     .flush_interval(Duration::from_millis(200))
///     .build()?;
/// assert_eq!(config.batch_size(), 50);
/// # Ok::<(), warden_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAuditConfig")]
pub struct AuditConfig {
    pub(crate) batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub(crate) flush_interval: Duration,
    pub(crate) max_pending: usize,
    pub(crate) flush_retry: RetryConfig,
    pub(crate) high_risk_threshold: f64,
    pub(crate) channel_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub(crate) known_origin_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) rate_window: Duration,
    pub(crate) rate_threshold: usize,
    pub(crate) first_action_min_prior: usize,
    pub(crate) top_actions: usize,
    pub(crate) sweep_batch_size: usize,
    pub(crate) archive_retry: RetryConfig,
}

/// Wire form of [`AuditConfig`]; every document goes through the builder's
/// checks before it becomes a config.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuditConfig {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    flush_interval: Duration,
    #[serde(default = "default_max_pending")]
    max_pending: usize,
    #[serde(default)]
    flush_retry: RetryConfig,
    #[serde(default = "default_high_risk_threshold")]
    high_risk_threshold: f64,
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
    #[serde(with = "humantime_serde", default = "default_known_origin_ttl")]
    known_origin_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_rate_window")]
    rate_window: Duration,
    #[serde(default = "default_rate_threshold")]
    rate_threshold: usize,
    #[serde(default = "default_first_action_min_prior")]
    first_action_min_prior: usize,
    #[serde(default = "default_top_actions")]
    top_actions: usize,
    #[serde(default = "default_sweep_batch_size")]
    sweep_batch_size: usize,
    #[serde(default)]
    archive_retry: RetryConfig,
}

impl TryFrom<RawAuditConfig> for AuditConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAuditConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .batch_size(raw.batch_size)
            .flush_interval(raw.flush_interval)
            .max_pending(raw.max_pending)
            .flush_retry(raw.flush_retry)
            .high_risk_threshold(raw.high_risk_threshold)
            .channel_capacity(raw.channel_capacity)
            .known_origin_ttl(raw.known_origin_ttl)
            .rate_window(raw.rate_window)
            .rate_threshold(raw.rate_threshold)
            .first_action_min_prior(raw.first_action_min_prior)
            .top_actions(raw.top_actions)
            .sweep_batch_size(raw.sweep_batch_size)
            .archive_retry(raw.archive_retry)
            .build()
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}

fn default_high_risk_threshold() -> f64 {
    DEFAULT_HIGH_RISK_THRESHOLD
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_known_origin_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_rate_window() -> Duration {
    Duration::from_secs(300)
}

fn default_rate_threshold() -> usize {
    100
}

fn default_first_action_min_prior() -> usize {
    5
}

fn default_top_actions() -> usize {
    10
}

fn default_sweep_batch_size() -> usize {
    500
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_pending: default_max_pending(),
            flush_retry: RetryConfig::default(),
            high_risk_threshold: default_high_risk_threshold(),
            channel_capacity: default_channel_capacity(),
            known_origin_ttl: default_known_origin_ttl(),
            rate_window: default_rate_window(),
            rate_threshold: default_rate_threshold(),
            first_action_min_prior: default_first_action_min_prior(),
            top_actions: default_top_actions(),
            sweep_batch_size: default_sweep_batch_size(),
            archive_retry: RetryConfig::default(),
        }
    }
}

fn at_least(field: &'static str, value: usize, min: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum { field, min: min.to_string(), value: value.to_string() });
    }
    Ok(())
}

#[bon::bon]
impl AuditConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] for zero sizes, capacities or intervals
    /// - [`ConfigError::OutOfRange`] if `high_risk_threshold` is outside `(0, 1]`
    /// - [`ConfigError::Invalid`] if `max_pending` is smaller than `batch_size`
    #[builder]
    pub fn new(
        #[builder(default = default_batch_size())] batch_size: usize,
        #[builder(default = default_flush_interval())] flush_interval: Duration,
        #[builder(default = default_max_pending())] max_pending: usize,
        #[builder(default)] flush_retry: RetryConfig,
        #[builder(default = default_high_risk_threshold())] high_risk_threshold: f64,
        #[builder(default = default_channel_capacity())] channel_capacity: usize,
        #[builder(default = default_known_origin_ttl())] known_origin_ttl: Duration,
        #[builder(default = default_rate_window())] rate_window: Duration,
        #[builder(default = default_rate_threshold())] rate_threshold: usize,
        #[builder(default = default_first_action_min_prior())] first_action_min_prior: usize,
        #[builder(default = default_top_actions())] top_actions: usize,
        #[builder(default = default_sweep_batch_size())] sweep_batch_size: usize,
        #[builder(default)] archive_retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        at_least("batch_size", batch_size, 1)?;
        at_least("channel_capacity", channel_capacity, 1)?;
        if max_pending < batch_size {
            return Err(ConfigError::Invalid(format!(
                "max_pending ({max_pending}) must be at least batch_size ({batch_size})"
            )));
        }
        at_least("rate_threshold", rate_threshold, 1)?;
        at_least("sweep_batch_size", sweep_batch_size, 1)?;
        if flush_interval.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "flush_interval",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }
        if rate_window.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "rate_window",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }
        if !(high_risk_threshold > 0.0 && high_risk_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "high_risk_threshold",
                range: "(0, 1]".into(),
                value: high_risk_threshold.to_string(),
            });
        }
        Ok(Self {
            batch_size,
            flush_interval,
            max_pending,
            flush_retry,
            high_risk_threshold,
            channel_capacity,
            known_origin_ttl,
            rate_window,
            rate_threshold,
            first_action_min_prior,
            top_actions,
            sweep_batch_size,
            archive_retry,
        })
    }

    /// Entries that trigger an early flush.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Maximum time an entry waits in the batch.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Entries held in memory before the oldest are dropped.
    #[must_use]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Backoff between failed background flushes.
    #[must_use]
    pub fn flush_retry(&self) -> &RetryConfig {
        &self.flush_retry
    }

    /// Score at or above which an entry is high risk.
    #[must_use]
    pub fn high_risk_threshold(&self) -> f64 {
        self.high_risk_threshold
    }

    /// Buffered events per subscriber channel.
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// How long an actor's network origin stays familiar.
    #[must_use]
    pub fn known_origin_ttl(&self) -> Duration {
        self.known_origin_ttl
    }

    /// Rolling window for activity-rate anomalies.
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        self.rate_window
    }

    /// Entries per actor within `rate_window` above which activity is anomalous.
    #[must_use]
    pub fn rate_threshold(&self) -> usize {
        self.rate_threshold
    }

    /// Distinct prior actions an actor needs before a new action is anomalous.
    #[must_use]
    pub fn first_action_min_prior(&self) -> usize {
        self.first_action_min_prior
    }

    /// Number of actions listed in a report's top-actions table.
    #[must_use]
    pub fn top_actions(&self) -> usize {
        self.top_actions
    }

    /// Entries archived and deleted per retention step.
    #[must_use]
    pub fn sweep_batch_size(&self) -> usize {
        self.sweep_batch_size
    }

    /// Backoff policy for archive writes.
    #[must_use]
    pub fn archive_retry(&self) -> &RetryConfig {
        &self.archive_retry
    }
}
