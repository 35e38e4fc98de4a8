//! Bounded retry with exponential backoff for transient store failures.
//!
//! Only errors for which [`StorageError::is_transient`](crate::StorageError::is_transient) holds are retried.
//! Delays double per attempt from `initial_backoff`, are capped at
//! `max_backoff`, and get 0-50% random jitter on top so that many callers
//! recovering from the same outage do not retry in lockstep.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StorageResult};

/// Retry policy for store operations.
///
/// Deserialization runs the same checks as [`RetryConfig::builder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryConfig")]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub(crate) max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub(crate) initial_backoff: Duration,
    /// Upper bound on the pre-jitter delay.
    #[serde(with = "humantime_serde")]
    pub(crate) max_backoff: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetryConfig {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

impl TryFrom<RawRetryConfig> for RetryConfig {
    type Error = ConfigError;

    fn try_from(raw: RawRetryConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .max_retries(raw.max_retries)
            .initial_backoff(raw.initial_backoff)
            .max_backoff(raw.max_backoff)
            .build()
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `initial_backoff` exceeds
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        if initial_backoff > max_backoff {
            return Err(ConfigError::Invalid(format!(
                "initial_backoff ({initial_backoff:?}) exceeds max_backoff ({max_backoff:?})"
            )));
        }
        Ok(Self { max_retries, initial_backoff, max_backoff })
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Upper bound on the pre-jitter delay.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Runs `operation`, retrying transient failures per `config`.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once retries are exhausted.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Delay before retry number `attempt + 1`.
#[must_use]
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
