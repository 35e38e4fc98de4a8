//! Signed webhook delivery of high-risk audit events.
//!
//! Each delivery is a JSON [`WebhookPayload`] POSTed with two headers:
//!
//! - `X-Warden-Timestamp`: unix seconds at signing time
//! - `X-Warden-Signature`: `sha256=<hex>` HMAC-SHA256 over `{timestamp}.{body}`
//!
//! Receivers check both with [`verify_webhook`], or with a
//! [`WebhookVerifier`] which additionally rejects replays of an event id
//! already accepted within the tolerance window.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warden_storage::{Clock, ConfigError, RetryConfig, SystemClock, compute_backoff};

use crate::{
    engine::AuditEngine,
    entry::AuditLogEntry,
    error::{AuditError, Result},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Warden-Signature";

/// Header carrying the signing timestamp.
pub const TIMESTAMP_HEADER: &str = "X-Warden-Timestamp";

/// Body of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookPayload {
    /// Audit entry id.
    pub event_id: Uuid,
    /// Entry timestamp, unix seconds.
    pub timestamp: i64,
    /// Entry action.
    pub action: String,
}

impl From<&AuditLogEntry> for WebhookPayload {
    fn from(entry: &AuditLogEntry) -> Self {
        Self {
            event_id: entry.id,
            timestamp: entry.timestamp.timestamp(),
            action: entry.action.clone(),
        }
    }
}

/// Signs `body` as sent at `timestamp`.
///
/// Returns `sha256=<hex>`.
///
/// # Errors
///
/// [`AuditError::Webhook`] if the MAC cannot be keyed.
pub fn sign_payload(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AuditError::Webhook(format!("HMAC initialization failed: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Why a receiver refused a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum WebhookRejection {
    /// Headers or body could not be parsed.
    #[error("malformed webhook delivery: {0}")]
    Malformed(String),
    /// The signature does not match the body and timestamp.
    #[error("webhook signature mismatch")]
    BadSignature,
    /// The timestamp is outside the tolerance window.
    #[error("webhook timestamp is {age_secs}s away from now")]
    Stale {
        /// Distance from the receiver's clock.
        age_secs: i64,
    },
    /// This event id was already accepted.
    #[error("webhook event {0} already delivered")]
    Replayed(Uuid),
}

/// Checks signature and freshness of one delivery.
///
/// # Errors
///
/// A [`WebhookRejection`] describing the first failed check.
pub fn verify_webhook(
    secret: &[u8],
    body: &[u8],
    signature: &str,
    timestamp: &str,
    now_secs: i64,
    tolerance: Duration,
) -> std::result::Result<WebhookPayload, WebhookRejection> {
    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| WebhookRejection::Malformed(format!("bad {TIMESTAMP_HEADER} header")))?;

    let age_secs = now_secs.saturating_sub(sent_at);
    let tolerance_secs = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);
    if age_secs.abs() > tolerance_secs {
        return Err(WebhookRejection::Stale { age_secs });
    }

    let expected =
        sign_payload(secret, sent_at, body).map_err(|e| WebhookRejection::Malformed(e.to_string()))?;
    if !bool::from(expected.as_bytes().ct_eq(signature.trim().as_bytes())) {
        return Err(WebhookRejection::BadSignature);
    }

    serde_json::from_slice(body).map_err(|e| WebhookRejection::Malformed(e.to_string()))
}

/// Stateful receiver-side check that also rejects replays.
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
    accepted: Cache<Uuid, ()>,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// Creates a verifier using the system clock.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: Duration) -> Self {
        Self::with_clock(secret, tolerance, Arc::new(SystemClock))
    }

    /// Creates a verifier with an explicit clock.
    #[must_use]
    pub fn with_clock(secret: impl Into<Vec<u8>>, tolerance: Duration, clock: Arc<dyn Clock>) -> Self {
        // Anything older than the tolerance is rejected as stale, so ids only
        // need to be remembered for the width of the window.
        let accepted =
            Cache::builder().max_capacity(100_000).time_to_live(tolerance.saturating_mul(2)).build();
        Self { secret: secret.into(), tolerance, clock, accepted }
    }

    /// Verifies one delivery given its body and header values.
    ///
    /// # Errors
    ///
    /// A [`WebhookRejection`]; [`WebhookRejection::Replayed`] for an event id
    /// that already passed.
    pub fn verify(
        &self,
        body: &[u8],
        signature: &str,
        timestamp: &str,
    ) -> std::result::Result<WebhookPayload, WebhookRejection> {
        let payload = verify_webhook(
            &self.secret,
            body,
            signature,
            timestamp,
            self.clock.now_secs(),
            self.tolerance,
        )?;

        let entry = self.accepted.entry(payload.event_id).or_insert(());
        if !entry.is_fresh() {
            return Err(WebhookRejection::Replayed(payload.event_id));
        }
        Ok(payload)
    }
}

/// One outgoing delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    /// Endpoint URL.
    pub url: String,
    /// Serialized [`WebhookPayload`].
    pub body: Bytes,
    /// `X-Warden-Signature` value.
    pub signature: String,
    /// `X-Warden-Timestamp` value.
    pub timestamp: i64,
    /// Audit entry id.
    pub event_id: Uuid,
}

/// Receiver's answer to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// 2xx.
    Delivered,
    /// 4xx; not retried.
    Rejected(u16),
    /// 5xx or anything else; retried.
    ServerError(u16),
}

/// Sends webhook requests.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Sends one request.
    ///
    /// `Err` means the request could not be sent at all and is retried.
    async fn deliver(&self, request: &WebhookRequest) -> Result<DeliveryStatus>;
}

#[async_trait]
impl<T: WebhookTransport + ?Sized> WebhookTransport for Arc<T> {
    async fn deliver(&self, request: &WebhookRequest) -> Result<DeliveryStatus> {
        (**self).deliver(request).await
    }
}

/// [`WebhookTransport`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    /// Creates a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// [`AuditError::Webhook`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditError::Webhook(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, request: &WebhookRequest) -> Result<DeliveryStatus> {
        let response = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &request.signature)
            .header(TIMESTAMP_HEADER, request.timestamp.to_string())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| AuditError::Webhook(format!("delivery to {} failed: {e}", request.url)))?;

        let status = response.status();
        Ok(if status.is_success() {
            DeliveryStatus::Delivered
        } else if status.is_client_error() {
            DeliveryStatus::Rejected(status.as_u16())
        } else {
            DeliveryStatus::ServerError(status.as_u16())
        })
    }
}

/// Where and how to deliver high-risk events.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWebhookConfig")]
pub struct WebhookConfig {
    pub(crate) url: String,
    pub(crate) secret: String,
    pub(crate) retry: RetryConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWebhookConfig {
    url: String,
    secret: String,
    #[serde(default)]
    retry: RetryConfig,
}

impl TryFrom<RawWebhookConfig> for WebhookConfig {
    type Error = ConfigError;

    fn try_from(raw: RawWebhookConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder().url(raw.url).secret(raw.secret).retry(raw.retry).build()
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url)
            .field("secret", &"[REDACTED]")
            .field("retry", &self.retry)
            .finish()
    }
}

#[bon::bon]
impl WebhookConfig {
    /// Creates a validated webhook configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a non-HTTP(S) URL or an empty secret.
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(into)] secret: String,
        #[builder(default)] retry: RetryConfig,
    ) -> std::result::Result<Self, ConfigError> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::Invalid(format!("webhook url must be http(s): {url}")));
        }
        if secret.is_empty() {
            return Err(ConfigError::Invalid("webhook secret must not be empty".into()));
        }
        Ok(Self { url, secret, retry })
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Background task forwarding high-risk entries to a webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WebhookNotifier {
    /// Subscribes to `engine`'s high-risk channel and starts delivering.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn(
        engine: &AuditEngine,
        config: WebhookConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let mut events = engine.subscribe_high_risk();
        let clock = Arc::clone(&engine.inner.clock);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    () = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(entry) => entry,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "webhook notifier lagged; high-risk events skipped");
                            continue;
                        },
                        Err(RecvError::Closed) => break,
                    },
                };
                deliver_with_retry(&config, transport.as_ref(), clock.as_ref(), &entry).await;
            }
            tracing::debug!("webhook notifier stopped");
        });

        Self { cancel, handle: Some(handle) }
    }

    /// Stops the notifier after the in-flight delivery, if any.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "webhook notifier task panicked");
        }
    }
}

impl Drop for WebhookNotifier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tracing::instrument(skip_all, fields(event_id = %entry.id, url = %config.url))]
async fn deliver_with_retry(
    config: &WebhookConfig,
    transport: &dyn WebhookTransport,
    clock: &dyn Clock,
    entry: &AuditLogEntry,
) {
    let body = match serde_json::to_vec(&WebhookPayload::from(entry)) {
        Ok(body) => Bytes::from(body),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode webhook payload");
            return;
        },
    };

    let max_attempts = config.retry.max_retries().saturating_add(1);
    for attempt in 0..max_attempts {
        let timestamp = clock.now_secs();
        let signature = match sign_payload(config.secret.as_bytes(), timestamp, &body) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::error!(error = %err, "failed to sign webhook payload");
                return;
            },
        };
        let request = WebhookRequest {
            url: config.url.clone(),
            body: body.clone(),
            signature,
            timestamp,
            event_id: entry.id,
        };

        match transport.deliver(&request).await {
            Ok(DeliveryStatus::Delivered) => {
                tracing::debug!(attempt = attempt + 1, "webhook delivered");
                return;
            },
            Ok(DeliveryStatus::Rejected(status)) => {
                tracing::warn!(status, "webhook rejected by receiver; not retrying");
                return;
            },
            Ok(DeliveryStatus::ServerError(status)) => {
                tracing::warn!(status, attempt = attempt + 1, "webhook receiver error");
            },
            Err(err) => {
                tracing::warn!(error = %err, attempt = attempt + 1, "webhook transport error");
            },
        }

        if attempt + 1 < max_attempts {
            tokio::time::sleep(compute_backoff(&config.retry, attempt)).await;
        }
    }
    tracing::error!(attempts = max_attempts, "webhook delivery abandoned");
}
