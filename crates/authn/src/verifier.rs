//! Bearer token verification.
//!
//! # Check order
//!
//! 1. Structure, algorithm and `kid` format, without trusting any claim
//! 2. Tenant binding: the token's `tenant_id` must equal the expected tenant
//! 3. Key lookup in the tenant's cached key set (one refetch on miss)
//! 4. Signature against every key published under the `kid`
//! 5. `exp` and `nbf` with clock-skew tolerance, then `iss` and `aud`
//!
//! Every outcome, success or failure, is reported to the [`AuditSink`] with
//! the caller's IP and user agent and whether it is a repeated failure for
//! the same subject.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use warden_audit::{Actor, ActorType, AuditSink, NewAuditEntry, NoopAuditSink, Outcome, Resource};
use warden_storage::{Clock, KeyId, SessionId, SubjectId, SystemClock, TenantId};

use crate::{
    config::VerifierConfig,
    error::{Result, VerificationError},
    jwt::{self, TokenClaims, UnverifiedToken},
    key_set_cache::{KeySetCache, KeySetCacheMetrics},
};

/// Risk floor applied to audit events for repeated failures.
pub const REPEATED_FAILURE_RISK_FLOOR: f64 = 0.8;

/// Network context of the request presenting the token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Client address.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Context with a client address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Context with a user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Identity established by a verified token. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    /// Tenant the token is bound to.
    pub tenant_id: TenantId,
    /// Authenticated subject.
    pub subject_id: SubjectId,
    /// Session the token belongs to, if any.
    pub session_id: Option<SessionId>,
    /// Permissions granted when the token was issued.
    pub permissions: Vec<String>,
    /// `iat`.
    pub issued_at: DateTime<Utc>,
    /// `exp`.
    pub expires_at: DateTime<Utc>,
    /// `jti`.
    pub token_id: Option<String>,
    /// Key that signed the token.
    pub key_id: KeyId,
}

impl VerifiedIdentity {
    fn from_claims(claims: TokenClaims, key_id: KeyId) -> Result<Self> {
        let timestamp = |name: &str, secs: i64| {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| VerificationError::malformed(format!("{name} out of range")))
        };
        Ok(Self {
            issued_at: timestamp("iat", claims.iat)?,
            expires_at: timestamp("exp", claims.exp)?,
            tenant_id: claims.tenant_id,
            subject_id: SubjectId::from(claims.sub),
            session_id: claims.sid,
            permissions: claims.permissions,
            token_id: claims.jti,
            key_id,
        })
    }
}

/// Point-in-time copy of the verifier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifierMetrics {
    /// Verification attempts.
    pub verifications: u64,
    /// Attempts that produced an identity.
    pub successes: u64,
    /// Attempts rejected for a token problem.
    pub failures: u64,
    /// Attempts that could not be evaluated.
    pub unavailable: u64,
    /// Key set cache counters.
    pub cache: KeySetCacheMetrics,
}

#[derive(Default)]
struct Counters {
    verifications: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    unavailable: AtomicU64,
}

/// Verifies bearer tokens against per-tenant key sets.
pub struct TokenVerifier {
    cache: Arc<KeySetCache>,
    config: VerifierConfig,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    failures: Cache<String, u32>,
    counters: Counters,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl TokenVerifier {
    /// Creates a verifier.
    #[builder]
    pub fn new(
        cache: Arc<KeySetCache>,
        #[builder(default)] config: VerifierConfig,
        #[builder(default = Arc::new(NoopAuditSink) as Arc<dyn AuditSink>)] audit: Arc<dyn AuditSink>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Self {
        let failures = Cache::builder()
            .max_capacity(config.max_tracked_subjects)
            .time_to_live(config.repeated_failure_window)
            .build();
        Self { cache, config, audit, clock, failures, counters: Counters::default() }
    }

    /// The underlying key set cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<KeySetCache> {
        &self.cache
    }

    /// Verifies `token` for `expected_tenant` and `expected_audience`.
    ///
    /// # Errors
    ///
    /// Any [`VerificationError`]; the request must be rejected with
    /// [`VerificationError::client_message`].
    pub async fn verify(
        &self,
        token: &str,
        expected_tenant: &TenantId,
        expected_audience: &str,
    ) -> Result<VerifiedIdentity> {
        self.verify_with_context(token, expected_tenant, expected_audience, &RequestContext::default())
            .await
    }

    /// [`verify`](Self::verify) with the caller's network context for the
    /// audit trail.
    ///
    /// # Errors
    ///
    /// Any [`VerificationError`].
    #[tracing::instrument(
        skip(self, token, context),
        fields(tenant_id = %expected_tenant, audience = %expected_audience)
    )]
    pub async fn verify_with_context(
        &self,
        token: &str,
        expected_tenant: &TenantId,
        expected_audience: &str,
        context: &RequestContext,
    ) -> Result<VerifiedIdentity> {
        let started = Instant::now();
        self.counters.verifications.fetch_add(1, Ordering::Relaxed);

        let (unverified, result) = match jwt::parse_unverified(token) {
            Ok(unverified) => {
                let result = self.check(token, &unverified, expected_tenant, expected_audience).await;
                (Some(unverified), result)
            },
            Err(err) => (None, Err(err)),
        };

        self.report(unverified.as_ref(), expected_tenant, context, &result).await;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "token verification finished"
        );
        result
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> VerifierMetrics {
        VerifierMetrics {
            verifications: self.counters.verifications.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            cache: self.cache.metrics(),
        }
    }

    async fn check(
        &self,
        token: &str,
        unverified: &UnverifiedToken,
        expected_tenant: &TenantId,
        expected_audience: &str,
    ) -> Result<VerifiedIdentity> {
        if &unverified.claims.tenant_id != expected_tenant {
            return Err(VerificationError::TenantMismatch {
                expected: expected_tenant.clone(),
                actual: unverified.claims.tenant_id.to_string(),
            });
        }

        let keys = self.cache.lookup(expected_tenant, &unverified.kid).await?;
        let mut verified = None;
        for key in &keys {
            match jwt::verify_signature(token, key) {
                Ok(claims) => {
                    verified = Some(claims);
                    break;
                },
                Err(VerificationError::SignatureMismatch) => {},
                Err(err) => return Err(err),
            }
        }
        let claims = verified.ok_or(VerificationError::SignatureMismatch)?;

        let now = self.clock.now_secs();
        let skew = i64::try_from(self.config.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if now > claims.exp.saturating_add(skew) {
            return Err(VerificationError::Expired);
        }
        if let Some(nbf) = claims.nbf
            && nbf > now.saturating_add(skew)
        {
            return Err(VerificationError::NotYetValid);
        }
        if claims.iss != self.config.issuer {
            return Err(VerificationError::IssuerMismatch {
                expected: self.config.issuer.clone(),
                actual: claims.iss,
            });
        }
        if claims.aud != expected_audience {
            return Err(VerificationError::AudienceMismatch {
                expected: expected_audience.to_owned(),
                actual: claims.aud,
            });
        }

        VerifiedIdentity::from_claims(claims, unverified.kid.clone())
    }

    async fn report(
        &self,
        unverified: Option<&UnverifiedToken>,
        expected_tenant: &TenantId,
        context: &RequestContext,
        result: &Result<VerifiedIdentity>,
    ) {
        let subject = unverified.map(|u| u.claims.sub.as_str());
        let failure_key = subject.map(|sub| format!("{expected_tenant}/{sub}"));

        let mut actor = match subject {
            Some(sub) => Actor::new(sub, ActorType::User),
            None => Actor::new("unknown", ActorType::Anonymous),
        };
        actor.ip.clone_from(&context.ip);
        actor.user_agent.clone_from(&context.user_agent);

        let token_id = unverified.and_then(|u| u.claims.jti.as_deref()).unwrap_or("unknown");
        let builder = NewAuditEntry::builder()
            .actor(actor)
            .action("token.verify")
            .resource(Resource::new("token", token_id));

        let event = match result {
            Ok(identity) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                if let Some(key) = &failure_key {
                    self.failures.invalidate(key).await;
                }
                builder
                    .outcome(Outcome::Success)
                    .build()
                    .with_metadata("tenant_id", expected_tenant)
                    .with_metadata("kid", &identity.key_id)
            },
            Err(err) if err.is_unavailable() => {
                self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "token could not be verified");
                builder
                    .outcome(Outcome::Error)
                    .build()
                    .with_metadata("tenant_id", expected_tenant)
                    .with_metadata("error_kind", err.kind())
            },
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let count = match &failure_key {
                    Some(key) => self
                        .failures
                        .entry_by_ref(key)
                        .and_upsert_with(|current| {
                            let count = current.map_or(1, |e| e.into_value().saturating_add(1));
                            std::future::ready(count)
                        })
                        .await
                        .into_value(),
                    None => 1,
                };
                let repeated = count >= self.config.repeated_failure_threshold;
                if repeated {
                    tracing::warn!(
                        subject = subject.unwrap_or("unknown"),
                        failure_count = count,
                        kind = %err.kind(),
                        "repeated token verification failure"
                    );
                } else {
                    tracing::debug!(kind = %err.kind(), error = %err, "token rejected");
                }
                builder
                    .outcome(Outcome::Failure)
                    .maybe_risk_floor(repeated.then_some(REPEATED_FAILURE_RISK_FLOOR))
                    .build()
                    .with_metadata("tenant_id", expected_tenant)
                    .with_metadata("error_kind", err.kind())
                    .with_metadata("repeated_failure", repeated)
                    .with_metadata("failure_count", count)
            },
        };

        self.audit.record(event).await;
    }
}
