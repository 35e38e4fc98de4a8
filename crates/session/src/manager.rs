//! Session issuance, refresh rotation and revocation.
//!
//! # Refresh rotation
//!
//! ```text
//! refresh(R) ──► hash(R) ──► session lookup
//!                  │
//!                  ├─ revoked ───────────────────► SessionRevoked
//!                  ├─ current hash ──► expired? ─► SessionExpired
//!                  │                └► sign A', CAS(version) ─► (A', R')
//!                  │                              └ conflict ─► re-evaluate
//!                  ├─ rotated within window ─────► revoke + high-risk event ─► ReuseDetected
//!                  │                                └ revoke failed ─► Storage
//!                  └─ no match ──────────────────► InvalidRefreshToken
//! ```
//!
//! Every write is a compare-and-swap on the session's version, so two
//! refreshes racing with the same token cannot both rotate: the loser
//! re-reads, finds its token among the superseded hashes, and is treated
//! as a reuse.
//!
//! Revocation writes are retried on transient store failures. If a reused
//! session still cannot be revoked, the high-risk event is emitted anyway
//! and the caller gets the storage error rather than `ReuseDetected`.
//!
//! Only the SHA-256 of a refresh token is stored.

use std::{fmt, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use fail::fail_point;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use warden_audit::{Actor, ActorType, AuditSink, NewAuditEntry, NoopAuditSink, Outcome, Resource};
use warden_authn::{KeyStore, RequestContext, TokenClaims, VerifiedIdentity};
use warden_storage::{
    Clock, RotatedRefreshHash, SessionId, SessionRecord, SessionStore, StorageError, StorageResult,
    SubjectId, SystemClock, TenantId, with_retry,
};

use crate::{
    config::SessionConfig,
    error::{Result, SessionError},
};

/// Risk floor of the event emitted when a superseded refresh token is used.
pub const REUSE_RISK_FLOOR: f64 = 1.0;

/// Revocation reason recorded when reuse is detected.
pub const REUSE_REVOCATION_REASON: &str = "refresh_token_reuse";

const REFRESH_TOKEN_BYTES: usize = 32;

/// A freshly issued access/refresh pair.
#[derive(Clone)]
pub struct IssuedTokens {
    /// Signed access token for the `Authorization` header.
    pub access_token: String,
    /// Opaque refresh token; only its hash is stored.
    pub refresh_token: String,
    /// `exp` of the access token.
    pub access_token_expires_at: DateTime<Utc>,
    /// The session after this issue or refresh.
    pub session: SessionRecord,
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("session_id", &self.session.session_id)
            .finish()
    }
}

/// Hex SHA-256 of a refresh token, as stored in the session record.
#[must_use]
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn new_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Owns the access/refresh pairing of every session.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    keys: KeyStore,
    config: SessionConfig,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl SessionManager {
    /// Creates a session manager.
    #[builder]
    pub fn new(
        store: Arc<dyn SessionStore>,
        key_store: KeyStore,
        #[builder(default)] config: SessionConfig,
        #[builder(default = Arc::new(NoopAuditSink) as Arc<dyn AuditSink>)] audit: Arc<dyn AuditSink>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, keys: key_store, config, audit, clock }
    }

    /// The manager configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a session with no permissions snapshot.
    ///
    /// # Errors
    ///
    /// See [`issue_with_permissions`](Self::issue_with_permissions).
    pub async fn issue(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
        auth_method: &str,
    ) -> Result<IssuedTokens> {
        self.issue_with_permissions(tenant_id, subject_id, auth_method, Vec::new()).await
    }

    /// Starts a session whose access tokens carry `permissions`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Signing`] if the tenant has no active key
    /// - [`SessionError::Storage`] if the session cannot be stored
    #[tracing::instrument(skip(self, permissions), fields(tenant_id = %tenant_id, subject_id = %subject_id))]
    pub async fn issue_with_permissions(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
        auth_method: &str,
        permissions: Vec<String>,
    ) -> Result<IssuedTokens> {
        let now = self.clock.now();
        let session_id = SessionId::new(Uuid::new_v4().to_string());
        let expires_at = now + to_chrono(self.config.session_ttl());
        let refresh_token = new_refresh_token();

        let mut record = SessionRecord {
            session_id,
            tenant_id: tenant_id.clone(),
            subject_id: subject_id.clone(),
            access_token_id: String::new(),
            refresh_token_hash: hash_refresh_token(&refresh_token),
            previous_refresh_hashes: Vec::new(),
            auth_method: auth_method.to_owned(),
            permissions,
            created_at: now,
            last_activity_at: now,
            expires_at,
            revoked_at: None,
            revoked_reason: None,
            version: 0,
        };
        let (access_token, jti, access_token_expires_at) = self.sign_access(&record, now).await?;
        record.access_token_id = jti;
        self.store.create(record.clone()).await?;

        tracing::info!(session_id = %record.session_id, "session issued");
        self.emit(
            self.event(&record, "session.issue", Outcome::Success, None)
                .with_metadata("auth_method", auth_method),
        )
        .await;

        Ok(IssuedTokens { access_token, refresh_token, access_token_expires_at, session: record })
    }

    /// Rotates a refresh token.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidRefreshToken`] if the token matches no session
    /// - [`SessionError::ReuseDetected`] if the token was already rotated; the session is revoked
    /// - [`SessionError::Storage`] if the token was already rotated but revoking the session failed
    /// - [`SessionError::SessionRevoked`] / [`SessionError::SessionExpired`] for a dead session
    /// - [`SessionError::Signing`] / [`SessionError::Storage`] for dependency failures
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens> {
        self.refresh_with_context(refresh_token, &RequestContext::default()).await
    }

    /// [`refresh`](Self::refresh) with the caller's network context for the
    /// audit trail.
    ///
    /// # Errors
    ///
    /// See [`refresh`](Self::refresh).
    #[tracing::instrument(skip(self, refresh_token, context))]
    pub async fn refresh_with_context(
        &self,
        refresh_token: &str,
        context: &RequestContext,
    ) -> Result<IssuedTokens> {
        let presented = hash_refresh_token(refresh_token);

        loop {
            let Some(record) = self.store.find_by_refresh_hash(&presented).await? else {
                let mut actor = Actor::new("unknown", ActorType::Anonymous);
                actor.ip.clone_from(&context.ip);
                actor.user_agent.clone_from(&context.user_agent);
                self.emit(
                    NewAuditEntry::builder()
                        .actor(actor)
                        .action("session.refresh")
                        .resource(Resource::new("session", "unknown"))
                        .outcome(Outcome::Failure)
                        .build()
                        .with_metadata("error_kind", "invalid_refresh_token"),
                )
                .await;
                return Err(SessionError::InvalidRefreshToken);
            };
            let now = self.clock.now();

            if record.is_revoked() {
                return Err(self
                    .reject(&record, context, SessionError::SessionRevoked {
                        session_id: record.session_id.clone(),
                    })
                    .await);
            }

            if hashes_match(&presented, &record.refresh_token_hash) {
                if now >= record.expires_at {
                    return Err(self
                        .reject(&record, context, SessionError::SessionExpired {
                            session_id: record.session_id.clone(),
                        })
                        .await);
                }

                let new_refresh = new_refresh_token();
                let (access_token, jti, access_token_expires_at) =
                    self.sign_access(&record, now).await?;

                let mut next = record.clone();
                next.previous_refresh_hashes
                    .push(RotatedRefreshHash { hash: record.refresh_token_hash.clone(), rotated_at: now });
                self.prune(&mut next.previous_refresh_hashes, now);
                next.refresh_token_hash = hash_refresh_token(&new_refresh);
                next.access_token_id = jti;
                next.last_activity_at = now;

                fail_point!("session-refresh-cas", |_| {
                    Err(SessionError::Storage(StorageError::connection("injected refresh failure")))
                });

                match self.store.compare_and_swap(record.version, next).await {
                    Ok(stored) => {
                        tracing::debug!(session_id = %stored.session_id, version = stored.version, "refresh token rotated");
                        self.emit(self.event_with_context(&stored, "session.refresh", Outcome::Success, context))
                            .await;
                        return Ok(IssuedTokens {
                            access_token,
                            refresh_token: new_refresh,
                            access_token_expires_at,
                            session: stored,
                        });
                    },
                    Err(StorageError::Conflict { .. }) => {
                        tracing::debug!(session_id = %record.session_id, "refresh lost a race, re-evaluating");
                        continue;
                    },
                    Err(err) => return Err(err.into()),
                }
            }

            let window = to_chrono(self.config.reuse_detection_window());
            let recently_rotated = record
                .previous_refresh_hashes
                .iter()
                .any(|r| hashes_match(&presented, &r.hash) && now <= r.rotated_at + window);
            if recently_rotated {
                return Err(self.handle_reuse(&record, context).await);
            }

            return Err(self.reject(&record, context, SessionError::InvalidRefreshToken).await);
        }
    }

    /// Revokes a session. Idempotent: revoking twice keeps the first
    /// timestamp and reason and emits one event.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if the session does not exist
    /// - [`SessionError::Storage`] if the store fails
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn revoke(&self, session_id: &SessionId, reason: &str) -> Result<SessionRecord> {
        let (record, newly) = self.mark_revoked(session_id, reason).await?;
        if newly {
            self.emit(
                self.event(&record, "session.revoke", Outcome::Success, None)
                    .with_metadata("reason", reason),
            )
            .await;
        }
        Ok(record)
    }

    /// Revokes every live session of a subject. Returns how many were
    /// revoked by this call.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] if the store fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, subject_id = %subject_id))]
    pub async fn revoke_all(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
        reason: &str,
    ) -> Result<usize> {
        let mut revoked = 0;
        for session in self.store.list_for_subject(tenant_id, subject_id).await? {
            if session.is_revoked() {
                continue;
            }
            let (record, newly) = self.mark_revoked(&session.session_id, reason).await?;
            if newly {
                revoked += 1;
                self.emit(
                    self.event(&record, "session.revoke", Outcome::Success, None)
                        .with_metadata("reason", reason),
                )
                .await;
            }
        }
        Ok(revoked)
    }

    /// Fetches a session.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the session does not exist.
    pub async fn get(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Records activity on a live session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::SessionRevoked`] / [`SessionError::SessionExpired`] for a dead session
    /// - [`SessionError::NotFound`] / [`SessionError::Storage`]
    pub async fn touch(&self, session_id: &SessionId) -> Result<SessionRecord> {
        loop {
            let record = self.get(session_id).await?;
            let now = self.clock.now();
            Self::ensure_live(&record, now)?;

            let mut next = record.clone();
            next.last_activity_at = now;
            match self.store.compare_and_swap(record.version, next).await {
                Ok(stored) => return Ok(stored),
                Err(StorageError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Checks that the session behind a verified token is still live.
    ///
    /// Returns `None` for tokens not bound to a session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::SessionRevoked`] / [`SessionError::SessionExpired`] for a dead session
    /// - [`SessionError::NotFound`] if the session is unknown or belongs to another subject
    pub async fn ensure_active(&self, identity: &VerifiedIdentity) -> Result<Option<SessionRecord>> {
        let Some(session_id) = &identity.session_id else {
            return Ok(None);
        };
        let record = self.get(session_id).await?;
        if record.tenant_id != identity.tenant_id || record.subject_id != identity.subject_id {
            tracing::warn!(session_id = %session_id, "token session bound to another subject");
            return Err(SessionError::NotFound(session_id.clone()));
        }
        Self::ensure_live(&record, self.clock.now())?;
        Ok(Some(record))
    }

    fn ensure_live(record: &SessionRecord, now: DateTime<Utc>) -> Result<()> {
        if record.is_revoked() {
            return Err(SessionError::SessionRevoked { session_id: record.session_id.clone() });
        }
        if now >= record.expires_at {
            return Err(SessionError::SessionExpired { session_id: record.session_id.clone() });
        }
        Ok(())
    }

    async fn sign_access(
        &self,
        record: &SessionRecord,
        now: DateTime<Utc>,
    ) -> Result<(String, String, DateTime<Utc>)> {
        let expires_at = (now + to_chrono(self.config.access_token_ttl())).min(record.expires_at);
        let jti = Uuid::new_v4().to_string();
        let claims = TokenClaims {
            iss: self.keys.config().issuer().to_owned(),
            sub: record.subject_id.to_string(),
            aud: self.config.audience().to_owned(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            nbf: None,
            jti: Some(jti.clone()),
            tenant_id: record.tenant_id.clone(),
            sid: Some(record.session_id.clone()),
            permissions: record.permissions.clone(),
        };
        let token = self.keys.sign(&claims).await?;
        Ok((token, jti, expires_at))
    }

    fn prune(&self, hashes: &mut Vec<RotatedRefreshHash>, now: DateTime<Utc>) {
        let window = to_chrono(self.config.reuse_detection_window());
        hashes.retain(|r| now <= r.rotated_at + window);
        let max = self.config.max_previous_hashes();
        if hashes.len() > max {
            let excess = hashes.len() - max;
            hashes.drain(..excess);
        }
    }

    /// Revokes `session_id`, retrying transient store failures. The flag is
    /// `true` if this call did the revoking.
    async fn mark_revoked(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<(SessionRecord, bool)> {
        with_retry(self.config.revoke_retry(), "revoke_session", || {
            self.try_mark_revoked(session_id, reason)
        })
        .await?
        .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    async fn try_mark_revoked(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> StorageResult<Option<(SessionRecord, bool)>> {
        loop {
            let Some(record) = self.store.get(session_id).await? else {
                return Ok(None);
            };
            if record.is_revoked() {
                return Ok(Some((record, false)));
            }
            let mut next = record.clone();
            next.revoked_at = Some(self.clock.now());
            next.revoked_reason = Some(reason.to_owned());

            fail_point!("session-revoke-cas", |_| {
                Err(StorageError::connection("injected revoke failure"))
            });

            match self.store.compare_and_swap(record.version, next).await {
                Ok(stored) => {
                    tracing::info!(session_id = %session_id, reason, "session revoked");
                    return Ok(Some((stored, true)));
                },
                Err(StorageError::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn handle_reuse(&self, record: &SessionRecord, context: &RequestContext) -> SessionError {
        tracing::warn!(
            session_id = %record.session_id,
            tenant_id = %record.tenant_id,
            subject_id = %record.subject_id,
            "refresh token reuse detected, revoking session"
        );
        let revoked = self.mark_revoked(&record.session_id, REUSE_REVOCATION_REASON).await;

        let mut actor = Actor::new(record.subject_id.as_str(), ActorType::User);
        actor.ip.clone_from(&context.ip);
        actor.user_agent.clone_from(&context.user_agent);
        self.emit(
            NewAuditEntry::builder()
                .actor(actor)
                .action("session.reuse_detected")
                .resource(Resource::new("session", record.session_id.as_str()))
                .outcome(Outcome::Failure)
                .risk_floor(REUSE_RISK_FLOOR)
                .build()
                .with_metadata("tenant_id", &record.tenant_id)
                .with_metadata("reason", REUSE_REVOCATION_REASON)
                .with_metadata("revoked", revoked.is_ok()),
        )
        .await;

        match revoked {
            Ok(_) => SessionError::ReuseDetected { session_id: record.session_id.clone() },
            Err(err) => {
                tracing::error!(
                    session_id = %record.session_id,
                    error = %err,
                    "reused session could not be revoked"
                );
                err
            },
        }
    }

    async fn reject(
        &self,
        record: &SessionRecord,
        context: &RequestContext,
        err: SessionError,
    ) -> SessionError {
        tracing::debug!(session_id = %record.session_id, kind = %err.kind(), "refresh rejected");
        self.emit(
            self.event_with_context(record, "session.refresh", Outcome::Failure, context)
                .with_metadata("error_kind", err.kind()),
        )
        .await;
        err
    }

    fn event(
        &self,
        record: &SessionRecord,
        action: &str,
        outcome: Outcome,
        context: Option<&RequestContext>,
    ) -> NewAuditEntry {
        let mut actor = Actor::new(record.subject_id.as_str(), ActorType::User);
        if let Some(context) = context {
            actor.ip.clone_from(&context.ip);
            actor.user_agent.clone_from(&context.user_agent);
        }
        NewAuditEntry::builder()
            .actor(actor)
            .action(action)
            .resource(Resource::new("session", record.session_id.as_str()))
            .outcome(outcome)
            .build()
            .with_metadata("tenant_id", &record.tenant_id)
    }

    fn event_with_context(
        &self,
        record: &SessionRecord,
        action: &str,
        outcome: Outcome,
        context: &RequestContext,
    ) -> NewAuditEntry {
        self.event(record, action, outcome, Some(context))
    }

    async fn emit(&self, event: NewAuditEntry) {
        self.audit.record(event).await;
    }
}
