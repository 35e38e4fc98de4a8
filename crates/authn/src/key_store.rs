//! Per-tenant signing key lifecycle.
//!
//! # Architecture
//!
//! ```text
//! rotate(tenant)  ──► generate pair ──► insert Pending ──► demote Active → Retiring
//!                                                       └─► promote Pending → Active
//! sign(claims)    ──► Active key of claims.tenant_id ──► record last_issued_exp
//! publish(tenant) ──► Pending + Active + unexpired Retiring public keys
//! expire_sweep()  ──► Retiring past deadline → Expired ──► dropped after grace
//! ```
//!
//! A retiring key's deadline is the latest `exp` it ever signed (or, if it
//! never signed, now plus the maximum token lifetime), plus the retirement
//! skew. Rotation therefore never invalidates a token that is still inside
//! its own lifetime.
//!
//! `rotate`, `sign` and `expire_sweep` take a per-tenant async lock, so
//! tenants never wait on each other.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warden_audit::{Actor, AuditSink, NewAuditEntry, NoopAuditSink, Outcome, Resource};
use warden_storage::{
    Clock, KeyAlgorithm, KeyId, KeyRecordStore, KeyState, SigningKeyRecord, StorageError,
    StorageResult, SystemClock, TenantId, Zeroizing,
};

use crate::{
    config::{KeyStoreConfig, to_chrono},
    error::KeyError,
    jwt::{self, TokenClaims},
    key_set_cache::KeySetSource,
    tenant_lock::TenantLocks,
};

/// PKCS#8 v1 prefix for a 32-byte Ed25519 private key.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// A freshly generated key pair.
pub struct GeneratedKeyPair {
    /// PKCS#8 DER private key, scrubbed on drop.
    pub private_der: Zeroizing<Vec<u8>>,
    /// Raw public key, base64url without padding.
    pub public_key: String,
}

impl GeneratedKeyPair {
    /// Encodes an Ed25519 signing key.
    #[must_use]
    pub fn from_signing_key(signing_key: &SigningKey) -> Self {
        let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let secret: Zeroizing<[u8; SECRET_KEY_LENGTH]> = Zeroizing::new(signing_key.to_bytes());
        let mut private_der = Zeroizing::new(Vec::with_capacity(48));
        private_der.extend_from_slice(&ED25519_PKCS8_PREFIX);
        private_der.extend_from_slice(&*secret);

        Self { private_der, public_key }
    }
}

impl fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("private_der", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Source of new key pairs.
pub trait KeyMaterialProvider: Send + Sync + fmt::Debug {
    /// Generates one Ed25519 key pair.
    ///
    /// # Errors
    ///
    /// [`KeyError::KeyGenerationError`] when no secure randomness is
    /// available.
    fn generate(&self) -> Result<GeneratedKeyPair, KeyError>;
}

/// Generates keys from the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRngKeyMaterial;

impl KeyMaterialProvider for OsRngKeyMaterial {
    fn generate(&self) -> Result<GeneratedKeyPair, KeyError> {
        let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| KeyError::KeyGenerationError(e.to_string()))?;
        Ok(GeneratedKeyPair::from_signing_key(&SigningKey::from_bytes(&seed)))
    }
}

/// One verification key in a published set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    /// Key id matched against token headers.
    pub key_id: KeyId,
    /// Signature algorithm.
    pub algorithm: KeyAlgorithm,
    /// Raw public key, base64url without padding.
    pub public_key: String,
    /// Verification deadline for a retiring key.
    pub expires_at: Option<DateTime<Utc>>,
}

impl PublishedKey {
    /// Returns `true` if the key may verify tokens at `now`.
    #[must_use]
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|deadline| now <= deadline)
    }
}

/// Immutable snapshot of a tenant's verification keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKeySet {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Published keys, oldest first.
    pub keys: Vec<PublishedKey>,
    /// When the snapshot was taken.
    pub fetched_at: DateTime<Utc>,
    /// How long the snapshot may be cached.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl PublishedKeySet {
    /// Keys with `kid` that may verify at `now`.
    pub fn keys_for<'a>(
        &'a self,
        kid: &'a KeyId,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a PublishedKey> + 'a {
        self.keys.iter().filter(move |k| &k.key_id == kid && k.usable_at(now))
    }

    /// Returns `true` if a usable key with `kid` is present.
    #[must_use]
    pub fn contains(&self, kid: &KeyId, now: DateTime<Utc>) -> bool {
        self.keys_for(kid, now).next().is_some()
    }
}

/// Outcome of one [`KeyStore::expire_sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySweepReport {
    /// Keys moved from `Retiring` to `Expired`.
    pub expired: usize,
    /// `Expired` keys deleted after the grace period.
    pub dropped: usize,
}

struct Inner {
    store: Arc<dyn KeyRecordStore>,
    config: KeyStoreConfig,
    provider: Arc<dyn KeyMaterialProvider>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    tenant_locks: TenantLocks,
}

/// Signing key lifecycle for every tenant.
///
/// Cloning is cheap; clones share the store and per-tenant locks.
///
/// ```no_run
/// use std::sync::Arc;
/// use warden_authn::KeyStore;
/// use warden_storage::{MemoryKeyRecordStore, TenantId};
///
/// # async fn example() -> Result<(), warden_authn::KeyError> {
/// let keys = KeyStore::builder().store(Arc::new(MemoryKeyRecordStore::new())).build();
/// let tenant = TenantId::from("acme");
/// let kid = keys.rotate(&tenant).await?;
/// let published = keys.publish(&tenant).await?;
/// assert_eq!(published.keys[0].key_id, kid);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("config", &self.inner.config)
            .field("provider", &self.inner.provider)
            .finish_non_exhaustive()
    }
}

fn new_key_id(now: DateTime<Utc>) -> KeyId {
    let suffix = Uuid::new_v4().simple().to_string();
    KeyId::new(format!("{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8]))
}

#[bon::bon]
impl KeyStore {
    /// Creates a key store.
    #[builder]
    pub fn new(
        store: Arc<dyn KeyRecordStore>,
        #[builder(default)] config: KeyStoreConfig,
        #[builder(default = Arc::new(OsRngKeyMaterial) as Arc<dyn KeyMaterialProvider>)]
        provider: Arc<dyn KeyMaterialProvider>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        #[builder(default = Arc::new(NoopAuditSink) as Arc<dyn AuditSink>)] audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                provider,
                clock,
                audit,
                tenant_locks: TenantLocks::new(),
            }),
        }
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &KeyStoreConfig {
        &self.inner.config
    }

    fn retirement_deadline(&self, key: &SigningKeyRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        let config = &self.inner.config;
        let outstanding = key
            .last_issued_exp
            .unwrap_or_else(|| now + to_chrono(config.max_token_lifetime))
            .max(now);
        outstanding + to_chrono(config.retirement_skew)
    }

    async fn emit(&self, action: &str, tenant_id: &TenantId, key_id: &str, outcome: Outcome) {
        self.inner
            .audit
            .record(
                NewAuditEntry::builder()
                    .actor(Actor::system("key_store"))
                    .action(action)
                    .resource(Resource::new("signing_key", key_id))
                    .outcome(outcome)
                    .build()
                    .with_metadata("tenant_id", tenant_id),
            )
            .await;
    }

    /// Generates a new key pair and makes it the tenant's `Active` key.
    ///
    /// The previous `Active` key becomes `Retiring` with a deadline that
    /// covers every token it signed.
    ///
    /// # Errors
    ///
    /// - [`KeyError::KeyGenerationError`] if the provider fails; nothing is written
    /// - [`KeyError::Storage`] if the store fails
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn rotate(&self, tenant_id: &TenantId) -> Result<KeyId, KeyError> {
        let _guard = self.inner.tenant_locks.lock(tenant_id).await;
        let now = self.inner.clock.now();

        let pair = match self.inner.provider.generate() {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(error = %err, "signing key generation failed");
                self.emit("key.rotate", tenant_id, "-", Outcome::Error).await;
                return Err(err);
            },
        };

        let key_id = new_key_id(now);
        let pending = SigningKeyRecord::builder()
            .tenant_id(tenant_id.clone())
            .key_id(key_id.clone())
            .private_der(pair.private_der)
            .public_key(pair.public_key)
            .state(KeyState::Pending)
            .created_at(now)
            .build();
        self.inner.store.insert(pending.clone()).await?;

        let previous: Vec<SigningKeyRecord> = self
            .inner
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|k| k.state == KeyState::Active && k.key_id != key_id)
            .collect();
        for mut old in previous {
            let deadline = self.retirement_deadline(&old, now);
            tracing::info!(kid = %old.key_id, expires_at = %deadline, "retiring signing key");
            old.state = KeyState::Retiring;
            old.expires_at = Some(deadline);
            self.inner.store.update(old).await?;
        }

        let mut active = pending;
        active.state = KeyState::Active;
        active.activated_at = Some(now);
        self.inner.store.update(active).await?;

        tracing::info!(kid = %key_id, "signing key activated");
        self.emit("key.rotate", tenant_id, key_id.as_str(), Outcome::Success).await;
        Ok(key_id)
    }

    /// Snapshot of the tenant's verification keys.
    ///
    /// Includes `Pending` and `Active` keys and `Retiring` keys whose
    /// deadline has not passed.
    ///
    /// # Errors
    ///
    /// [`KeyError::Storage`] if the store fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn publish(&self, tenant_id: &TenantId) -> Result<PublishedKeySet, KeyError> {
        let now = self.inner.clock.now();
        let keys = self
            .inner
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|k| match k.state {
                KeyState::Pending | KeyState::Active => true,
                KeyState::Retiring => k.verifies_at(now),
                KeyState::Expired => false,
            })
            .map(|k| PublishedKey {
                key_id: k.key_id,
                algorithm: k.algorithm,
                public_key: k.public_key,
                expires_at: if k.state == KeyState::Retiring { k.expires_at } else { None },
            })
            .collect();

        Ok(PublishedKeySet {
            tenant_id: tenant_id.clone(),
            keys,
            fetched_at: now,
            ttl: self.inner.config.published_ttl,
        })
    }

    /// Id of the tenant's `Active` key, if any.
    ///
    /// # Errors
    ///
    /// [`KeyError::Storage`] if the store fails.
    pub async fn active_key_id(&self, tenant_id: &TenantId) -> Result<Option<KeyId>, KeyError> {
        Ok(self
            .inner
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .find(|k| k.state == KeyState::Active)
            .map(|k| k.key_id))
    }

    /// Signs `claims` with the `Active` key of `claims.tenant_id`.
    ///
    /// # Errors
    ///
    /// - [`KeyError::NoActiveKey`] if the tenant was never rotated
    /// - [`KeyError::Signing`] if `exp` exceeds the maximum token lifetime or the key is unusable
    /// - [`KeyError::Storage`] if the store fails
    #[tracing::instrument(skip(self, claims), fields(tenant_id = %claims.tenant_id))]
    pub async fn sign(&self, claims: &TokenClaims) -> Result<String, KeyError> {
        let tenant_id = &claims.tenant_id;
        let now = self.inner.clock.now();
        let max_exp = now + to_chrono(self.inner.config.max_token_lifetime);
        let exp = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| KeyError::Signing(format!("exp {} is out of range", claims.exp)))?;
        if exp > max_exp {
            return Err(KeyError::Signing(format!(
                "exp {exp} exceeds the maximum token lifetime (latest {max_exp})"
            )));
        }

        let _guard = self.inner.tenant_locks.lock(tenant_id).await;

        let mut active = self
            .inner
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .find(|k| k.state == KeyState::Active)
            .ok_or_else(|| KeyError::NoActiveKey(tenant_id.clone()))?;
        let private_der = active
            .private_der
            .as_ref()
            .ok_or_else(|| KeyError::Signing(format!("key {} has no private material", active.key_id)))?;

        let token = jwt::sign(claims, &active.key_id, private_der)?;

        if Some(exp) > active.last_issued_exp {
            active.last_issued_exp = Some(exp);
            self.inner.store.update(active).await?;
        }
        Ok(token)
    }

    /// Expires retiring keys past their deadline and drops expired keys
    /// past the grace period.
    ///
    /// Expired keys lose their private material immediately.
    ///
    /// # Errors
    ///
    /// [`KeyError::Storage`] if the store fails; tenants already swept keep
    /// their changes.
    #[tracing::instrument(skip(self))]
    pub async fn expire_sweep(&self) -> Result<KeySweepReport, KeyError> {
        let now = self.inner.clock.now();
        let grace = to_chrono(self.inner.config.expired_grace_period);
        let mut report = KeySweepReport::default();

        for tenant_id in self.inner.store.tenants().await? {
            let _guard = self.inner.tenant_locks.lock(&tenant_id).await;

            for mut key in self.inner.store.list(&tenant_id).await? {
                match key.state {
                    KeyState::Retiring if key.expires_at.is_some_and(|deadline| now > deadline) => {
                        key.state = KeyState::Expired;
                        key.expired_at = Some(now);
                        key.private_der = None;
                        let kid = key.key_id.clone();
                        self.inner.store.update(key).await?;
                        tracing::info!(tenant_id = %tenant_id, kid = %kid, "signing key expired");
                        self.emit("key.expire", &tenant_id, kid.as_str(), Outcome::Success).await;
                        report.expired += 1;
                    },
                    KeyState::Expired
                        if key.expired_at.is_none_or(|expired_at| now > expired_at + grace) =>
                    {
                        self.inner.store.delete(&tenant_id, &key.key_id).await?;
                        tracing::debug!(tenant_id = %tenant_id, kid = %key.key_id, "expired signing key dropped");
                        report.dropped += 1;
                    },
                    _ => {},
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl KeySetSource for KeyStore {
    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet> {
        self.publish(tenant_id).await.map_err(|err| match err {
            KeyError::Storage(source) => source,
            other => StorageError::internal(other.to_string()),
        })
    }
}

/// Runs [`KeyStore::expire_sweep`] on a fixed interval.
#[derive(Debug)]
pub struct KeyExpirySweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl KeyExpirySweeper {
    /// Spawns the sweeper. The first sweep runs one `interval` from now.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn(keys: KeyStore, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("key expiry sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match keys.expire_sweep().await {
                            Ok(report) => tracing::debug!(
                                expired = report.expired,
                                dropped = report.dropped,
                                "key expiry sweep complete"
                            ),
                            Err(err) => tracing::error!(error = %err, "key expiry sweep failed"),
                        }
                    }
                }
            }
        });

        Self { cancel, handle: Some(handle) }
    }

    /// Stops the sweeper and waits for an in-progress sweep to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "key expiry sweeper task panicked");
        }
    }
}

impl Drop for KeyExpirySweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
