//! Signing key records and their persistence contract.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐   rotate   ┌────────┐  next rotate  ┌──────────┐  sweep   ┌─────────┐
//! │ Pending │──────────►│ Active │─────────────►│ Retiring │────────►│ Expired │──► dropped
//! └─────────┘           └────────┘               └──────────┘         └─────────┘   after grace
//! ```
//!
//! At most one key per tenant and algorithm is `Active`. A `Retiring` key
//! still verifies tokens until its `expires_at`, so rotation never cuts off
//! tokens that are still within their lifetime.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    error::{StorageError, StorageResult},
    types::{KeyId, TenantId},
};

/// Lifecycle state of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// Generated but not yet used for signing.
    Pending,
    /// Signs new tokens and verifies existing ones.
    Active,
    /// Verifies existing tokens until `expires_at`; never signs.
    Retiring,
    /// No longer published; removed after the grace period.
    Expired,
}

impl KeyState {
    /// Returns `true` if keys in this state appear in the published key set.
    #[must_use]
    pub fn is_published(self) -> bool {
        !matches!(self, Self::Expired)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Retiring => write!(f, "retiring"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Signature algorithm of a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519 signatures (JWS `EdDSA`).
    EdDSA,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EdDSA => write!(f, "EdDSA"),
        }
    }
}

/// A tenant's signing key pair plus lifecycle metadata.
///
/// `private_der` holds the PKCS#8 DER private key and is scrubbed on drop.
/// It is present only on the issuing side; records reconstructed from a
/// published key set carry `None`.
#[derive(Clone, bon::Builder)]
pub struct SigningKeyRecord {
    /// Owning tenant.
    #[builder(into)]
    pub tenant_id: TenantId,
    /// Identifier carried in token headers as `kid`.
    #[builder(into)]
    pub key_id: KeyId,
    /// Signature algorithm.
    #[builder(default = KeyAlgorithm::EdDSA)]
    pub algorithm: KeyAlgorithm,
    /// PKCS#8 DER private key.
    pub private_der: Option<Zeroizing<Vec<u8>>>,
    /// Raw 32-byte Ed25519 public key, base64url without padding.
    #[builder(into)]
    pub public_key: String,
    /// Current lifecycle state.
    #[builder(default = KeyState::Pending)]
    pub state: KeyState,
    /// When the key pair was generated.
    pub created_at: DateTime<Utc>,
    /// When the key became `Active`.
    pub activated_at: Option<DateTime<Utc>>,
    /// Verification deadline; set when the key starts retiring.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the key moved to `Expired`.
    pub expired_at: Option<DateTime<Utc>>,
    /// Latest `exp` of any token signed with this key.
    pub last_issued_exp: Option<DateTime<Utc>>,
}

impl SigningKeyRecord {
    /// Returns `true` if tokens signed by this key may still verify at `now`.
    #[must_use]
    pub fn verifies_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            KeyState::Active => true,
            KeyState::Retiring => self.expires_at.is_none_or(|exp| now <= exp),
            KeyState::Pending | KeyState::Expired => false,
        }
    }
}

impl fmt::Debug for SigningKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyRecord")
            .field("tenant_id", &self.tenant_id)
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("private_der", &self.private_der.as_ref().map(|_| "[REDACTED]"))
            .field("public_key", &self.public_key)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("activated_at", &self.activated_at)
            .field("expires_at", &self.expires_at)
            .field("expired_at", &self.expired_at)
            .field("last_issued_exp", &self.last_issued_exp)
            .finish()
    }
}

/// Persistence for signing key records.
///
/// Keys are addressed by `(tenant_id, key_id)`. Implementations must make
/// each call atomic; multi-record consistency (demote old key, activate new
/// key) is the caller's job and is serialized per tenant.
#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the key id is taken.
    async fn insert(&self, record: SigningKeyRecord) -> StorageResult<()>;

    /// Fetches one record.
    async fn get(&self, tenant_id: &TenantId, key_id: &KeyId)
    -> StorageResult<Option<SigningKeyRecord>>;

    /// Lists every record for a tenant, in creation order.
    async fn list(&self, tenant_id: &TenantId) -> StorageResult<Vec<SigningKeyRecord>>;

    /// Replaces an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the record does not exist.
    async fn update(&self, record: SigningKeyRecord) -> StorageResult<()>;

    /// Removes a record. Removing a missing record is not an error.
    async fn delete(&self, tenant_id: &TenantId, key_id: &KeyId) -> StorageResult<()>;

    /// Lists every tenant that owns at least one record.
    async fn tenants(&self) -> StorageResult<Vec<TenantId>>;
}

#[async_trait]
impl<S: KeyRecordStore + ?Sized> KeyRecordStore for Arc<S> {
    async fn insert(&self, record: SigningKeyRecord) -> StorageResult<()> {
        (**self).insert(record).await
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
    ) -> StorageResult<Option<SigningKeyRecord>> {
        (**self).get(tenant_id, key_id).await
    }

    async fn list(&self, tenant_id: &TenantId) -> StorageResult<Vec<SigningKeyRecord>> {
        (**self).list(tenant_id).await
    }

    async fn update(&self, record: SigningKeyRecord) -> StorageResult<()> {
        (**self).update(record).await
    }

    async fn delete(&self, tenant_id: &TenantId, key_id: &KeyId) -> StorageResult<()> {
        (**self).delete(tenant_id, key_id).await
    }

    async fn tenants(&self) -> StorageResult<Vec<TenantId>> {
        (**self).tenants().await
    }
}

fn record_key(tenant_id: &TenantId, key_id: &KeyId) -> String {
    format!("tenant:{tenant_id}/kid:{key_id}")
}

/// In-memory [`KeyRecordStore`] for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyRecordStore {
    keys: Arc<RwLock<HashMap<TenantId, Vec<SigningKeyRecord>>>>,
}

impl MemoryKeyRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().values().map(Vec::len).sum()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyRecordStore for MemoryKeyRecordStore {
    #[tracing::instrument(skip(self, record), fields(tenant_id = %record.tenant_id, kid = %record.key_id))]
    async fn insert(&self, record: SigningKeyRecord) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let tenant_keys = keys.entry(record.tenant_id.clone()).or_default();
        if tenant_keys.iter().any(|k| k.key_id == record.key_id) {
            return Err(StorageError::already_exists(record_key(
                &record.tenant_id,
                &record.key_id,
            )));
        }
        tenant_keys.push(record);
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
    ) -> StorageResult<Option<SigningKeyRecord>> {
        let keys = self.keys.read();
        Ok(keys
            .get(tenant_id)
            .and_then(|tenant_keys| tenant_keys.iter().find(|k| &k.key_id == key_id))
            .cloned())
    }

    async fn list(&self, tenant_id: &TenantId) -> StorageResult<Vec<SigningKeyRecord>> {
        fail_point!("key-store-list", |_| {
            Err(StorageError::connection("injected key store outage"))
        });
        let keys = self.keys.read();
        Ok(keys.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn update(&self, record: SigningKeyRecord) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let slot = keys
            .get_mut(&record.tenant_id)
            .and_then(|tenant_keys| tenant_keys.iter_mut().find(|k| k.key_id == record.key_id));
        match slot {
            Some(existing) => {
                *existing = record;
                Ok(())
            },
            None => Err(StorageError::not_found(record_key(&record.tenant_id, &record.key_id))),
        }
    }

    async fn delete(&self, tenant_id: &TenantId, key_id: &KeyId) -> StorageResult<()> {
        let mut keys = self.keys.write();
        if let Some(tenant_keys) = keys.get_mut(tenant_id) {
            tenant_keys.retain(|k| &k.key_id != key_id);
            if tenant_keys.is_empty() {
                keys.remove(tenant_id);
            }
        }
        Ok(())
    }

    async fn tenants(&self) -> StorageResult<Vec<TenantId>> {
        let mut tenants: Vec<TenantId> = self.keys.read().keys().cloned().collect();
        tenants.sort();
        Ok(tenants)
    }
}
