//! Shared test utilities for key lifecycle and verification tests.
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! warden-authn = { workspace = true, features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use warden_authn::testutil::{generate_test_keypair, test_claims};
//! ```

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand_core::OsRng;
use uuid::Uuid;
use warden_storage::{KeyAlgorithm, KeyId, StorageError, StorageResult, TenantId};

use crate::{
    config::DEFAULT_ISSUER,
    error::KeyError,
    jwt::TokenClaims,
    key_set_cache::KeySetSource,
    key_store::{GeneratedKeyPair, KeyMaterialProvider, PublishedKey, PublishedKeySet},
};

/// Issuer used by [`test_claims`]; matches the default verifier config.
pub const TEST_ISSUER: &str = DEFAULT_ISSUER;

/// Audience used by [`test_claims`].
pub const TEST_AUDIENCE: &str = "api";

/// Generates a fresh Ed25519 key pair.
#[must_use]
pub fn generate_test_keypair() -> GeneratedKeyPair {
    GeneratedKeyPair::from_signing_key(&SigningKey::generate(&mut OsRng))
}

/// Claims with [`TEST_ISSUER`], [`TEST_AUDIENCE`], a random `jti` and one
/// permission.
#[must_use]
pub fn test_claims(tenant_id: &str, sub: &str, iat: i64, exp: i64) -> TokenClaims {
    TokenClaims {
        iss: TEST_ISSUER.to_owned(),
        sub: sub.to_owned(),
        aud: TEST_AUDIENCE.to_owned(),
        exp,
        iat,
        nbf: None,
        jti: Some(Uuid::new_v4().to_string()),
        tenant_id: TenantId::from(tenant_id),
        sid: None,
        permissions: vec!["documents:read".to_owned()],
    }
}

/// Builds `{header}.{payload}.` with an empty signature, for attack tests
/// (`alg: none`, algorithm confusion, forged `kid`).
#[must_use]
pub fn craft_raw_token(header: &serde_json::Value, payload: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header_b64}.{payload_b64}.")
}

/// A published set with one freshly generated key per `kid` and a
/// five-minute TTL.
#[must_use]
pub fn published_set(tenant_id: &str, kids: &[&str], fetched_at: DateTime<Utc>) -> PublishedKeySet {
    PublishedKeySet {
        tenant_id: TenantId::from(tenant_id),
        keys: kids
            .iter()
            .map(|kid| PublishedKey {
                key_id: KeyId::from(*kid),
                algorithm: KeyAlgorithm::EdDSA,
                public_key: generate_test_keypair().public_key,
                expires_at: None,
            })
            .collect(),
        fetched_at,
        ttl: Duration::from_secs(300),
    }
}

/// [`KeyMaterialProvider`] whose randomness source is always unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingKeyMaterial;

impl KeyMaterialProvider for FailingKeyMaterial {
    fn generate(&self) -> Result<GeneratedKeyPair, KeyError> {
        Err(KeyError::KeyGenerationError("entropy source unavailable".into()))
    }
}

/// Scriptable [`KeySetSource`] that counts fetches.
#[derive(Debug, Default)]
pub struct StaticKeySetSource {
    sets: Mutex<HashMap<TenantId, PublishedKeySet>>,
    failure: Mutex<Option<StorageError>>,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
}

impl StaticKeySetSource {
    /// Creates a source with no tenants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `set` for its tenant from now on.
    pub fn set(&self, set: PublishedKeySet) {
        self.sets.lock().insert(set.tenant_id.clone(), set);
    }

    /// Fails every fetch with `error` (or heals with `None`).
    pub fn set_failure(&self, error: Option<StorageError>) {
        *self.failure.lock() = error;
    }

    /// Delays every fetch by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of fetches so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetSource for StaticKeySetSource {
    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        self.sets
            .lock()
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("jwks:{tenant_id}")))
    }
}

/// Asserts that a verification result is an `Err` of the given variant.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use warden_authn::{VerificationError, assert_verification_error};
///
/// let result: Result<(), VerificationError> = Err(VerificationError::Expired);
/// assert_verification_error!(result, Expired);
/// ```
#[macro_export]
macro_rules! assert_verification_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::VerificationError::$variant { .. })),
            "expected VerificationError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::VerificationError::$variant { .. })),
            "{}: expected VerificationError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
