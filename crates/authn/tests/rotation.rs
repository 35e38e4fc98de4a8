//! Key rotation under live verification traffic.
//!
//! Times are seconds relative to [`TEST_EPOCH_SECS`]; every component shares
//! one manual clock.
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::Duration;
use warden_authn::{
    KeySetCache, KeySetSource, KeyStore, TokenVerifier, VerificationError, assert_verification_error,
    testutil::{TEST_AUDIENCE, test_claims},
};
use warden_storage::{
    Clock, KeyRecordStore, KeyState, ManualClock, MemoryKeyRecordStore, TenantId,
    testutil::{TEST_EPOCH_SECS, epoch_clock},
};

struct Harness {
    clock: ManualClock,
    store: MemoryKeyRecordStore,
    keys: KeyStore,
    verifier: TokenVerifier,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let clock = epoch_clock();
    let store = MemoryKeyRecordStore::new();
    let keys = KeyStore::builder()
        .store(Arc::new(store.clone()) as Arc<dyn KeyRecordStore>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    let cache = KeySetCache::builder()
        .source(Arc::new(keys.clone()) as Arc<dyn KeySetSource>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    let verifier = TokenVerifier::builder()
        .cache(Arc::new(cache))
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    Harness { clock, store, keys, verifier }
}

impl Harness {
    fn at(&self, t: i64) {
        self.clock.set(chrono::DateTime::from_timestamp(TEST_EPOCH_SECS + t, 0).unwrap());
    }

    async fn sign(&self, sub: &str, iat: i64, exp: i64) -> String {
        self.keys
            .sign(&test_claims("acme", sub, TEST_EPOCH_SECS + iat, TEST_EPOCH_SECS + exp))
            .await
            .unwrap()
    }

    async fn verify(&self, token: &str) -> warden_authn::Result<warden_authn::VerifiedIdentity> {
        self.verifier.verify(token, &TenantId::from("acme"), TEST_AUDIENCE).await
    }
}

#[tokio::test]
async fn old_key_tokens_survive_rotation_until_retirement() {
    let h = harness();
    let tenant = TenantId::from("acme");

    h.at(-1);
    let old_kid = h.keys.rotate(&tenant).await.unwrap();
    let old_token = h.sign("user-old", -1, 60).await;

    h.at(0);
    let new_kid = h.keys.rotate(&tenant).await.unwrap();
    assert_ne!(old_kid, new_kid);

    h.at(1);
    let new_token = h.sign("user-new", 1, 301).await;

    h.at(30);
    let old_identity = h.verify(&old_token).await.unwrap();
    assert_eq!(old_identity.key_id, old_kid);
    let new_identity = h.verify(&new_token).await.unwrap();
    assert_eq!(new_identity.key_id, new_kid);

    h.at(120);
    let result = h.verify(&old_token).await;
    assert_verification_error!(result, UnknownKey);
    assert!(h.verify(&new_token).await.is_ok());
}

#[tokio::test]
async fn retiring_key_deadline_tracks_latest_token() {
    let h = harness();
    let tenant = TenantId::from("acme");

    let old_kid = h.keys.rotate(&tenant).await.unwrap();
    h.sign("a", 0, 60).await;
    h.sign("b", 0, 600).await;
    h.sign("c", 0, 300).await;
    h.keys.rotate(&tenant).await.unwrap();

    let old = h.store.get(&tenant, &old_kid).await.unwrap().unwrap();
    assert_eq!(old.state, KeyState::Retiring);
    assert_eq!(
        old.expires_at.map(|t| t.timestamp()),
        Some(TEST_EPOCH_SECS + 600 + 30)
    );
}

#[tokio::test]
async fn sweep_after_rotation_keeps_outstanding_tokens_valid() {
    let h = harness();
    let tenant = TenantId::from("acme");

    h.keys.rotate(&tenant).await.unwrap();
    let token = h.sign("user-1", 0, 300).await;
    h.keys.rotate(&tenant).await.unwrap();

    h.at(200);
    let report = h.keys.expire_sweep().await.unwrap();
    assert_eq!(report.expired, 0);
    assert!(h.verify(&token).await.is_ok());

    h.at(400);
    let report = h.keys.expire_sweep().await.unwrap();
    assert_eq!(report.expired, 1);
    h.verifier.cache().invalidate(&tenant);
    assert!(h.verify(&token).await.is_err());
}

#[tokio::test]
async fn token_for_other_tenant_is_always_rejected() {
    let h = harness();
    let acme = TenantId::from("acme");
    let globex = TenantId::from("globex");
    h.keys.rotate(&acme).await.unwrap();
    h.keys.rotate(&globex).await.unwrap();

    let token = h.sign("user-1", 0, 300).await;
    let result = h.verifier.verify(&token, &globex, TEST_AUDIENCE).await;
    assert_verification_error!(result, TenantMismatch);

    h.clock.advance(Duration::seconds(10));
    let result = h.verifier.verify(&token, &globex, TEST_AUDIENCE).await;
    assert_verification_error!(result, TenantMismatch);
    assert!(h.verify(&token).await.is_ok());
}

#[tokio::test]
async fn concurrent_verification_during_rotation() {
    let h = Arc::new(harness());
    let tenant = TenantId::from("acme");
    h.keys.rotate(&tenant).await.unwrap();
    let token = h.sign("user-1", 0, 300).await;

    let verifiers: Vec<_> = (0..32)
        .map(|_| {
            let h = Arc::clone(&h);
            let token = token.clone();
            tokio::spawn(async move { h.verify(&token).await })
        })
        .collect();
    h.keys.rotate(&tenant).await.unwrap();

    for verifier in verifiers {
        let result: Result<_, VerificationError> = verifier.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
    }
}
