//! End-to-end refresh rotation: sessions issued through the manager,
//! access tokens checked by the verifier.
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::sync::Arc;

use warden_audit::{
    AuditEngine, AuditLogStore, AuditSink, MemoryAuditLogStore, Outcome, testutil::RecordingAuditSink,
};
use warden_authn::{KeySetCache, KeySetSource, KeyStore, TokenVerifier, VerificationError};
use warden_session::{REUSE_RISK_FLOOR, SessionError, SessionManager};
use warden_storage::{
    Clock, KeyRecordStore, MemoryKeyRecordStore, MemorySessionStore, SessionStore, SubjectId,
    TenantId, testutil::epoch_clock,
};

struct Harness {
    sessions: Arc<SessionManager>,
    verifier: TokenVerifier,
    audit: Arc<RecordingAuditSink>,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let clock = epoch_clock();
    let audit = Arc::new(RecordingAuditSink::new());
    let keys = KeyStore::builder()
        .store(Arc::new(MemoryKeyRecordStore::new()) as Arc<dyn KeyRecordStore>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    keys.rotate(&TenantId::from("acme")).await.unwrap();

    let cache = KeySetCache::builder()
        .source(Arc::new(keys.clone()) as Arc<dyn KeySetSource>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    let verifier = TokenVerifier::builder()
        .cache(Arc::new(cache))
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    let sessions = SessionManager::builder()
        .store(Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>)
        .key_store(keys)
        .audit(Arc::clone(&audit) as Arc<dyn AuditSink>)
        .clock(Arc::new(clock) as Arc<dyn Clock>)
        .build();

    Harness { sessions: Arc::new(sessions), verifier, audit }
}

#[tokio::test]
async fn issued_access_token_verifies_with_session_binding() {
    let h = harness().await;
    let issued = h
        .sessions
        .issue_with_permissions(
            &TenantId::from("acme"),
            &SubjectId::from("user-1"),
            "password",
            vec!["documents:read".into()],
        )
        .await
        .unwrap();

    let identity = h.verifier.verify(&issued.access_token, &TenantId::from("acme"), "api").await.unwrap();
    assert_eq!(identity.subject_id.as_str(), "user-1");
    assert_eq!(identity.session_id.as_ref(), Some(&issued.session.session_id));
    assert_eq!(identity.permissions, vec!["documents:read".to_owned()]);
    assert_eq!(identity.token_id.as_deref(), Some(issued.session.access_token_id.as_str()));

    assert!(h.sessions.ensure_active(&identity).await.unwrap().is_some());
}

#[tokio::test]
async fn reuse_of_rotated_token_revokes_whole_session() {
    let h = harness().await;
    let first = h
        .sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();
    let second = h.sessions.refresh(&first.refresh_token).await.unwrap();

    let err = h.sessions.refresh(&first.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::ReuseDetected { .. }));

    let err = h.sessions.refresh(&second.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionRevoked { .. }));

    // The access token is stateless; the session check is what rejects it.
    let identity =
        h.verifier.verify(&second.access_token, &TenantId::from("acme"), "api").await.unwrap();
    assert!(matches!(
        h.sessions.ensure_active(&identity).await,
        Err(SessionError::SessionRevoked { .. })
    ));

    let reuse = h.audit.with_action("session.reuse_detected");
    assert_eq!(reuse.len(), 1);
    assert_eq!(reuse[0].outcome, Outcome::Failure);
    assert_eq!(reuse[0].risk_floor, Some(REUSE_RISK_FLOOR));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_with_one_token_has_one_winner() {
    let h = harness().await;
    let issued = h
        .sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sessions = Arc::clone(&h.sessions);
        let token = issued.refresh_token.clone();
        handles.push(tokio::spawn(async move { sessions.refresh(&token).await }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(tokens) => winners.push(tokens),
            Err(SessionError::ReuseDetected { .. } | SessionError::SessionRevoked { .. }) => {},
            Err(other) => panic!("unexpected refresh error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1, "exactly one refresh may rotate the pair");

    // Losers count as reuse, so even the winning pair is dead afterwards.
    let err = h.sessions.refresh(&winners[0].refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionRevoked { .. }));
}

#[tokio::test]
async fn rotation_chain_keeps_every_access_token_verifiable() {
    let h = harness().await;
    let mut tokens = h
        .sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "sso")
        .await
        .unwrap();

    for expected_version in 1..=5 {
        tokens = h.sessions.refresh(&tokens.refresh_token).await.unwrap();
        assert_eq!(tokens.session.version, expected_version);
        h.verifier.verify(&tokens.access_token, &TenantId::from("acme"), "api").await.unwrap();
    }

    let result = h.verifier.verify(&tokens.access_token, &TenantId::from("globex"), "api").await;
    assert!(matches!(result, Err(VerificationError::TenantMismatch { .. })));
}

#[tokio::test]
async fn reuse_reaches_the_high_risk_channel() {
    let clock = epoch_clock();
    let engine = AuditEngine::builder()
        .store(Arc::new(MemoryAuditLogStore::new()) as Arc<dyn AuditLogStore>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    let mut high_risk = engine.subscribe_high_risk();

    let keys = KeyStore::builder()
        .store(Arc::new(MemoryKeyRecordStore::new()) as Arc<dyn KeyRecordStore>)
        .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
        .build();
    keys.rotate(&TenantId::from("acme")).await.unwrap();
    let sessions = SessionManager::builder()
        .store(Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>)
        .key_store(keys)
        .audit(Arc::new(engine.clone()) as Arc<dyn AuditSink>)
        .clock(Arc::new(clock) as Arc<dyn Clock>)
        .build();

    let issued = sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();
    sessions.refresh(&issued.refresh_token).await.unwrap();
    let _ = sessions.refresh(&issued.refresh_token).await.unwrap_err();

    let entry = high_risk.try_recv().expect("reuse must be published as high risk");
    assert_eq!(entry.action, "session.reuse_detected");
    assert!((entry.risk_score - 1.0).abs() < f64::EPSILON);
    assert!(engine.verify_integrity(entry.id).await.unwrap());
}
