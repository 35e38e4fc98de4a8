#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Fail-point injection for refresh rotation and revocation.
//!
//! Requires both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p warden-session --features failpoints,testutil --test failpoint_tests
//! ```

use std::{sync::Arc, time::Duration};

use warden_audit::{AuditSink, testutil::RecordingAuditSink};
use warden_authn::KeyStore;
use warden_session::{SessionConfig, SessionError, SessionManager};
use warden_storage::{
    Clock, KeyRecordStore, MemoryKeyRecordStore, MemorySessionStore, RetryConfig, SessionStore,
    SubjectId, TenantId, testutil::epoch_clock,
};

async fn manager_with_audit(audit: Arc<RecordingAuditSink>) -> SessionManager {
    let clock = Arc::new(epoch_clock()) as Arc<dyn Clock>;
    let keys = KeyStore::builder()
        .store(Arc::new(MemoryKeyRecordStore::new()) as Arc<dyn KeyRecordStore>)
        .clock(Arc::clone(&clock))
        .build();
    keys.rotate(&TenantId::from("acme")).await.unwrap();
    let config = SessionConfig::builder()
        .revoke_retry(
            RetryConfig::builder()
                .max_retries(2)
                .initial_backoff(Duration::from_millis(1))
                .max_backoff(Duration::from_millis(1))
                .build()
                .expect("valid retry config"),
        )
        .build()
        .expect("valid session config");
    SessionManager::builder()
        .store(Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>)
        .key_store(keys)
        .config(config)
        .audit(audit as Arc<dyn AuditSink>)
        .clock(clock)
        .build()
}

async fn manager() -> SessionManager {
    manager_with_audit(Arc::new(RecordingAuditSink::new())).await
}

#[tokio::test]
async fn failed_rotation_leaves_refresh_token_valid() {
    let scenario = fail::FailScenario::setup();
    let sessions = manager().await;
    let issued = sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();

    fail::cfg("session-refresh-cas", "return").expect("failed to configure fail point");
    let err = sessions.refresh(&issued.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::Storage(_)));
    assert_eq!(sessions.get(&issued.session.session_id).await.unwrap().version, 0);

    fail::remove("session-refresh-cas");
    let rotated = sessions.refresh(&issued.refresh_token).await.expect("original token still current");
    assert_eq!(rotated.session.version, 1);

    scenario.teardown();
}

#[tokio::test]
async fn reuse_with_failing_revocation_reports_storage_error() {
    let scenario = fail::FailScenario::setup();
    let audit = Arc::new(RecordingAuditSink::new());
    let sessions = manager_with_audit(Arc::clone(&audit)).await;
    let issued = sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();
    sessions.refresh(&issued.refresh_token).await.unwrap();

    fail::cfg("session-revoke-cas", "return").expect("failed to configure fail point");
    let err = sessions.refresh(&issued.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::Storage(_)), "got {err:?}");
    assert!(!sessions.get(&issued.session.session_id).await.unwrap().is_revoked());

    // The theft is still on record even though the session survived.
    let reuse = audit.with_action("session.reuse_detected");
    assert_eq!(reuse.len(), 1);
    assert_eq!(reuse[0].metadata.get("revoked").map(String::as_str), Some("false"));

    fail::remove("session-revoke-cas");
    let err = sessions.refresh(&issued.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::ReuseDetected { .. }));
    assert!(sessions.get(&issued.session.session_id).await.unwrap().is_revoked());

    scenario.teardown();
}

#[tokio::test]
async fn transient_revocation_failure_is_retried() {
    let scenario = fail::FailScenario::setup();
    let sessions = manager().await;
    let issued = sessions
        .issue(&TenantId::from("acme"), &SubjectId::from("user-1"), "password")
        .await
        .unwrap();
    sessions.refresh(&issued.refresh_token).await.unwrap();

    fail::cfg("session-revoke-cas", "1*return").expect("failed to configure fail point");
    let err = sessions.refresh(&issued.refresh_token).await.unwrap_err();
    assert!(matches!(err, SessionError::ReuseDetected { .. }));
    assert!(sessions.get(&issued.session.session_id).await.unwrap().is_revoked());

    fail::remove("session-revoke-cas");
    scenario.teardown();
}
