#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! End-to-end integrity guarantees: tamper detection and lossless export.

use std::sync::Arc;

use warden_audit::{
    Actor, ActorType, AuditEngine, AuditLogStore, AuditQuery, AuditSink, ComplianceRegime,
    ExportFormat, IntegrityKey, MemoryAuditLogStore, NewAuditEntry, Outcome, Resource, SortOrder,
    checksum, import_json,
};

const SECRET: &[u8; 32] = b"integration-test-audit-secret-00";

fn engine_over(store: &Arc<MemoryAuditLogStore>) -> AuditEngine {
    AuditEngine::builder()
        .store(Arc::clone(store) as Arc<dyn AuditLogStore>)
        .integrity_key(IntegrityKey::new(SECRET).unwrap())
        .build()
}

fn events() -> Vec<NewAuditEntry> {
    vec![
        NewAuditEntry::builder()
            .actor(Actor::new("user-7", ActorType::User).with_ip("192.0.2.10").with_user_agent("curl/8.5"))
            .action("record.read")
            .resource(Resource::new("medical", "chart-81"))
            .outcome(Outcome::Success)
            .build()
            .with_metadata("tenant_id", "clinic"),
        NewAuditEntry::builder()
            .actor(Actor::new("anonymous", ActorType::Anonymous))
            .action("token.verify")
            .resource(Resource::new("token", "jti-4"))
            .outcome(Outcome::Failure)
            .build()
            .with_metadata("error_kind", "signature_mismatch"),
        NewAuditEntry::builder()
            .actor(Actor::new("svc-ledger", ActorType::Service))
            .action("ledger.post")
            .resource(Resource::new("financial", "txn-2"))
            .outcome(Outcome::Error)
            .build(),
    ]
}

#[tokio::test]
async fn sealed_entries_detect_in_place_edits() {
    let store = Arc::new(MemoryAuditLogStore::new());
    let engine = engine_over(&store);
    let sink: Arc<dyn AuditSink> = Arc::new(engine.clone());
    for event in events() {
        sink.record(event).await;
    }

    let page = engine.query(&AuditQuery::default()).await.unwrap();
    assert_eq!(page.total, 3);
    for entry in &page.entries {
        assert!(engine.verify_integrity(entry.id).await.unwrap());
    }

    let victim = page.entries.iter().find(|e| e.outcome == Outcome::Failure).unwrap();
    assert!(store.tamper_with(victim.id, |e| e.risk_score = 0.0));
    assert!(!engine.verify_integrity(victim.id).await.unwrap());

    let others: Vec<_> = page.entries.iter().filter(|e| e.id != victim.id).collect();
    for entry in others {
        assert!(engine.verify_integrity(entry.id).await.unwrap());
    }
}

#[tokio::test]
async fn store_write_access_cannot_reseal_an_edit() {
    let store = Arc::new(MemoryAuditLogStore::new());
    let engine = engine_over(&store);
    let entry = engine.log(events().remove(1));
    engine.flush().await.unwrap();

    // Everything a store-level attacker can compute without the secret.
    let guessed = IntegrityKey::new(&[0u8; 32]).unwrap();
    assert!(store.tamper_with(entry.id, |e| {
        e.outcome = Outcome::Success;
        e.integrity_checksum = checksum::compute(&guessed, e);
    }));
    assert!(!engine.verify_integrity(entry.id).await.unwrap());
}

#[tokio::test]
async fn compliance_tags_follow_resource_type() {
    let store = Arc::new(MemoryAuditLogStore::new());
    let engine = engine_over(&store);
    let sealed: Vec<_> = events().into_iter().map(|e| engine.log(e)).collect();

    assert!(sealed[0].compliance_flags.contains(&ComplianceRegime::Hipaa));
    assert!(sealed[1].compliance_flags.is_empty());
    assert!(sealed[2].compliance_flags.contains(&ComplianceRegime::Sox));

    let hipaa = engine
        .query(&AuditQuery::builder().compliance_flag(ComplianceRegime::Hipaa).build())
        .await
        .unwrap();
    assert_eq!(hipaa.total, 1);
}

#[tokio::test]
async fn json_export_survives_a_full_round_trip() {
    let source_store = Arc::new(MemoryAuditLogStore::new());
    let source = engine_over(&source_store);
    for event in events() {
        source.log(event);
    }
    let everything = AuditQuery::builder().order(SortOrder::Ascending).action("token.verify").build();
    let original = source.query(&everything).await.unwrap().entries;

    let body = source.export(ExportFormat::Json, &everything).await.unwrap();
    assert_eq!(import_json(&body).unwrap(), original);

    let target_store = Arc::new(MemoryAuditLogStore::new());
    let target = engine_over(&target_store);
    assert_eq!(target.import_json(&body).await.unwrap(), 1);
    let copied = target.query(&everything).await.unwrap().entries;
    assert_eq!(copied, original);
    assert!(target.verify_integrity(copied[0].id).await.unwrap());
}
