//! # Warden Audit
//!
//! Tamper-evident audit trail for the Warden credential core.
//!
//! This crate provides:
//! - **Sealing**: every event gets an id, timestamp, table-driven risk score, compliance tags and
//!   an HMAC-SHA256 integrity checksum under a secret [`IntegrityKey`]
//! - **Batching**: [`AuditEngine::log`] never waits on storage; a background flusher writes on a
//!   timer or when the batch fills
//! - **Querying and reporting**: filtered, paginated queries and compliance reports with anomaly
//!   detection
//! - **Export**: JSON (lossless, re-importable) and CSV
//! - **Retention**: archive-then-delete sweeps with retry, legal hold, and a scheduler
//! - **Webhooks**: HMAC-signed delivery of high-risk events with replay-safe verification
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_audit::{
//!     Actor, ActorType, AuditEngine, AuditQuery, MemoryAuditLogStore, NewAuditEntry, Outcome,
//!     Resource,
//! };
//!
//! # async fn example() -> warden_audit::Result<()> {
//! let engine = AuditEngine::builder().store(Arc::new(MemoryAuditLogStore::new())).build();
//! engine.start();
//!
//! engine.log(
//!     NewAuditEntry::builder()
//!         .actor(Actor::new("user-42", ActorType::User).with_ip("203.0.113.9"))
//!         .action("session.refresh")
//!         .resource(Resource::new("session", "s-1"))
//!         .outcome(Outcome::Success)
//!         .build(),
//! );
//!
//! let failures = engine
//!     .query(&AuditQuery::builder().outcome(Outcome::Failure).limit(20).build())
//!     .await?;
//! println!("{} failures", failures.total);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: exposes [`testutil`] (recording sink, entry assertions).
//! - **`failpoints`**: activates `fail` points in the in-memory store and archive.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Canonical integrity checksums.
pub mod checksum;
/// Regime tagging.
pub mod compliance;
/// Engine configuration.
pub mod config;
/// The audit engine.
pub mod engine;
/// Entry types.
pub mod entry;
/// Error types.
pub mod error;
/// JSON and CSV export.
pub mod export;
/// Compliance reports.
pub mod report;
/// Retention sweeps.
pub mod retention;
/// Risk scoring.
pub mod risk;
/// Audit sinks.
pub mod sink;
/// Persistence and queries.
pub mod store;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Webhook signing and delivery.
pub mod webhook;

pub use checksum::IntegrityKey;
pub use compliance::{ComplianceRegime, ComplianceRules};
pub use config::AuditConfig;
pub use engine::{AuditEngine, AuditMetricsSnapshot};
pub use entry::{Actor, ActorType, AuditLogEntry, NewAuditEntry, Outcome, Resource};
pub use error::{AuditError, Result};
pub use export::{ExportFormat, import_json};
pub use report::{ActionCount, Anomaly, ComplianceReport, RegimeSummary, ReportPeriod};
pub use retention::{
    ArchiveDestination, ComplianceMode, MemoryArchiveDestination, RetentionPolicy,
    RetentionReport, RetentionScheduler,
};
pub use risk::{RiskPolicy, RiskSignals};
pub use sink::{AuditSink, NoopAuditSink, TracingAuditSink};
pub use store::{AuditLogStore, AuditPage, AuditQuery, MemoryAuditLogStore, SortOrder};
pub use webhook::{
    DeliveryStatus, HttpWebhookTransport, WebhookConfig, WebhookNotifier, WebhookPayload,
    WebhookRejection, WebhookTransport, WebhookVerifier, verify_webhook,
};
