//! Audit sinks.
//!
//! Components that emit security events (the key store, token verifier and
//! session manager) depend only on [`AuditSink`], not on the engine:
//!
//! - [`AuditEngine`](crate::AuditEngine): scores, seals and persists events.
//! - [`TracingAuditSink`]: emits structured `tracing` events at INFO, suitable for log aggregation
//!   and SIEM forwarding.
//! - [`NoopAuditSink`]: discards events.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entry::NewAuditEntry;

/// Destination for security events.
///
/// `record` must not fail the caller's request: implementations that can
/// fail surface the failure through their own observability instead.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Records one event.
    async fn record(&self, event: NewAuditEntry);
}

#[async_trait]
impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    async fn record(&self, event: NewAuditEntry) {
        (**self).record(event).await;
    }
}

/// Sink that emits each event as a structured `tracing` record.
///
/// Field mapping:
/// - `audit.actor`, `audit.actor_type`, `audit.ip`: who acted
/// - `audit.action`: dotted action name
/// - `audit.resource`: `{type}:{id}`
/// - `audit.outcome`: `success`, `failure` or `error`
/// - `audit.metadata`: `k=v` pairs joined by `, `
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: NewAuditEntry) {
        let metadata =
            event.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");

        tracing::info!(
            audit.actor = %event.actor.id,
            audit.actor_type = %event.actor.actor_type,
            audit.ip = event.actor.ip.as_deref().unwrap_or("-"),
            audit.action = %event.action,
            audit.resource = %format_args!("{}:{}", event.resource.resource_type, event.resource.id),
            audit.outcome = %event.outcome,
            audit.metadata = %metadata,
            "audit_event"
        );
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: NewAuditEntry) {}
}
