//! Test helpers for components that emit audit events.
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! warden-audit = { workspace = true, features = ["testutil"] }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{entry::NewAuditEntry, sink::AuditSink};

/// [`AuditSink`] that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<NewAuditEntry>>,
}

impl RecordingAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<NewAuditEntry> {
        self.events.lock().clone()
    }

    /// Recorded events with the given action.
    #[must_use]
    pub fn with_action(&self, action: &str) -> Vec<NewAuditEntry> {
        self.events.lock().iter().filter(|e| e.action == action).cloned().collect()
    }

    /// Drops everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: NewAuditEntry) {
        self.events.lock().push(event);
    }
}

/// Asserts that a recorded event carries a metadata value.
///
/// ```ignore
/// assert_audit_metadata!(event, "error_kind", "expired");
/// ```
#[macro_export]
macro_rules! assert_audit_metadata {
    ($event:expr, $key:expr, $value:expr) => {{
        let event = &$event;
        match event.metadata.get($key) {
            Some(actual) => assert_eq!(
                actual, $value,
                "audit event '{}' has {}={}, expected {}",
                event.action, $key, actual, $value
            ),
            None => panic!("audit event '{}' has no '{}' metadata", event.action, $key),
        }
    }};
}
