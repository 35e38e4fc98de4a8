//! Audit log persistence and querying.
//!
//! Entries are append-only. The only deletion path is the retention sweep,
//! which archives first (when enabled) and deletes by id afterwards.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_storage::{StorageError, StorageResult};

use crate::{
    compliance::ComplianceRegime,
    entry::{AuditLogEntry, Outcome},
};

/// Result ordering by timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    #[default]
    Descending,
}

/// Filters, ordering and pagination for audit queries.
///
/// Every filter is optional; unset filters match everything. The time range
/// is half-open: `start` inclusive, `end` exclusive.
///
/// ```
/// use warden_audit::{AuditQuery, Outcome, SortOrder};
///
/// let query = AuditQuery::builder()
///     .actor_id("user-42")
///     .outcome(Outcome::Failure)
///     .min_risk(0.5)
///     .order(SortOrder::Ascending)
///     .limit(50)
///     .build();
/// assert_eq!(query.offset, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, bon::Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    /// Exact actor id.
    #[builder(into)]
    pub actor_id: Option<String>,
    /// Exact action name.
    #[builder(into)]
    pub action: Option<String>,
    /// Exact resource type.
    #[builder(into)]
    pub resource_type: Option<String>,
    /// Exact resource id.
    #[builder(into)]
    pub resource_id: Option<String>,
    /// Exact outcome.
    pub outcome: Option<Outcome>,
    /// Minimum risk score (inclusive).
    pub min_risk: Option<f64>,
    /// Entries tagged with this regime.
    pub compliance_flag: Option<ComplianceRegime>,
    /// Earliest timestamp (inclusive).
    pub start: Option<DateTime<Utc>>,
    /// Latest timestamp (exclusive).
    pub end: Option<DateTime<Utc>>,
    /// Result ordering.
    #[builder(default)]
    pub order: SortOrder,
    /// Matching entries to skip.
    #[builder(default)]
    pub offset: usize,
    /// Maximum entries to return; `None` returns all.
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Returns `true` if `entry` passes every filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor_id.as_deref().is_none_or(|id| entry.actor.id == id)
            && self.action.as_deref().is_none_or(|a| entry.action == a)
            && self.resource_type.as_deref().is_none_or(|t| entry.resource.resource_type == t)
            && self.resource_id.as_deref().is_none_or(|id| entry.resource.id == id)
            && self.outcome.is_none_or(|o| entry.outcome == o)
            && self.min_risk.is_none_or(|r| entry.risk_score >= r)
            && self.compliance_flag.is_none_or(|f| entry.compliance_flags.contains(&f))
            && self.start.is_none_or(|s| entry.timestamp >= s)
            && self.end.is_none_or(|e| entry.timestamp < e)
    }

    /// Filters, sorts and paginates an arbitrary collection of entries.
    #[must_use]
    pub fn apply<'a>(&self, entries: impl IntoIterator<Item = &'a AuditLogEntry>) -> AuditPage {
        let mut matched: Vec<&AuditLogEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        if self.order == SortOrder::Descending {
            matched.reverse();
        }

        let total = matched.len();
        let page: Vec<AuditLogEntry> = matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        let has_more = self.offset.saturating_add(page.len()) < total;
        AuditPage { entries: page, total, offset: self.offset, has_more }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    /// Entries on this page, in the requested order.
    pub entries: Vec<AuditLogEntry>,
    /// Matching entries across all pages.
    pub total: usize,
    /// Offset this page starts at.
    pub offset: usize,
    /// Whether entries remain after this page.
    pub has_more: bool,
}

/// Persistence for sealed audit entries.
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    /// Appends a batch atomically: either every entry is stored or none is.
    async fn append_batch(&self, entries: &[AuditLogEntry]) -> StorageResult<()>;

    /// Fetches one entry.
    async fn get(&self, id: Uuid) -> StorageResult<Option<AuditLogEntry>>;

    /// Runs a query.
    async fn query(&self, query: &AuditQuery) -> StorageResult<AuditPage>;

    /// Oldest entries with a timestamp before `cutoff`, at most `limit`.
    async fn older_than(&self, cutoff: DateTime<Utc>, limit: usize)
    -> StorageResult<Vec<AuditLogEntry>>;

    /// Deletes entries by id; returns how many existed.
    async fn delete(&self, ids: &[Uuid]) -> StorageResult<usize>;
}

#[async_trait]
impl<S: AuditLogStore + ?Sized> AuditLogStore for Arc<S> {
    async fn append_batch(&self, entries: &[AuditLogEntry]) -> StorageResult<()> {
        (**self).append_batch(entries).await
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<AuditLogEntry>> {
        (**self).get(id).await
    }

    async fn query(&self, query: &AuditQuery) -> StorageResult<AuditPage> {
        (**self).query(query).await
    }

    async fn older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        (**self).older_than(cutoff, limit).await
    }

    async fn delete(&self, ids: &[Uuid]) -> StorageResult<usize> {
        (**self).delete(ids).await
    }
}

#[derive(Debug, Default)]
struct AuditTable {
    by_time: BTreeMap<(DateTime<Utc>, Uuid), AuditLogEntry>,
    timestamps: HashMap<Uuid, DateTime<Utc>>,
}

/// In-memory [`AuditLogStore`] ordered by timestamp.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLogStore {
    table: Arc<RwLock<AuditTable>>,
}

impl MemoryAuditLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().timestamps.len()
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites a stored entry in place without touching its checksum.
    ///
    /// Simulates an attacker with write access to the log store.
    #[cfg(any(test, feature = "testutil"))]
    pub fn tamper_with(&self, id: Uuid, edit: impl FnOnce(&mut AuditLogEntry)) -> bool {
        let mut table = self.table.write();
        let Some(ts) = table.timestamps.get(&id).copied() else {
            return false;
        };
        match table.by_time.get_mut(&(ts, id)) {
            Some(entry) => {
                edit(entry);
                true
            },
            None => false,
        }
    }
}

#[async_trait]
impl AuditLogStore for MemoryAuditLogStore {
    #[tracing::instrument(skip(self, entries), fields(batch_len = entries.len()))]
    async fn append_batch(&self, entries: &[AuditLogEntry]) -> StorageResult<()> {
        fail_point!("audit-store-append", |_| {
            Err(StorageError::connection("injected audit store outage"))
        });
        let mut table = self.table.write();
        if let Some(dup) = entries.iter().find(|e| table.timestamps.contains_key(&e.id)) {
            return Err(StorageError::already_exists(format!("audit:{}", dup.id)));
        }
        for entry in entries {
            table.timestamps.insert(entry.id, entry.timestamp);
            table.by_time.insert((entry.timestamp, entry.id), entry.clone());
        }
        drop(table);
        // Committed, but the caller never hears about it.
        fail_point!("audit-store-append-lost-ack", |_| Err(StorageError::timeout()));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<AuditLogEntry>> {
        let table = self.table.read();
        Ok(table.timestamps.get(&id).and_then(|ts| table.by_time.get(&(*ts, id))).cloned())
    }

    async fn query(&self, query: &AuditQuery) -> StorageResult<AuditPage> {
        let table = self.table.read();
        Ok(query.apply(table.by_time.values()))
    }

    async fn older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let table = self.table.read();
        Ok(table
            .by_time
            .range(..(cutoff, Uuid::nil()))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> StorageResult<usize> {
        let mut table = self.table.write();
        let mut removed = 0;
        for id in ids {
            if let Some(ts) = table.timestamps.remove(id) {
                table.by_time.remove(&(ts, *id));
                removed += 1;
            }
        }
        Ok(removed)
    }
}
