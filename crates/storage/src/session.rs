//! Session records and their versioned persistence contract.
//!
//! Refresh rotation is made atomic per session with optimistic concurrency:
//! every record carries a `version`, and [`SessionStore::compare_and_swap`]
//! only writes when the stored version still matches the one the caller
//! read. A losing writer gets [`StorageError::Conflict`] and re-evaluates
//! against the fresh record.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{StorageError, StorageResult},
    types::{SessionId, SubjectId, TenantId},
};

/// A refresh token hash that was superseded by a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatedRefreshHash {
    /// Hex SHA-256 of the superseded refresh token.
    pub hash: String,
    /// When the rotation happened.
    pub rotated_at: DateTime<Utc>,
}

/// Server-side state of one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Authenticated principal.
    pub subject_id: SubjectId,
    /// `jti` of the most recently issued access token.
    pub access_token_id: String,
    /// Hex SHA-256 of the current refresh token.
    pub refresh_token_hash: String,
    /// Recently superseded hashes, newest last, kept for reuse detection.
    pub previous_refresh_hashes: Vec<RotatedRefreshHash>,
    /// How the subject authenticated (e.g. `password`, `webauthn`).
    pub auth_method: String,
    /// Permissions snapshot copied into every access token of the session.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last successful issue or refresh.
    pub last_activity_at: DateTime<Utc>,
    /// Absolute session expiry.
    pub expires_at: DateTime<Utc>,
    /// Set once when the session is revoked; terminal.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Reason recorded with the revocation.
    pub revoked_reason: Option<String>,
    /// Optimistic concurrency version, bumped on every write.
    pub version: u64,
}

impl SessionRecord {
    /// Returns `true` once the session has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Every refresh hash that currently maps to this session.
    pub fn indexed_hashes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.refresh_token_hash.as_str())
            .chain(self.previous_refresh_hashes.iter().map(|r| r.hash.as_str()))
    }
}

/// Persistence for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores a new session at version `0`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the session id is taken.
    async fn create(&self, record: SessionRecord) -> StorageResult<()>;

    /// Fetches a session by id.
    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>>;

    /// Finds the session whose current or recently rotated refresh hash is
    /// `hash`.
    async fn find_by_refresh_hash(&self, hash: &str) -> StorageResult<Option<SessionRecord>>;

    /// Writes `record` if the stored version equals `expected_version`.
    ///
    /// Returns the stored record with its version incremented.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if another writer got there first
    /// - [`StorageError::NotFound`] if the session does not exist
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: SessionRecord,
    ) -> StorageResult<SessionRecord>;

    /// Lists every session of a subject within a tenant.
    async fn list_for_subject(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
    ) -> StorageResult<Vec<SessionRecord>>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    async fn create(&self, record: SessionRecord) -> StorageResult<()> {
        (**self).create(record).await
    }

    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        (**self).get(session_id).await
    }

    async fn find_by_refresh_hash(&self, hash: &str) -> StorageResult<Option<SessionRecord>> {
        (**self).find_by_refresh_hash(hash).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: SessionRecord,
    ) -> StorageResult<SessionRecord> {
        (**self).compare_and_swap(expected_version, record).await
    }

    async fn list_for_subject(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
    ) -> StorageResult<Vec<SessionRecord>> {
        (**self).list_for_subject(tenant_id, subject_id).await
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<SessionId, SessionRecord>,
    by_refresh_hash: HashMap<String, SessionId>,
}

impl SessionTable {
    fn index(&mut self, record: &SessionRecord) {
        for hash in record.indexed_hashes() {
            self.by_refresh_hash.insert(hash.to_owned(), record.session_id.clone());
        }
    }

    fn unindex(&mut self, record: &SessionRecord) {
        for hash in record.indexed_hashes() {
            self.by_refresh_hash.remove(hash);
        }
    }
}

/// In-memory [`SessionStore`] with a refresh-hash index.
///
/// The whole table sits behind one `RwLock`, but every critical section is
/// a few map operations; there is no lock held across an await point.
#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    table: Arc<RwLock<SessionTable>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    /// Returns `true` if no sessions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    #[tracing::instrument(skip(self, record), fields(session_id = %record.session_id))]
    async fn create(&self, mut record: SessionRecord) -> StorageResult<()> {
        let mut table = self.table.write();
        if table.sessions.contains_key(&record.session_id) {
            return Err(StorageError::already_exists(format!("session:{}", record.session_id)));
        }
        record.version = 0;
        table.index(&record);
        table.sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        Ok(self.table.read().sessions.get(session_id).cloned())
    }

    async fn find_by_refresh_hash(&self, hash: &str) -> StorageResult<Option<SessionRecord>> {
        let table = self.table.read();
        Ok(table.by_refresh_hash.get(hash).and_then(|id| table.sessions.get(id)).cloned())
    }

    #[tracing::instrument(skip(self, record), fields(session_id = %record.session_id))]
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut record: SessionRecord,
    ) -> StorageResult<SessionRecord> {
        let mut table = self.table.write();
        let Some(current) = table.sessions.get(&record.session_id).cloned() else {
            return Err(StorageError::not_found(format!("session:{}", record.session_id)));
        };
        if current.version != expected_version {
            tracing::debug!(
                expected_version,
                actual_version = current.version,
                "session compare-and-swap lost"
            );
            return Err(StorageError::conflict(format!("session:{}", record.session_id)));
        }

        record.version = expected_version + 1;
        table.unindex(&current);
        table.index(&record);
        table.sessions.insert(record.session_id.clone(), record.clone());
        Ok(record)
    }

    async fn list_for_subject(
        &self,
        tenant_id: &TenantId,
        subject_id: &SubjectId,
    ) -> StorageResult<Vec<SessionRecord>> {
        let table = self.table.read();
        let mut sessions: Vec<SessionRecord> = table
            .sessions
            .values()
            .filter(|s| &s.tenant_id == tenant_id && &s.subject_id == subject_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn session(id: &str, hash: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: SessionId::from(id),
            tenant_id: TenantId::from("acme"),
            subject_id: SubjectId::from("user-1"),
            access_token_id: "jti-1".into(),
            refresh_token_hash: hash.into(),
            previous_refresh_hashes: Vec::new(),
            auth_method: "password".into(),
            permissions: Vec::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + chrono::Duration::days(1),
            revoked_at: None,
            revoked_reason: None,
            version: 7,
        }
    }

    #[tokio::test]
    async fn test_create_resets_version() {
        let store = MemorySessionStore::new();
        store.create(session("s1", "h1")).await.unwrap();
        let stored = store.get(&SessionId::from("s1")).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_cas_bumps_version_and_reindexes() {
        let store = MemorySessionStore::new();
        store.create(session("s1", "h1")).await.unwrap();

        let mut next = store.get(&SessionId::from("s1")).await.unwrap().unwrap();
        next.previous_refresh_hashes
            .push(RotatedRefreshHash { hash: "h1".into(), rotated_at: Utc::now() });
        next.refresh_token_hash = "h2".into();
        let written = store.compare_and_swap(0, next).await.unwrap();
        assert_eq!(written.version, 1);

        // Both the new and the superseded hash resolve to the session.
        for hash in ["h1", "h2"] {
            let found = store.find_by_refresh_hash(hash).await.unwrap().unwrap();
            assert_eq!(found.session_id.as_str(), "s1");
        }
    }

    #[tokio::test]
    async fn test_cas_with_stale_version_conflicts() {
        let store = MemorySessionStore::new();
        store.create(session("s1", "h1")).await.unwrap();
        let record = store.get(&SessionId::from("s1")).await.unwrap().unwrap();

        store.compare_and_swap(0, record.clone()).await.unwrap();
        let err = store.compare_and_swap(0, record).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_pruned_hash_is_unindexed() {
        let store = MemorySessionStore::new();
        let mut record = session("s1", "h2");
        record
            .previous_refresh_hashes
            .push(RotatedRefreshHash { hash: "h1".into(), rotated_at: Utc::now() });
        store.create(record.clone()).await.unwrap();

        record.previous_refresh_hashes.clear();
        store.compare_and_swap(0, record).await.unwrap();
        assert!(store.find_by_refresh_hash("h1").await.unwrap().is_none());
        assert!(store.find_by_refresh_hash("h2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_for_subject_filters_by_tenant() {
        let store = MemorySessionStore::new();
        store.create(session("s1", "h1")).await.unwrap();
        let mut other = session("s2", "h2");
        other.tenant_id = TenantId::from("globex");
        store.create(other).await.unwrap();

        let listed = store
            .list_for_subject(&TenantId::from("acme"), &SubjectId::from("user-1"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id.as_str(), "s1");
    }
}
