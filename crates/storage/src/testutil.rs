//! Shared test helpers for stores and time.
//!
//! Feature-gated behind `testutil`. Enable it from dependent crates'
//! `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! warden-storage = { workspace = true, features = ["testutil"] }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{
    clock::ManualClock,
    error::{StorageError, StorageResult},
    keys::{KeyRecordStore, MemoryKeyRecordStore, SigningKeyRecord},
    types::{KeyId, TenantId},
};

/// Fixed epoch used by deterministic tests (2024-01-01T00:00:00Z).
pub const TEST_EPOCH_SECS: i64 = 1_704_067_200;

/// Returns [`TEST_EPOCH_SECS`] as a timestamp.
#[must_use]
pub fn test_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(TEST_EPOCH_SECS, 0).single().unwrap_or_else(Utc::now)
}

/// A [`ManualClock`] frozen at [`test_epoch`].
#[must_use]
pub fn epoch_clock() -> ManualClock {
    ManualClock::new(test_epoch())
}

/// [`KeyRecordStore`] that can be told to fail reads.
///
/// Writes always go through to the inner memory store so that a test can
/// populate keys, then simulate an outage of the read path the verifier
/// depends on.
#[derive(Debug, Default, Clone)]
pub struct FlakyKeyRecordStore {
    inner: MemoryKeyRecordStore,
    read_failure: Arc<Mutex<Option<StorageError>>>,
}

impl FlakyKeyRecordStore {
    /// Creates a healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read return `error` (or heals with `None`).
    pub fn set_read_failure(&self, error: Option<StorageError>) {
        *self.read_failure.lock() = error;
    }

    fn check(&self) -> StorageResult<()> {
        match self.read_failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KeyRecordStore for FlakyKeyRecordStore {
    async fn insert(&self, record: SigningKeyRecord) -> StorageResult<()> {
        self.inner.insert(record).await
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
    ) -> StorageResult<Option<SigningKeyRecord>> {
        self.check()?;
        self.inner.get(tenant_id, key_id).await
    }

    async fn list(&self, tenant_id: &TenantId) -> StorageResult<Vec<SigningKeyRecord>> {
        self.check()?;
        self.inner.list(tenant_id).await
    }

    async fn update(&self, record: SigningKeyRecord) -> StorageResult<()> {
        self.inner.update(record).await
    }

    async fn delete(&self, tenant_id: &TenantId, key_id: &KeyId) -> StorageResult<()> {
        self.inner.delete(tenant_id, key_id).await
    }

    async fn tenants(&self) -> StorageResult<Vec<TenantId>> {
        self.inner.tenants().await
    }
}

/// Asserts that a [`StorageResult`] is an `Err` of the given variant.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use warden_storage::{StorageError, StorageResult, assert_storage_error};
///
/// let result: StorageResult<()> = Err(StorageError::conflict("session:1"));
/// assert_storage_error!(result, Conflict);
/// ```
#[macro_export]
macro_rules! assert_storage_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::$variant { .. })),
            "expected StorageError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{clock::Clock, keys::KeyState};

    #[tokio::test]
    async fn test_flaky_store_fails_reads_until_healed() {
        let store = FlakyKeyRecordStore::new();
        let record = SigningKeyRecord::builder()
            .tenant_id("t1")
            .key_id("k1")
            .public_key("pk")
            .state(KeyState::Active)
            .created_at(test_epoch())
            .build();
        store.insert(record).await.unwrap();

        store.set_read_failure(Some(StorageError::connection("down")));
        let result = store.list(&TenantId::from("t1")).await;
        assert_storage_error!(result, Connection);

        store.set_read_failure(None);
        assert_eq!(store.list(&TenantId::from("t1")).await.unwrap().len(), 1);
    }

    #[test]
    fn test_epoch_clock_starts_at_epoch() {
        assert_eq!(epoch_clock().now_secs(), TEST_EPOCH_SECS);
    }
}
