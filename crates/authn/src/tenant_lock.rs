//! Per-tenant async mutexes.
//!
//! A tenant's mutex lives in the map only while some caller holds or waits
//! on it. The last one out removes the entry, so tenant ids supplied by
//! callers never accumulate.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use warden_storage::TenantId;

#[derive(Debug, Default)]
pub(crate) struct TenantLocks {
    locks: Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on one tenant. Released on drop.
pub(crate) struct TenantGuard<'a> {
    // Declared first so the mutex is released before the entry is checked.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

struct Registration<'a> {
    locks: &'a TenantLocks,
    tenant_id: TenantId,
    mutex: Option<Arc<AsyncMutex<()>>>,
}

impl Registration<'_> {
    fn mutex(&self) -> Arc<AsyncMutex<()>> {
        self.mutex.as_ref().map(Arc::clone).unwrap_or_default()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock();
        self.mutex = None;
        // Clones are only made under the map lock, so a count of one here
        // means nobody else can be holding or waiting.
        if locks.get(&self.tenant_id).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.tenant_id);
        }
    }
}

impl TenantLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, tenant_id: &TenantId) -> Registration<'_> {
        let mutex = Arc::clone(self.locks.lock().entry(tenant_id.clone()).or_default());
        Registration { locks: self, tenant_id: tenant_id.clone(), mutex: Some(mutex) }
    }

    /// Waits for exclusive access to `tenant_id`.
    pub(crate) async fn lock(&self, tenant_id: &TenantId) -> TenantGuard<'_> {
        let registration = self.register(tenant_id);
        let guard = registration.mutex().lock_owned().await;
        TenantGuard { _guard: guard, _registration: registration }
    }

    /// Takes `tenant_id` if nobody holds it.
    pub(crate) fn try_lock(&self, tenant_id: &TenantId) -> Option<TenantGuard<'_>> {
        let registration = self.register(tenant_id);
        let guard = registration.mutex().try_lock_owned().ok()?;
        Some(TenantGuard { _guard: guard, _registration: registration })
    }

    /// Tenants currently held or waited on.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
