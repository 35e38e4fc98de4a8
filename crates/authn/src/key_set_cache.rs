//! Per-tenant cache of published key sets.
//!
//! # Architecture
//!
//! ```text
//! lookup(tenant, kid)
//!   │
//!   ├─ fresh snapshot has kid ───────────────────────────► hit
//!   │
//!   ├─ refresh already in flight, stale snapshot has kid ─► stale hit (reader never waits)
//!   │
//!   └─ take tenant gate ─► snapshot replaced meanwhile? ──► answer from it
//!                        └► fetch (bounded by timeout) ──► swap snapshot
//!                              │
//!                              └─ transient failure ─────► stale hit within max_staleness
//!                                                          or KeyFetchUnavailable
//! ```
//!
//! Snapshots are immutable and swapped whole under a short write lock, so a
//! lookup abandoned mid-fetch (for example by a request deadline) leaves the
//! previous snapshot in place.
//!
//! Fallback only applies to transient errors (connection, timeout). A
//! definitive answer from the source such as "tenant not found" is never
//! papered over with cached data.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use warden_storage::{Clock, KeyId, StorageError, StorageResult, SystemClock, TenantId};

use crate::{
    config::{KeySetCacheConfig, to_chrono},
    error::VerificationError,
    jwt::decoding_key,
    key_store::PublishedKeySet,
    tenant_lock::TenantLocks,
};

/// Where the cache gets key sets from.
///
/// [`KeyStore`](crate::KeyStore) implements this for in-process
/// verification; [`HttpKeySetSource`](crate::HttpKeySetSource) reads a
/// remote JWKS endpoint.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetches the current key set for `tenant_id`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the tenant has no keys; transient
    /// errors (`Connection`, `Timeout`) let the cache fall back to stale data.
    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet>;
}

#[async_trait]
impl<S: KeySetSource + ?Sized> KeySetSource for Arc<S> {
    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet> {
        (**self).fetch(tenant_id).await
    }
}

struct CachedKey {
    key_id: KeyId,
    expires_at: Option<DateTime<Utc>>,
    decoding_key: Arc<DecodingKey>,
}

struct Snapshot {
    set: PublishedKeySet,
    cached_at: DateTime<Utc>,
    ttl: Duration,
    generation: u64,
    keys: Vec<CachedKey>,
}

impl Snapshot {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.cached_at + to_chrono(self.ttl)
    }

    fn within_staleness(&self, now: DateTime<Utc>, max_staleness: Duration) -> bool {
        now <= self.cached_at + to_chrono(max_staleness)
    }

    fn keys_for(&self, kid: &KeyId, now: DateTime<Utc>) -> Vec<Arc<DecodingKey>> {
        self.keys
            .iter()
            .filter(|k| &k.key_id == kid && k.expires_at.is_none_or(|deadline| now <= deadline))
            .map(|k| Arc::clone(&k.decoding_key))
            .collect()
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySetCacheMetrics {
    /// Lookups answered from a fresh snapshot.
    pub hits: u64,
    /// Lookups that missed the fresh snapshot.
    pub misses: u64,
    /// Lookups answered from a stale snapshot.
    pub stale_served: u64,
    /// Fetches issued to the source.
    pub fetches: u64,
    /// Fetches that failed.
    pub fetch_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
}

/// Read-mostly cache of per-tenant key sets with single-flight refresh.
pub struct KeySetCache {
    source: Arc<dyn KeySetSource>,
    config: KeySetCacheConfig,
    clock: Arc<dyn Clock>,
    snapshots: RwLock<HashMap<TenantId, Arc<Snapshot>>>,
    gates: TenantLocks,
    generation: AtomicU64,
    counters: Counters,
}

impl fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetCache")
            .field("config", &self.config)
            .field("tenants", &self.snapshots.read().len())
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl KeySetCache {
    /// Creates an empty cache.
    #[builder]
    pub fn new(
        source: Arc<dyn KeySetSource>,
        #[builder(default)] config: KeySetCacheConfig,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            config,
            clock,
            snapshots: RwLock::new(HashMap::new()),
            gates: TenantLocks::new(),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Decoding keys published under `kid` for `tenant_id`.
    ///
    /// More than one key may share a `kid`; the caller tries each.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::UnknownKey`] if `kid` is absent after one refetch
    /// - [`VerificationError::KeyFetchUnavailable`] if the source failed and no usable cached copy exists
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, kid = %kid))]
    pub async fn lookup(
        &self,
        tenant_id: &TenantId,
        kid: &KeyId,
    ) -> Result<Vec<Arc<DecodingKey>>, VerificationError> {
        let now = self.clock.now();
        let cached = self.snapshot(tenant_id);

        if let Some(snapshot) = &cached
            && snapshot.is_fresh(now)
        {
            let keys = snapshot.keys_for(kid, now);
            if !keys.is_empty() {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = "snapshot", "cache hit");
                return Ok(keys);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = "snapshot", "cache miss");

        let _permit = match self.gates.try_lock(tenant_id) {
            Some(permit) => permit,
            None => {
                if let Some(keys) = self.serve_stale(cached.as_deref(), kid, now) {
                    tracing::debug!("refresh in flight, serving stale key set");
                    return Ok(keys);
                }
                self.gates.lock(tenant_id).await
            },
        };

        let seen_generation = cached.as_ref().map(|s| s.generation);
        if let Some(current) = self.snapshot(tenant_id)
            && Some(current.generation) != seen_generation
            && current.is_fresh(now)
        {
            let keys = current.keys_for(kid, now);
            return if keys.is_empty() {
                Err(VerificationError::unknown_key(tenant_id, kid.as_str()))
            } else {
                Ok(keys)
            };
        }

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        match self.fetch(tenant_id).await {
            Ok(set) => {
                let snapshot = self.install(set, now);
                let keys = snapshot.keys_for(kid, now);
                if keys.is_empty() {
                    tracing::debug!("kid absent after refetch");
                    Err(VerificationError::unknown_key(tenant_id, kid.as_str()))
                } else {
                    Ok(keys)
                }
            },
            Err(StorageError::NotFound { .. }) => {
                self.snapshots.write().remove(tenant_id);
                Err(VerificationError::unknown_key(tenant_id, kid.as_str()))
            },
            Err(err) => {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                if err.is_transient()
                    && let Some(keys) = self.serve_stale(cached.as_deref(), kid, now)
                {
                    tracing::warn!(
                        error = %err,
                        "key set source unavailable, serving stale key set"
                    );
                    return Ok(keys);
                }
                tracing::warn!(error = %err, "key set fetch failed with no usable fallback");
                Err(VerificationError::KeyFetchUnavailable { tenant_id: tenant_id.clone(), source: err })
            },
        }
    }

    /// Drops the cached snapshot for `tenant_id`.
    pub fn invalidate(&self, tenant_id: &TenantId) {
        if self.snapshots.write().remove(tenant_id).is_some() {
            tracing::info!(tenant_id = %tenant_id, "key set invalidated");
        }
    }

    /// The key set currently cached for `tenant_id`.
    #[must_use]
    pub fn cached_set(&self, tenant_id: &TenantId) -> Option<PublishedKeySet> {
        self.snapshot(tenant_id).map(|s| s.set.clone())
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> KeySetCacheMetrics {
        KeySetCacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            fetch_failures: self.counters.fetch_failures.load(Ordering::Relaxed),
        }
    }

    fn snapshot(&self, tenant_id: &TenantId) -> Option<Arc<Snapshot>> {
        self.snapshots.read().get(tenant_id).cloned()
    }

    fn serve_stale(
        &self,
        cached: Option<&Snapshot>,
        kid: &KeyId,
        now: DateTime<Utc>,
    ) -> Option<Vec<Arc<DecodingKey>>> {
        let snapshot = cached?;
        if !snapshot.within_staleness(now, self.config.max_staleness) {
            return None;
        }
        let keys = snapshot.keys_for(kid, now);
        if keys.is_empty() {
            return None;
        }
        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
        Some(keys)
    }

    async fn fetch(&self, tenant_id: &TenantId) -> StorageResult<PublishedKeySet> {
        fail_point!("key-set-fetch", |_| {
            Err(StorageError::connection("injected key set fetch failure"))
        });

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch(tenant_id))
            .await
            .unwrap_or_else(|_| Err(StorageError::timeout()));
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "key set fetch finished"
        );
        result
    }

    fn install(&self, set: PublishedKeySet, now: DateTime<Utc>) -> Arc<Snapshot> {
        let keys = set
            .keys
            .iter()
            .filter_map(|key| match decoding_key(&key.public_key) {
                Ok(decoding_key) => Some(CachedKey {
                    key_id: key.key_id.clone(),
                    expires_at: key.expires_at,
                    decoding_key: Arc::new(decoding_key),
                }),
                Err(err) => {
                    tracing::warn!(kid = %key.key_id, error = %err, "skipping unusable published key");
                    None
                },
            })
            .collect();

        let snapshot = Arc::new(Snapshot {
            ttl: set.ttl.min(self.config.ttl),
            cached_at: now,
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            keys,
            set,
        });
        self.snapshots.write().insert(snapshot.set.tenant_id.clone(), Arc::clone(&snapshot));
        snapshot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use warden_storage::{ManualClock, testutil::epoch_clock};

    use super::*;
    use crate::testutil::{StaticKeySetSource, published_set};

    fn cache(source: &Arc<StaticKeySetSource>, clock: &ManualClock) -> KeySetCache {
        KeySetCache::builder()
            .source(Arc::clone(source) as Arc<dyn KeySetSource>)
            .clock(Arc::new(clock.clone()) as Arc<dyn Clock>)
            .build()
    }

    fn tenant() -> TenantId {
        TenantId::from("acme")
    }

    #[tokio::test]
    async fn test_hit_after_first_fetch() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);

        assert_eq!(cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap().len(), 1);
        assert_eq!(cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap().len(), 1);

        assert_eq!(source.fetch_count(), 1);
        let metrics = cache.metrics();
        assert_eq!((metrics.hits, metrics.misses, metrics.fetches), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_once() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        let err = cache.lookup(&tenant(), &KeyId::from("k2")).await.err().unwrap();
        assert!(matches!(err, VerificationError::UnknownKey { .. }));
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_new_kid_found_on_refetch() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        source.set(published_set("acme", &["k1", "k2"], clock.now()));
        assert!(cache.lookup(&tenant(), &KeyId::from("k2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_ttl_expiry_triggers_refetch() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        clock.advance(ChronoDuration::seconds(301));
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_serves_stale() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        clock.advance(ChronoDuration::seconds(600));
        source.set_failure(Some(StorageError::connection("refused")));
        assert!(cache.lookup(&tenant(), &KeyId::from("k1")).await.is_ok());
        let metrics = cache.metrics();
        assert_eq!(metrics.stale_served, 1);
        assert_eq!(metrics.fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_stale_beyond_max_staleness_is_unavailable() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        clock.advance(ChronoDuration::seconds(3_601));
        source.set_failure(Some(StorageError::timeout()));
        let err = cache.lookup(&tenant(), &KeyId::from("k1")).await.err().unwrap();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_non_transient_failure_skips_fallback() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        clock.advance(ChronoDuration::seconds(301));
        source.set_failure(Some(StorageError::internal("corrupt")));
        let err = cache.lookup(&tenant(), &KeyId::from("k1")).await.err().unwrap();
        assert!(matches!(err, VerificationError::KeyFetchUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_tenant_is_unknown_key() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        let cache = cache(&source, &clock);
        let err = cache.lookup(&TenantId::from("ghost"), &KeyId::from("k1")).await.err().unwrap();
        assert!(matches!(err, VerificationError::UnknownKey { .. }));
    }

    #[tokio::test]
    async fn test_expired_retiring_key_not_served() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        let mut set = published_set("acme", &["old"], clock.now());
        set.keys[0].expires_at = Some(clock.now() + ChronoDuration::seconds(90));
        source.set(set);
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("old")).await.unwrap();

        clock.advance(ChronoDuration::seconds(120));
        let err = cache.lookup(&tenant(), &KeyId::from("old")).await.err().unwrap();
        assert!(matches!(err, VerificationError::UnknownKey { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        source.set_delay(Some(Duration::from_secs(10)));
        let cache = cache(&source, &clock);

        let err = cache.lookup(&tenant(), &KeyId::from("k1")).await.err().unwrap();
        assert!(matches!(
            err,
            VerificationError::KeyFetchUnavailable { source: StorageError::Timeout, .. }
        ));
        assert!(cache.cached_set(&tenant()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lookup_keeps_previous_snapshot() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();
        let before = cache.cached_set(&tenant()).unwrap();

        source.set(published_set("acme", &["k1", "k2"], clock.now()));
        source.set_delay(Some(Duration::from_secs(1)));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            cache.lookup(&tenant(), &KeyId::from("k2")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cache.cached_set(&tenant()).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_single_flight() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        source.set_delay(Some(Duration::from_millis(50)));
        let cache = Arc::new(cache(&source, &clock));

        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.lookup(&tenant(), &KeyId::from("k1")).await })
            })
            .collect();
        for lookup in lookups {
            lookup.await.unwrap().unwrap();
        }
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_readers_do_not_wait_for_refresh() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = Arc::new(cache(&source, &clock));
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        clock.advance(ChronoDuration::seconds(301));
        source.set_delay(Some(Duration::from_secs(1)));
        let refresher = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.lookup(&tenant(), &KeyId::from("k1")).await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(cache.metrics().stale_served, 1);
        refresher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let clock = epoch_clock();
        let source = Arc::new(StaticKeySetSource::new());
        source.set(published_set("acme", &["k1"], clock.now()));
        let cache = cache(&source, &clock);
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();

        cache.invalidate(&tenant());
        assert!(cache.cached_set(&tenant()).is_none());
        cache.lookup(&tenant(), &KeyId::from("k1")).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }
}
