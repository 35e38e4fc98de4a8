//! The audit engine.
//!
//! [`AuditEngine::log`] is synchronous and never waits on storage: it seals
//! the entry, appends it to an in-memory batch, and fans it out to
//! subscribers. A background flusher (see [`AuditEngine::start`]) writes the
//! batch to the [`AuditLogStore`] whenever the flush interval elapses or the
//! batch fills, whichever comes first.
//!
//! # Flush failures
//!
//! - Transient store errors put the batch back at the head of the queue so the next attempt
//!   preserves ordering, and the flusher backs off per `flush_retry`.
//! - `AlreadyExists` means an earlier attempt committed without acknowledging. Entries already
//!   stored count as flushed and only the rest are written again.
//! - Any other error drops the batch; it is counted in `dropped`.
//!
//! The queue never holds more than `max_pending` entries. The oldest are
//! dropped first and counted.
//!
//! # Channels
//!
//! - [`subscribe`](AuditEngine::subscribe): every sealed entry.
//! - [`subscribe_high_risk`](AuditEngine::subscribe_high_risk): only entries whose score reaches
//!   the configured high-risk threshold. These are sent from inside `log`, before the entry is
//!   persisted.
//!
//! Both are `tokio::sync::broadcast` channels; slow receivers observe
//! `RecvError::Lagged` rather than slowing down `log`.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{Notify, broadcast},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warden_storage::{Clock, StorageError, SystemClock, compute_backoff};

use crate::{
    checksum::{self, IntegrityKey},
    compliance::ComplianceRules,
    config::AuditConfig,
    entry::{Actor, AuditLogEntry, NewAuditEntry},
    error::{AuditError, Result},
    retention::{ArchiveDestination, RetentionPolicy},
    risk::{RiskPolicy, RiskSignals, quantize},
    sink::AuditSink,
    store::{AuditLogStore, AuditPage, AuditQuery},
};

/// Upper bound on tracked `(actor, origin)` pairs.
const MAX_TRACKED_ORIGINS: u64 = 100_000;

#[derive(Debug, Default)]
struct Counters {
    logged: AtomicU64,
    high_risk: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditMetricsSnapshot {
    /// Entries sealed by `log`.
    pub logged: u64,
    /// Entries that reached the high-risk threshold.
    pub high_risk: u64,
    /// Entries written to the store.
    pub flushed: u64,
    /// Flush attempts that returned a store error.
    pub flush_failures: u64,
    /// Entries discarded, either rejected permanently by the store or shed
    /// past `max_pending`.
    pub dropped: u64,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn AuditLogStore>,
    pub(crate) config: AuditConfig,
    risk_policy: RiskPolicy,
    compliance_rules: ComplianceRules,
    pub(crate) integrity_key: IntegrityKey,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retention: RwLock<Option<RetentionPolicy>>,
    pub(crate) archive: Option<Arc<dyn ArchiveDestination>>,
    pending: Mutex<Vec<AuditLogEntry>>,
    flush_signal: Arc<Notify>,
    flush_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<AuditLogEntry>,
    high_risk: broadcast::Sender<AuditLogEntry>,
    known_origins: Cache<(String, String), ()>,
    actors_with_origin: Cache<String, ()>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Scores, seals, batches and persists security events.
///
/// Cloning is cheap; clones share the batch, channels and background tasks.
///
/// ```no_run
/// use std::sync::Arc;
/// use warden_audit::{Actor, ActorType, AuditEngine, MemoryAuditLogStore, NewAuditEntry, Outcome, Resource};
///
/// # async fn example() -> warden_audit::Result<()> {
/// let engine = AuditEngine::builder().store(Arc::new(MemoryAuditLogStore::new())).build();
/// engine.start();
///
/// let entry = engine.log(
///     NewAuditEntry::builder()
///         .actor(Actor::new("user-42", ActorType::User))
///         .action("session.issue")
///         .resource(Resource::new("session", "s-1"))
///         .outcome(Outcome::Success)
///         .build(),
/// );
/// assert!(engine.verify_integrity(entry.id).await?);
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AuditEngine {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for AuditEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditEngine")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl AuditEngine {
    /// Creates an engine. Call [`start`](Self::start) to run the flusher.
    ///
    /// `integrity_key` seals every entry. Without one a random key is used,
    /// and entries written by this engine will not verify after a restart.
    #[builder]
    pub fn new(
        store: Arc<dyn AuditLogStore>,
        #[builder(default)] config: AuditConfig,
        #[builder(default)] risk_policy: RiskPolicy,
        #[builder(default)] compliance_rules: ComplianceRules,
        #[builder(default = IntegrityKey::generate())] integrity_key: IntegrityKey,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        retention: Option<RetentionPolicy>,
        archive: Option<Arc<dyn ArchiveDestination>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.channel_capacity);
        let (high_risk, _) = broadcast::channel(config.channel_capacity);
        let known_origins = Cache::builder()
            .max_capacity(MAX_TRACKED_ORIGINS)
            .time_to_live(config.known_origin_ttl)
            .build();
        let actors_with_origin = Cache::builder()
            .max_capacity(MAX_TRACKED_ORIGINS)
            .time_to_live(config.known_origin_ttl)
            .build();

        Self {
            inner: Arc::new(Inner {
                store,
                config,
                risk_policy,
                compliance_rules,
                integrity_key,
                clock,
                retention: RwLock::new(retention),
                archive,
                pending: Mutex::new(Vec::new()),
                flush_signal: Arc::new(Notify::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                events,
                high_risk,
                known_origins,
                actors_with_origin,
                cancel: CancellationToken::new(),
                flusher: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Spawns the background flusher. Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start(&self) {
        let mut slot = self.inner.flusher.lock();
        if slot.is_some() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = self.inner.cancel.clone();
        let signal = Arc::clone(&self.inner.flush_signal);
        let interval = self.inner.config.flush_interval;
        let retry = self.inner.config.flush_retry.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!("audit flusher shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                    () = signal.notified() => {}
                }

                let Some(inner) = weak.upgrade() else { break };
                // Failures are logged and settled inside flush.
                if (AuditEngine { inner }).flush().await.is_ok() {
                    failures = 0;
                    continue;
                }

                let delay = compute_backoff(&retry, failures);
                failures = failures.saturating_add(1);
                tracing::debug!(delay_ms = delay.as_millis() as u64, failures, "audit flusher backing off");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }));
    }

    /// Stops background tasks and writes whatever is still batched.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.flusher.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "audit flusher task panicked");
        }
        if let Err(err) = self.flush().await {
            tracing::error!(error = %err, pending = self.pending_len(), "final audit flush failed");
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.inner.config
    }

    /// Entries sealed but not yet written to the store.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> AuditMetricsSnapshot {
        let c = &self.inner.counters;
        AuditMetricsSnapshot {
            logged: c.logged.load(Ordering::Relaxed),
            high_risk: c.high_risk.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Receives every sealed entry.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuditLogEntry> {
        self.inner.events.subscribe()
    }

    /// Receives entries at or above the high-risk threshold.
    #[must_use]
    pub fn subscribe_high_risk(&self) -> broadcast::Receiver<AuditLogEntry> {
        self.inner.high_risk.subscribe()
    }

    /// Seals an event and queues it for persistence.
    ///
    /// The returned entry is final: its id, timestamp, risk score, compliance
    /// flags and checksum never change.
    pub fn log(&self, event: NewAuditEntry) -> AuditLogEntry {
        let inner = &self.inner;
        let unfamiliar_origin = self.observe_origin(&event.actor);

        let mut risk_score = inner.risk_policy.score(&RiskSignals {
            action: &event.action,
            outcome: event.outcome,
            actor_type: event.actor.actor_type,
            unfamiliar_origin,
            resource_type: &event.resource.resource_type,
        });
        if let Some(floor) = event.risk_floor
            && floor.is_finite()
        {
            risk_score = risk_score.max(quantize(floor.clamp(0.0, 1.0)));
        }

        let compliance_flags = inner.compliance_rules.tags_for(&event.resource.resource_type);
        let mut entry = AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: inner.clock.now(),
            actor: event.actor,
            action: event.action,
            resource: event.resource,
            outcome: event.outcome,
            risk_score,
            compliance_flags,
            metadata: event.metadata,
            supersedes: event.supersedes,
            integrity_checksum: String::new(),
        };
        entry.integrity_checksum = checksum::compute(&inner.integrity_key, &entry);

        let (batch_full, shed) = {
            let mut pending = inner.pending.lock();
            pending.push(entry.clone());
            let shed = shed_overflow(&mut pending, inner.config.max_pending);
            (pending.len() >= inner.config.batch_size, shed)
        };
        self.record_shed(shed);
        if batch_full {
            inner.flush_signal.notify_one();
        }
        inner.counters.logged.fetch_add(1, Ordering::Relaxed);

        // A send error only means nobody is subscribed.
        let _ = inner.events.send(entry.clone());
        if risk_score >= inner.config.high_risk_threshold {
            inner.counters.high_risk.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                entry_id = %entry.id,
                action = %entry.action,
                actor = %entry.actor.id,
                risk_score,
                "high-risk audit event"
            );
            let _ = inner.high_risk.send(entry.clone());
        }

        entry
    }

    /// Logs `event` as a correction of an existing entry.
    ///
    /// # Errors
    ///
    /// [`AuditError::EntryNotFound`] if `original_id` is unknown, or a store
    /// error from the lookup.
    pub async fn log_correction(
        &self,
        original_id: Uuid,
        mut event: NewAuditEntry,
    ) -> Result<AuditLogEntry> {
        if self.get(original_id).await?.is_none() {
            return Err(AuditError::EntryNotFound(original_id));
        }
        event.supersedes = Some(original_id);
        Ok(self.log(event))
    }

    /// Writes the current batch to the store.
    ///
    /// Returns the number of entries now persisted.
    ///
    /// # Errors
    ///
    /// Returns the store error. A transient failure leaves the batch at the
    /// head of the queue; any other failure drops it.
    pub async fn flush(&self) -> Result<usize> {
        let _serialized = self.inner.flush_lock.lock().await;
        let batch = std::mem::take(&mut *self.inner.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let err = match self.inner.store.append_batch(&batch).await {
            Ok(()) => return Ok(self.count_flushed(batch.len())),
            Err(err) => err,
        };
        self.inner.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
        match err {
            StorageError::AlreadyExists { .. } => self.write_unstored(batch).await,
            err => Err(self.settle_failed(batch, err)),
        }
    }

    /// Re-sends the entries of `batch` the store does not have yet.
    async fn write_unstored(&self, batch: Vec<AuditLogEntry>) -> Result<usize> {
        let mut stored = HashSet::with_capacity(batch.len());
        for entry in &batch {
            match self.inner.store.get(entry.id).await {
                Ok(Some(_)) => {
                    stored.insert(entry.id);
                },
                Ok(None) => {},
                Err(err) => return Err(self.settle_failed(batch, err)),
            }
        }

        let (already, unstored): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|e| stored.contains(&e.id));
        tracing::warn!(
            already_stored = already.len(),
            remaining = unstored.len(),
            "audit batch was partly persisted by an earlier attempt"
        );
        let already = self.count_flushed(already.len());
        if unstored.is_empty() {
            return Ok(already);
        }

        match self.inner.store.append_batch(&unstored).await {
            Ok(()) => Ok(already + self.count_flushed(unstored.len())),
            Err(err) => Err(self.settle_failed(unstored, err)),
        }
    }

    fn count_flushed(&self, written: usize) -> usize {
        self.inner.counters.flushed.fetch_add(written as u64, Ordering::Relaxed);
        tracing::debug!(batch_len = written, "audit batch flushed");
        written
    }

    /// Re-queues `batch` if `err` is transient and drops it otherwise.
    fn settle_failed(&self, batch: Vec<AuditLogEntry>, err: StorageError) -> AuditError {
        if err.is_transient() {
            tracing::error!(error = %err, batch_len = batch.len(), "audit flush failed; batch re-queued");
            let shed = {
                let mut pending = self.inner.pending.lock();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                shed_overflow(&mut pending, self.inner.config.max_pending)
            };
            self.record_shed(shed);
        } else {
            self.inner.counters.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::error!(
                error = %err,
                batch_len = batch.len(),
                "audit store rejected batch; entries dropped"
            );
        }
        err.into()
    }

    fn record_shed(&self, shed: usize) {
        if shed > 0 {
            self.inner.counters.dropped.fetch_add(shed as u64, Ordering::Relaxed);
            tracing::error!(
                dropped = shed,
                max_pending = self.inner.config.max_pending,
                "audit queue full; oldest entries dropped"
            );
        }
    }

    /// Fetches one entry, whether still batched or already persisted.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<AuditLogEntry>> {
        let batched = self.inner.pending.lock().iter().find(|e| e.id == id).cloned();
        if batched.is_some() {
            return Ok(batched);
        }
        Ok(self.inner.store.get(id).await?)
    }

    /// Runs a query against persisted entries.
    ///
    /// The current batch is flushed first. If that flush fails the query
    /// still runs, without the batched entries.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    #[tracing::instrument(skip(self, query))]
    pub async fn query(&self, query: &AuditQuery) -> Result<AuditPage> {
        self.flush_for_read().await;
        Ok(self.inner.store.query(query).await?)
    }

    /// Recomputes the checksum of a persisted entry.
    ///
    /// Returns `false` if the stored content no longer matches its checksum.
    ///
    /// # Errors
    ///
    /// [`AuditError::EntryNotFound`] if no entry has this id.
    pub async fn verify_integrity(&self, id: Uuid) -> Result<bool> {
        self.flush_for_read().await;
        let entry = self.inner.store.get(id).await?.ok_or(AuditError::EntryNotFound(id))?;
        let intact = entry.verify_checksum(&self.inner.integrity_key);
        if !intact {
            tracing::error!(entry_id = %id, "audit entry failed integrity verification");
        }
        Ok(intact)
    }

    pub(crate) async fn flush_for_read(&self) {
        if let Err(err) = self.flush().await {
            tracing::warn!(error = %err, "reading audit log without batched entries");
        }
    }

    /// Records the actor's origin and reports whether it was unfamiliar.
    ///
    /// An origin is unfamiliar when the actor has been seen from some other
    /// origin within the tracking window but never from this one.
    fn observe_origin(&self, actor: &Actor) -> bool {
        let Some(ip) = actor.ip.as_deref() else {
            return false;
        };
        let key = (actor.id.clone(), ip.to_owned());
        let known = self.inner.known_origins.contains_key(&key);
        let has_history = self.inner.actors_with_origin.contains_key(&actor.id);
        self.inner.known_origins.insert(key, ());
        self.inner.actors_with_origin.insert(actor.id.clone(), ());
        has_history && !known
    }
}

/// Drops the oldest entries beyond `max`; returns how many.
fn shed_overflow(pending: &mut Vec<AuditLogEntry>, max: usize) -> usize {
    let overflow = pending.len().saturating_sub(max);
    pending.drain(..overflow);
    overflow
}

#[async_trait]
impl AuditSink for AuditEngine {
    async fn record(&self, event: NewAuditEntry) {
        self.log(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::{sync::atomic::AtomicBool, time::Duration};

    use chrono::{DateTime, Utc};
    use tokio::sync::broadcast::error::TryRecvError;
    use warden_storage::{RetryConfig, StorageResult};

    use super::*;
    use crate::{
        compliance::ComplianceRegime,
        entry::{ActorType, Outcome, Resource},
        store::MemoryAuditLogStore,
    };

    fn event(action: &str) -> NewAuditEntry {
        NewAuditEntry::builder()
            .actor(Actor::new("user-1", ActorType::User))
            .action(action)
            .resource(Resource::new("session", "s-1"))
            .outcome(Outcome::Success)
            .build()
    }

    fn engine_with(store: Arc<MemoryAuditLogStore>, config: AuditConfig) -> AuditEngine {
        AuditEngine::builder().store(store).config(config).build()
    }

    /// Store whose appends fail while `failing` is set, are refused while
    /// `rejecting` is set, and commit without acknowledging while
    /// `losing_acks` is set.
    #[derive(Default)]
    struct SwitchableStore {
        inner: MemoryAuditLogStore,
        failing: AtomicBool,
        rejecting: AtomicBool,
        losing_acks: AtomicBool,
        appends: AtomicU64,
    }

    #[async_trait]
    impl AuditLogStore for SwitchableStore {
        async fn append_batch(&self, entries: &[AuditLogEntry]) -> StorageResult<()> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::connection("store offline"));
            }
            if self.rejecting.load(Ordering::SeqCst) {
                return Err(StorageError::serialization("entry too large"));
            }
            self.inner.append_batch(entries).await?;
            if self.losing_acks.load(Ordering::SeqCst) {
                return Err(StorageError::timeout());
            }
            Ok(())
        }

        async fn get(&self, id: Uuid) -> StorageResult<Option<AuditLogEntry>> {
            self.inner.get(id).await
        }

        async fn query(&self, query: &AuditQuery) -> StorageResult<AuditPage> {
            self.inner.query(query).await
        }

        async fn older_than(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StorageResult<Vec<AuditLogEntry>> {
            self.inner.older_than(cutoff, limit).await
        }

        async fn delete(&self, ids: &[Uuid]) -> StorageResult<usize> {
            self.inner.delete(ids).await
        }
    }

    #[tokio::test]
    async fn test_log_seals_entry() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let entry = engine.log(
            NewAuditEntry::builder()
                .actor(Actor::new("svc-billing", ActorType::Service))
                .action("invoice.read")
                .resource(Resource::new("payment", "inv-9"))
                .outcome(Outcome::Success)
                .build(),
        );

        assert!(entry.verify_checksum(&engine.inner.integrity_key));
        assert!(entry.compliance_flags.contains(&ComplianceRegime::PciDss));
        assert!((0.0..=1.0).contains(&entry.risk_score));
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(engine.metrics().logged, 1);
    }

    #[tokio::test]
    async fn test_verify_integrity_detects_tampering() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let engine = engine_with(Arc::clone(&store), AuditConfig::default());
        let entry = engine.log(event("session.issue"));

        assert!(engine.verify_integrity(entry.id).await.unwrap());
        assert!(store.tamper_with(entry.id, |e| e.outcome = Outcome::Failure));
        assert!(!engine.verify_integrity(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resealed_entry_fails_without_engine_key() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let engine = engine_with(Arc::clone(&store), AuditConfig::default());
        let entry = engine.log(event("session.issue"));
        engine.flush().await.unwrap();

        let forger = IntegrityKey::generate();
        assert!(store.tamper_with(entry.id, |e| {
            e.outcome = Outcome::Failure;
            e.integrity_checksum = checksum::compute(&forger, e);
        }));
        assert!(!engine.verify_integrity(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_key_verifies_across_engines() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let key = IntegrityKey::new(&[42u8; 32]).unwrap();
        let writer = AuditEngine::builder()
            .store(Arc::clone(&store) as Arc<dyn AuditLogStore>)
            .integrity_key(key.clone())
            .build();
        let entry = writer.log(event("session.issue"));
        writer.flush().await.unwrap();

        let reader = AuditEngine::builder()
            .store(Arc::clone(&store) as Arc<dyn AuditLogStore>)
            .integrity_key(key)
            .build();
        assert!(reader.verify_integrity(entry.id).await.unwrap());

        let stranger = engine_with(store, AuditConfig::default());
        assert!(!stranger.verify_integrity(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_integrity_unknown_entry() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let missing = Uuid::new_v4();
        let err = engine.verify_integrity(missing).await.unwrap_err();
        assert!(matches!(err, AuditError::EntryNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_high_risk_channel_only_carries_high_risk() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let mut all = engine.subscribe();
        let mut high = engine.subscribe_high_risk();

        engine.log(event("session.issue"));
        let mut reuse = event("session.reuse_detected");
        reuse.outcome = Outcome::Failure;
        reuse.risk_floor = Some(1.0);
        let flagged = engine.log(reuse);

        assert_eq!(flagged.risk_score, 1.0);
        assert_eq!(high.try_recv().unwrap().id, flagged.id);
        assert!(matches!(high.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(all.try_recv().unwrap().action, "session.issue");
        assert_eq!(all.try_recv().unwrap().id, flagged.id);
        assert_eq!(engine.metrics().high_risk, 1);
    }

    #[tokio::test]
    async fn test_unfamiliar_origin_raises_score() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let from = |ip: &str| {
            let mut e = event("token.verify");
            e.actor = e.actor.with_ip(ip);
            e
        };

        let first = engine.log(from("198.51.100.1"));
        let repeat = engine.log(from("198.51.100.1"));
        let elsewhere = engine.log(from("203.0.113.50"));

        assert_eq!(first.risk_score, repeat.risk_score);
        assert!(elsewhere.risk_score > repeat.risk_score);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let store = Arc::new(SwitchableStore::default());
        let engine = AuditEngine::builder().store(Arc::clone(&store) as Arc<dyn AuditLogStore>).build();

        let a = engine.log(event("session.issue"));
        store.failing.store(true, Ordering::SeqCst);
        assert!(engine.flush().await.is_err());
        let b = engine.log(event("session.refresh"));
        assert_eq!(engine.pending_len(), 2);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(engine.flush().await.unwrap(), 2);
        let page = engine
            .query(&AuditQuery::builder().order(crate::store::SortOrder::Ascending).build())
            .await
            .unwrap();
        let ids: Vec<Uuid> = page.entries.iter().map(|e| e.id).collect();
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
        assert_eq!(engine.metrics().flush_failures, 1);
        assert_eq!(engine.metrics().flushed, 2);
    }

    #[tokio::test]
    async fn test_unacknowledged_write_is_not_duplicated() {
        let store = Arc::new(SwitchableStore::default());
        let engine = AuditEngine::builder().store(Arc::clone(&store) as Arc<dyn AuditLogStore>).build();

        let a = engine.log(event("session.issue"));
        store.losing_acks.store(true, Ordering::SeqCst);
        let err = engine.flush().await.unwrap_err();
        assert!(matches!(err, AuditError::Storage(StorageError::Timeout)));
        assert_eq!(engine.pending_len(), 1);

        store.losing_acks.store(false, Ordering::SeqCst);
        let b = engine.log(event("session.refresh"));
        assert_eq!(engine.flush().await.unwrap(), 2);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.inner.len(), 2);
        assert!(engine.verify_integrity(a.id).await.unwrap());
        assert!(engine.verify_integrity(b.id).await.unwrap());

        // Nothing left to retry.
        assert_eq!(engine.flush().await.unwrap(), 0);
        let metrics = engine.metrics();
        assert_eq!(metrics.flushed, 2);
        assert_eq!(metrics.dropped, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_batch() {
        let store = Arc::new(SwitchableStore::default());
        let engine = AuditEngine::builder().store(Arc::clone(&store) as Arc<dyn AuditLogStore>).build();

        engine.log(event("session.issue"));
        engine.log(event("session.refresh"));
        store.rejecting.store(true, Ordering::SeqCst);
        assert!(engine.flush().await.is_err());
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.metrics().dropped, 2);

        store.rejecting.store(false, Ordering::SeqCst);
        assert_eq!(engine.flush().await.unwrap(), 0);
        assert_eq!(store.appends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_is_capped_oldest_first() {
        let store = Arc::new(SwitchableStore::default());
        let config = AuditConfig::builder().batch_size(2).max_pending(3).build().unwrap();
        let engine = AuditEngine::builder()
            .store(Arc::clone(&store) as Arc<dyn AuditLogStore>)
            .config(config)
            .build();
        store.failing.store(true, Ordering::SeqCst);

        let logged: Vec<_> = (0..3).map(|i| engine.log(event(&format!("action.{i}")))).collect();
        assert!(engine.flush().await.is_err());
        let newer: Vec<_> = (3..5).map(|i| engine.log(event(&format!("action.{i}")))).collect();

        assert_eq!(engine.pending_len(), 3);
        assert_eq!(engine.metrics().dropped, 2);
        assert!(engine.get(logged[0].id).await.unwrap().is_none());
        assert!(engine.get(logged[1].id).await.unwrap().is_none());
        assert!(engine.get(logged[2].id).await.unwrap().is_some());
        assert!(engine.get(newer[1].id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_backs_off_while_store_is_down() {
        let store = Arc::new(SwitchableStore::default());
        let config = AuditConfig::builder()
            .batch_size(1)
            .flush_interval(Duration::from_millis(100))
            .flush_retry(
                RetryConfig::builder()
                    .initial_backoff(Duration::from_secs(1))
                    .max_backoff(Duration::from_secs(1))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let engine = AuditEngine::builder()
            .store(Arc::clone(&store) as Arc<dyn AuditLogStore>)
            .config(config)
            .build();
        store.failing.store(true, Ordering::SeqCst);
        engine.start();

        for _ in 0..50 {
            engine.log(event("token.verify"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 5s of outage with 1-1.5s pauses between attempts.
        let attempts = store.appends.load(Ordering::SeqCst);
        assert!((2..=8).contains(&attempts), "{attempts} flush attempts during outage");

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.inner.len(), 50);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_batch_wakes_flusher() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let config = AuditConfig::builder()
            .batch_size(3)
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        let engine = engine_with(Arc::clone(&store), config);
        engine.start();

        for _ in 0..3 {
            engine.log(event("session.refresh"));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch should flush without waiting for the interval");
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let engine = engine_with(Arc::clone(&store), AuditConfig::default());
        engine.start();

        engine.log(event("session.issue"));
        assert!(store.is_empty());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(store.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let store = Arc::new(MemoryAuditLogStore::new());
        let engine = engine_with(Arc::clone(&store), AuditConfig::default());
        engine.start();
        engine.log(event("session.issue"));
        engine.shutdown().await;
        assert_eq!(store.len(), 1);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_correction_references_original() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let original = engine.log(event("session.revoke"));

        let fix = engine.log_correction(original.id, event("session.revoke")).await.unwrap();
        assert_eq!(fix.supersedes, Some(original.id));
        assert!(fix.verify_checksum(&engine.inner.integrity_key));

        let missing = Uuid::new_v4();
        let err = engine.log_correction(missing, event("session.revoke")).await.unwrap_err();
        assert!(matches!(err, AuditError::EntryNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_engine_as_sink() {
        let engine = engine_with(Arc::default(), AuditConfig::default());
        let sink: Arc<dyn AuditSink> = Arc::new(engine.clone());
        sink.record(event("token.verify")).await;
        assert_eq!(engine.pending_len(), 1);
    }
}
