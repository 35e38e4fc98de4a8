//! Retention: archive, then delete, entries older than the retention period.
//!
//! A sweep walks the store oldest-first in chunks of
//! [`AuditConfig::sweep_batch_size`](crate::AuditConfig::sweep_batch_size).
//! When archiving is enabled a chunk is deleted only after the archive write
//! succeeded; a write that still fails after every retry aborts the sweep
//! with [`AuditError::ArchiveWriteFailed`] and leaves the chunk in place for
//! the next run. An `immutable` policy (legal hold) turns every sweep into a
//! no-op.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warden_storage::{ConfigError, StorageError, StorageResult, with_retry};

use crate::{
    engine::AuditEngine,
    entry::{Actor, AuditLogEntry, NewAuditEntry, Outcome, Resource},
    error::{AuditError, Result},
};

/// How strictly retention treats the audit trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceMode {
    /// Archiving is optional.
    #[default]
    Standard,
    /// Archiving is mandatory and archived entries are integrity-checked first.
    Strict,
}

/// Process-wide retention settings.
///
/// Replacing the policy with
/// [`AuditEngine::set_retention_policy`] affects only sweeps that start
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetentionPolicy")]
pub struct RetentionPolicy {
    #[serde(with = "humantime_serde")]
    pub(crate) retention_period: Duration,
    pub(crate) archive_enabled: bool,
    pub(crate) archive_destination: String,
    pub(crate) compliance_mode: ComplianceMode,
    pub(crate) immutable: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetentionPolicy {
    #[serde(with = "humantime_serde")]
    retention_period: Duration,
    #[serde(default)]
    archive_enabled: bool,
    #[serde(default)]
    archive_destination: String,
    #[serde(default)]
    compliance_mode: ComplianceMode,
    #[serde(default)]
    immutable: bool,
}

impl TryFrom<RawRetentionPolicy> for RetentionPolicy {
    type Error = ConfigError;

    fn try_from(raw: RawRetentionPolicy) -> std::result::Result<Self, ConfigError> {
        let policy = Self {
            retention_period: raw.retention_period,
            archive_enabled: raw.archive_enabled,
            archive_destination: raw.archive_destination,
            compliance_mode: raw.compliance_mode,
            immutable: raw.immutable,
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[bon::bon]
impl RetentionPolicy {
    /// Creates a validated policy.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::BelowMinimum`] for a zero retention period
    /// - [`ConfigError::Invalid`] if strict mode lacks archiving, or archiving lacks a destination
    #[builder]
    pub fn new(
        retention_period: Duration,
        #[builder(default)] archive_enabled: bool,
        #[builder(default, into)] archive_destination: String,
        #[builder(default)] compliance_mode: ComplianceMode,
        #[builder(default)] immutable: bool,
    ) -> std::result::Result<Self, ConfigError> {
        let policy = Self {
            retention_period,
            archive_enabled,
            archive_destination,
            compliance_mode,
            immutable,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks the cross-field rules. Construction and deserialization both
    /// run it.
    ///
    /// # Errors
    ///
    /// See [`RetentionPolicy::new`].
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.retention_period.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "retention_period",
                min: "1s".into(),
                value: "0s".into(),
            });
        }
        if self.compliance_mode == ComplianceMode::Strict && !self.archive_enabled {
            return Err(ConfigError::Invalid("strict compliance mode requires archiving".into()));
        }
        if self.archive_enabled && self.archive_destination.trim().is_empty() {
            return Err(ConfigError::Invalid("archiving requires an archive destination".into()));
        }
        Ok(())
    }

    /// Age after which entries are swept.
    #[must_use]
    pub fn retention_period(&self) -> Duration {
        self.retention_period
    }

    /// Whether entries are archived before deletion.
    #[must_use]
    pub fn archive_enabled(&self) -> bool {
        self.archive_enabled
    }

    /// Where archived entries go (bucket, path, URI).
    #[must_use]
    pub fn archive_destination(&self) -> &str {
        &self.archive_destination
    }

    /// Compliance mode.
    #[must_use]
    pub fn compliance_mode(&self) -> ComplianceMode {
        self.compliance_mode
    }

    /// Legal hold: nothing is deleted while set.
    #[must_use]
    pub fn immutable(&self) -> bool {
        self.immutable
    }
}

/// Long-term storage for entries leaving the live store.
#[async_trait]
pub trait ArchiveDestination: Send + Sync {
    /// Writes a chunk. Must be all-or-nothing from the caller's perspective:
    /// an `Err` means the chunk may be retried in full.
    async fn archive(&self, entries: &[AuditLogEntry]) -> StorageResult<()>;
}

#[async_trait]
impl<A: ArchiveDestination + ?Sized> ArchiveDestination for Arc<A> {
    async fn archive(&self, entries: &[AuditLogEntry]) -> StorageResult<()> {
        (**self).archive(entries).await
    }
}

/// In-memory [`ArchiveDestination`].
#[derive(Debug, Default, Clone)]
pub struct MemoryArchiveDestination {
    archived: Arc<Mutex<Vec<AuditLogEntry>>>,
}

impl MemoryArchiveDestination {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything archived so far, in write order.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.archived.lock().clone()
    }
}

#[async_trait]
impl ArchiveDestination for MemoryArchiveDestination {
    async fn archive(&self, entries: &[AuditLogEntry]) -> StorageResult<()> {
        fail_point!("audit-archive-write", |_| {
            Err(StorageError::connection("injected archive outage"))
        });
        self.archived.lock().extend_from_slice(entries);
        Ok(())
    }
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Entries strictly older than this were eligible.
    pub cutoff: DateTime<Utc>,
    /// Entries written to the archive.
    pub archived: usize,
    /// Entries removed from the live store.
    pub deleted: usize,
    /// Archived entries whose checksum did not verify (strict mode only).
    pub integrity_failures: usize,
    /// The sweep was skipped because the policy is immutable.
    pub held: bool,
}

impl AuditEngine {
    /// The active retention policy, if any.
    #[must_use]
    pub fn retention_policy(&self) -> Option<RetentionPolicy> {
        self.inner.retention.read().clone()
    }

    /// Replaces the retention policy for future sweeps.
    pub fn set_retention_policy(&self, policy: RetentionPolicy) {
        *self.inner.retention.write() = Some(policy);
    }

    /// Runs one retention sweep against the current policy.
    ///
    /// # Errors
    ///
    /// - [`AuditError::Config`] if no policy is set, or archiving is enabled without an attached
    ///   [`ArchiveDestination`]
    /// - [`AuditError::ArchiveWriteFailed`] if an archive write kept failing; the affected chunk and
    ///   everything newer stays in the store
    /// - [`AuditError::Storage`] if reading or deleting failed
    #[tracing::instrument(skip(self))]
    pub async fn run_retention_sweep(&self) -> Result<RetentionReport> {
        let policy = self
            .retention_policy()
            .ok_or_else(|| ConfigError::Invalid("no retention policy configured".into()))?;
        policy.validate()?;

        let period = chrono::Duration::from_std(policy.retention_period).map_err(|_| {
            ConfigError::OutOfRange {
                field: "retention_period",
                range: "representable as a timestamp offset".into(),
                value: format!("{:?}", policy.retention_period),
            }
        })?;
        let cutoff = self.inner.clock.now() - period;
        let mut report = RetentionReport {
            cutoff,
            archived: 0,
            deleted: 0,
            integrity_failures: 0,
            held: policy.immutable,
        };

        if policy.immutable {
            tracing::info!(%cutoff, "retention sweep skipped: audit log is under legal hold");
            return Ok(report);
        }

        let archive = if policy.archive_enabled {
            let destination = self.inner.archive.clone().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "archiving to '{}' is enabled but no archive destination is attached",
                    policy.archive_destination
                ))
            })?;
            Some(destination)
        } else {
            None
        };

        self.flush_for_read().await;
        let chunk_size = self.inner.config.sweep_batch_size;
        let result = self.sweep_chunks(&policy, archive.as_deref(), cutoff, chunk_size, &mut report).await;

        let outcome = if result.is_ok() { Outcome::Success } else { Outcome::Failure };
        self.log(
            NewAuditEntry::builder()
                .actor(Actor::system("retention"))
                .action("audit.retention_sweep")
                .resource(Resource::new("audit_log", "retention"))
                .outcome(outcome)
                .build()
                .with_metadata("archive_destination", &policy.archive_destination)
                .with_metadata("cutoff", cutoff.to_rfc3339())
                .with_metadata("archived", report.archived)
                .with_metadata("deleted", report.deleted),
        );

        result.map(|()| report)
    }

    async fn sweep_chunks(
        &self,
        policy: &RetentionPolicy,
        archive: Option<&dyn ArchiveDestination>,
        cutoff: DateTime<Utc>,
        chunk_size: usize,
        report: &mut RetentionReport,
    ) -> Result<()> {
        let store = &self.inner.store;
        loop {
            let chunk = store.older_than(cutoff, chunk_size).await?;
            if chunk.is_empty() {
                break;
            }

            if let Some(archive) = archive {
                if policy.compliance_mode == ComplianceMode::Strict {
                    let key = &self.inner.integrity_key;
                    let tampered = chunk.iter().filter(|e| !e.verify_checksum(key)).count();
                    if tampered > 0 {
                        tracing::error!(
                            tampered,
                            "archiving audit entries that failed integrity verification"
                        );
                        report.integrity_failures += tampered;
                    }
                }

                let retry = &self.inner.config.archive_retry;
                let mut attempts: u32 = 0;
                let written = with_retry(retry, "audit_archive_write", || {
                    attempts += 1;
                    archive.archive(&chunk)
                })
                .await;
                if let Err(source) = written {
                    tracing::error!(
                        attempts,
                        entries = chunk.len(),
                        error = %source,
                        "archive write failed; entries kept for the next sweep"
                    );
                    return Err(AuditError::ArchiveWriteFailed {
                        attempts,
                        entries: chunk.len(),
                        source,
                    });
                }
                report.archived += chunk.len();
            }

            let ids: Vec<Uuid> = chunk.iter().map(|e| e.id).collect();
            let deleted = store.delete(&ids).await?;
            report.deleted += deleted;
            tracing::debug!(deleted, "retention chunk swept");

            if deleted == 0 || chunk.len() < chunk_size {
                break;
            }
        }
        Ok(())
    }
}

/// Background task that runs retention sweeps on a fixed interval.
#[derive(Debug)]
pub struct RetentionScheduler {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RetentionScheduler {
    /// Spawns the scheduler. The first sweep runs one `interval` from now.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn(engine: AuditEngine, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("retention scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match engine.run_retention_sweep().await {
                            Ok(report) => tracing::info!(
                                archived = report.archived,
                                deleted = report.deleted,
                                held = report.held,
                                "retention sweep complete"
                            ),
                            Err(err) => tracing::error!(error = %err, "retention sweep failed"),
                        }
                    }
                }
            }
        });

        Self { cancel, handle: Some(handle) }
    }

    /// Stops the scheduler and waits for an in-progress sweep to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            tracing::error!(error = %err, "retention scheduler task panicked");
        }
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
