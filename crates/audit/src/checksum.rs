//! Integrity checksums for audit entries.
//!
//! The checksum is a hex HMAC-SHA256, keyed with the engine's
//! [`IntegrityKey`], over a domain-separation prefix followed by the
//! canonical JSON of every entry field except the checksum itself.
//! Canonical means: fixed field order (struct declaration order), sorted
//! maps and sets, and RFC 3339 timestamps with full precision. Without the
//! key an edited entry cannot be re-sealed, so write access to the store is
//! not enough to forge a valid checksum.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use hmac::{
    Hmac, Mac,
    digest::{Key, KeyInit},
};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;
use warden_storage::ConfigError;

use crate::{
    compliance::ComplianceRegime,
    entry::{Actor, AuditLogEntry, Outcome, Resource},
};

type HmacSha256 = Hmac<Sha256>;

const DOMAIN_PREFIX: &[u8] = b"warden_audit_entry_v1:";

/// Secret that seals audit entries.
///
/// Load it from a secret store and inject it into every engine that reads
/// or writes the same log; entries sealed under one key do not verify under
/// another. The key material is never printed.
#[derive(Clone)]
pub struct IntegrityKey {
    mac: HmacSha256,
}

impl IntegrityKey {
    /// Shortest accepted secret, in bytes.
    pub const MIN_LEN: usize = 32;

    /// Keys the checksum with `secret`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::BelowMinimum`] if `secret` is shorter than
    /// [`Self::MIN_LEN`].
    pub fn new(secret: &[u8]) -> Result<Self, ConfigError> {
        if secret.len() < Self::MIN_LEN {
            return Err(ConfigError::BelowMinimum {
                field: "integrity_key",
                min: format!("{} bytes", Self::MIN_LEN),
                value: format!("{} bytes", secret.len()),
            });
        }
        let mac = <HmacSha256 as KeyInit>::new_from_slice(secret)
            .map_err(|e| ConfigError::Invalid(format!("integrity key rejected: {e}")))?;
        Ok(Self { mac })
    }

    /// A fresh random key.
    ///
    /// Entries sealed with it only verify within this process.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = Key::<HmacSha256>::default();
        rand::rng().fill_bytes(&mut secret);
        let mac = <HmacSha256 as KeyInit>::new(&secret);
        secret.iter_mut().for_each(|b| *b = 0);
        Self { mac }
    }

    fn keyed(&self, entry: &AuditLogEntry) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(DOMAIN_PREFIX);
        // Serializing plain data into a Vec cannot fail.
        let body = serde_json::to_vec(&Canonical::from(entry)).unwrap_or_default();
        mac.update(&body);
        mac
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IntegrityKey(<redacted>)")
    }
}

#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    actor: &'a Actor,
    action: &'a str,
    resource: &'a Resource,
    outcome: Outcome,
    risk_score: f64,
    compliance_flags: &'a BTreeSet<ComplianceRegime>,
    metadata: &'a BTreeMap<String, String>,
    supersedes: &'a Option<Uuid>,
}

impl<'a> From<&'a AuditLogEntry> for Canonical<'a> {
    fn from(entry: &'a AuditLogEntry) -> Self {
        Self {
            id: &entry.id,
            timestamp: &entry.timestamp,
            actor: &entry.actor,
            action: &entry.action,
            resource: &entry.resource,
            outcome: entry.outcome,
            risk_score: entry.risk_score,
            compliance_flags: &entry.compliance_flags,
            metadata: &entry.metadata,
            supersedes: &entry.supersedes,
        }
    }
}

/// Computes the checksum of `entry` under `key`, ignoring its current
/// checksum field.
#[must_use]
pub fn compute(key: &IntegrityKey, entry: &AuditLogEntry) -> String {
    hex::encode(key.keyed(entry).finalize().into_bytes())
}

/// Returns `true` if the stored checksum matches the entry content under
/// `key`. The comparison is constant-time.
#[must_use]
pub fn verify(key: &IntegrityKey, entry: &AuditLogEntry) -> bool {
    let Ok(stored) = hex::decode(&entry.integrity_checksum) else {
        return false;
    };
    key.keyed(entry).verify_slice(&stored).is_ok()
}
