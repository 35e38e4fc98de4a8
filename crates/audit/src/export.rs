//! Audit log export and import.
//!
//! - JSON: an array of [`AuditLogEntry`] values in their native shape. Importing an export yields
//!   entries equal to the originals, checksums included.
//! - CSV: a header row and one row per entry with the columns `id, timestamp, actor_id,
//!   actor_type, action, resource_type, resource_id, outcome, risk_score`, written with the
//!   `csv` crate. Every field is quoted and embedded quotes are doubled.

use std::{fmt, str::FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    engine::AuditEngine,
    entry::{Actor, AuditLogEntry, NewAuditEntry, Outcome, Resource},
    error::{AuditError, Result},
    store::AuditQuery,
};

const CSV_COLUMNS: [&str; 9] = [
    "id",
    "timestamp",
    "actor_id",
    "actor_type",
    "action",
    "resource_type",
    "resource_id",
    "outcome",
    "risk_score",
];

/// Export encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// JSON array of entries.
    Json,
    /// Quoted CSV with a header row.
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

/// Encodes entries as a JSON array.
///
/// # Errors
///
/// [`AuditError::Serialization`] if encoding fails.
pub fn encode_json(entries: &[AuditLogEntry]) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(entries)?))
}

/// Encodes entries as CSV.
///
/// # Errors
///
/// [`AuditError::Serialization`] if the writer fails.
pub fn encode_csv(entries: &[AuditLogEntry]) -> Result<Bytes> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(BytesMut::new().writer());
    writer.write_record(CSV_COLUMNS).map_err(csv_error)?;
    for entry in entries {
        let id = entry.id.to_string();
        let timestamp = entry.timestamp.to_rfc3339();
        let actor_type = entry.actor.actor_type.to_string();
        let outcome = entry.outcome.to_string();
        let risk = entry.risk_score.to_string();
        writer
            .write_record([
                id.as_str(),
                timestamp.as_str(),
                entry.actor.id.as_str(),
                actor_type.as_str(),
                entry.action.as_str(),
                entry.resource.resource_type.as_str(),
                entry.resource.id.as_str(),
                outcome.as_str(),
                risk.as_str(),
            ])
            .map_err(csv_error)?;
    }
    let out = writer.into_inner().map_err(|e| AuditError::Serialization(e.to_string()))?;
    Ok(out.into_inner().freeze())
}

fn csv_error(err: csv::Error) -> AuditError {
    AuditError::Serialization(format!("CSV encoding failed: {err}"))
}

/// Parses a JSON export back into entries.
///
/// Checksums are not verified here; see [`AuditEngine::import_json`].
///
/// # Errors
///
/// [`AuditError::Serialization`] if the document is not an array of entries.
pub fn import_json(bytes: &[u8]) -> Result<Vec<AuditLogEntry>> {
    Ok(serde_json::from_slice(bytes)?)
}

impl AuditEngine {
    /// Exports every entry matching `query`.
    ///
    /// The export itself is recorded as an `audit.export` entry.
    ///
    /// # Errors
    ///
    /// A store error, or [`AuditError::Serialization`] if encoding fails.
    #[tracing::instrument(skip(self, query, format), fields(format = %format))]
    pub async fn export(&self, format: ExportFormat, query: &AuditQuery) -> Result<Bytes> {
        let page = self.query(query).await?;
        let body = match format {
            ExportFormat::Json => encode_json(&page.entries)?,
            ExportFormat::Csv => encode_csv(&page.entries)?,
        };

        tracing::info!(entries = page.entries.len(), bytes = body.len(), "audit log exported");
        self.log(
            NewAuditEntry::builder()
                .actor(Actor::system("export"))
                .action("audit.export")
                .resource(Resource::new("audit_log", format.to_string()))
                .outcome(Outcome::Success)
                .build()
                .with_metadata("entries", page.entries.len()),
        );
        Ok(body)
    }

    /// Imports a JSON export into the store.
    ///
    /// Every entry's checksum is verified before anything is written; the
    /// batch is then appended atomically. Returns the number of entries
    /// imported.
    ///
    /// # Errors
    ///
    /// - [`AuditError::Serialization`] for a malformed document
    /// - [`AuditError::IntegrityMismatch`] for the first entry whose checksum does not verify
    /// - a store error, including `AlreadyExists` when an id is already present
    #[tracing::instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn import_json(&self, bytes: &[u8]) -> Result<usize> {
        let entries = import_json(bytes)?;
        let key = &self.inner.integrity_key;
        if let Some(bad) = entries.iter().find(|e| !e.verify_checksum(key)) {
            tracing::error!(entry_id = %bad.id, "rejecting import: integrity mismatch");
            return Err(AuditError::IntegrityMismatch(bad.id));
        }
        self.inner.store.append_batch(&entries).await?;
        tracing::info!(entries = entries.len(), "audit entries imported");
        Ok(entries.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        checksum::IntegrityKey,
        entry::ActorType,
        store::{AuditLogStore, MemoryAuditLogStore, SortOrder},
    };

    fn engine() -> AuditEngine {
        AuditEngine::builder()
            .store(Arc::new(MemoryAuditLogStore::new()) as Arc<dyn AuditLogStore>)
            .integrity_key(IntegrityKey::new(&[3u8; 32]).unwrap())
            .build()
    }

    fn seed(engine: &AuditEngine) -> Vec<AuditLogEntry> {
        let first = engine.log(
            NewAuditEntry::builder()
                .actor(
                    Actor::new("user-1", ActorType::User)
                        .with_ip("2001:db8::7")
                        .with_user_agent("Mozilla/5.0 (\"quoted\", comma)"),
                )
                .action("session.revoke")
                .resource(Resource::new("session", "s-1"))
                .outcome(Outcome::Success)
                .build()
                .with_metadata("reason", "user, logout")
                .with_metadata("note", "line1\nline2"),
        );
        let mut correction = NewAuditEntry::builder()
            .actor(Actor::new("svc-billing", ActorType::Service))
            .action("charge.create")
            .resource(Resource::new("payment", "ch_1"))
            .outcome(Outcome::Failure)
            .build();
        correction.supersedes = Some(first.id);
        let second = engine.log(correction);
        vec![first, second]
    }

    fn ascending() -> AuditQuery {
        AuditQuery::builder().order(SortOrder::Ascending).action("session.revoke").build()
    }

    #[tokio::test]
    async fn test_json_export_round_trips_exactly() {
        let engine = engine();
        let mut logged = seed(&engine);

        let body = engine
            .export(ExportFormat::Json, &AuditQuery::builder().order(SortOrder::Ascending).build())
            .await
            .unwrap();
        let mut parsed = import_json(&body).unwrap();

        parsed.sort_by_key(|e| e.id);
        logged.sort_by_key(|e| e.id);
        assert_eq!(parsed, logged);
        assert!(parsed.iter().all(|e| e.verify_checksum(&engine.inner.integrity_key)));
    }

    #[tokio::test]
    async fn test_csv_export_quotes_every_field() {
        let engine = engine();
        let logged = seed(&engine);

        let body = engine.export(ExportFormat::Csv, &ascending()).await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "\"id\",\"timestamp\",\"actor_id\",\"actor_type\",\"action\",\"resource_type\",\"resource_id\",\"outcome\",\"risk_score\""
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with(&format!("\"{}\",", logged[0].id)));
        assert!(row.contains("\"user-1\",\"user\",\"session.revoke\",\"session\",\"s-1\",\"success\""));
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn test_export_is_itself_audited() {
        let engine = engine();
        seed(&engine);
        engine.export(ExportFormat::Csv, &ascending()).await.unwrap();

        let exports = engine
            .query(&AuditQuery::builder().action("audit.export").build())
            .await
            .unwrap();
        assert_eq!(exports.total, 1);
        assert_eq!(exports.entries[0].resource.id, "csv");
    }

    #[tokio::test]
    async fn test_import_into_fresh_store() {
        let source = engine();
        seed(&source);
        let body = source
            .export(ExportFormat::Json, &AuditQuery::builder().order(SortOrder::Ascending).build())
            .await
            .unwrap();

        let target = engine();
        assert_eq!(target.import_json(&body).await.unwrap(), 2);
        let page = target.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);

        let err = target.import_json(&body).await.unwrap_err();
        assert!(matches!(err, AuditError::Storage(_)));
    }

    #[tokio::test]
    async fn test_import_rejects_tampered_document() {
        let source = engine();
        let logged = seed(&source);
        let mut entries = logged.clone();
        entries[1].outcome = Outcome::Success;
        let body = encode_json(&entries).unwrap();

        let target = engine();
        let err = target.import_json(&body).await.unwrap_err();
        assert!(matches!(err, AuditError::IntegrityMismatch(id) if id == logged[1].id));
        assert_eq!(target.query(&AuditQuery::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_import_rejects_entries_sealed_under_another_key() {
        let source = engine();
        let logged = seed(&source);
        let body = encode_json(&logged).unwrap();

        let target = AuditEngine::builder()
            .store(Arc::new(MemoryAuditLogStore::new()) as Arc<dyn AuditLogStore>)
            .build();
        let err = target.import_json(&body).await.unwrap_err();
        assert!(matches!(err, AuditError::IntegrityMismatch(id) if id == logged[0].id));
    }

    #[test]
    fn test_import_rejects_unknown_fields() {
        let err = import_json(br#"[{"id": "not-an-entry", "extra": 1}]"#).unwrap_err();
        assert!(matches!(err, AuditError::Serialization(_)));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    proptest! {
        #[test]
        fn csv_fields_read_back_unchanged(
            actor in "[ -~\n\r\t]{1,40}",
            action in "[ -~\n]{1,40}",
        ) {
            let engine = engine();
            let entry = engine.log(
                NewAuditEntry::builder()
                    .actor(Actor::new(actor.clone(), ActorType::User))
                    .action(action.clone())
                    .resource(Resource::new("session", "s-\"1\""))
                    .outcome(Outcome::Success)
                    .build(),
            );

            let body = encode_csv(std::slice::from_ref(&entry)).unwrap();
            let mut reader = csv::ReaderBuilder::new().from_reader(body.as_ref());
            let rows: Vec<csv::StringRecord> =
                reader.records().collect::<std::result::Result<_, _>>().unwrap();
            prop_assert_eq!(rows.len(), 1);
            let entry_id = entry.id.to_string();
            prop_assert_eq!(&rows[0][0], entry_id.as_str());
            prop_assert_eq!(&rows[0][2], actor.as_str());
            prop_assert_eq!(&rows[0][4], action.as_str());
            prop_assert_eq!(&rows[0][6], "s-\"1\"");
        }
    }
}
