//! Embedding tracking repository

use crate::DbDeps;
use engram_adapters::{SqlRow, SqlValue};
use engram_core::{
    EmbeddingRecord, EngramResult, EntryId, EntryKind, IdType, ValidationError, VersionId,
};

fn decode(row: &SqlRow) -> EngramResult<EmbeddingRecord> {
    Ok(EmbeddingRecord {
        entry_kind: row.text("entry_kind")?.parse().map_err(|reason| {
            engram_core::EngramError::from(ValidationError::InvalidValue {
                field: "entry_kind".into(),
                reason,
            })
        })?,
        entry_id: EntryId::from_uuid(row.uuid("entry_id")?),
        version_id: VersionId::from_uuid(row.uuid("version_id")?),
        provider: row.text("provider")?,
        model: row.text("model")?,
        dimension: row.integer("dimension")? as i32,
        stored_at: row.timestamp("stored_at")?,
    })
}

/// Repository over embedding tracking rows. One row per entry tracks the
/// version whose vector is currently in the vector store.
pub struct EmbeddingRepository {
    deps: DbDeps,
}

impl EmbeddingRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    /// Record a stored vector, replacing any previous row for the entry.
    pub async fn record_stored(&self, record: &EmbeddingRecord) -> EngramResult<()> {
        self.deps
            .storage
            .execute(
                "DELETE FROM embedding_records WHERE entry_kind = $1 AND entry_id = $2",
                &[
                    SqlValue::from(record.entry_kind.as_str()),
                    SqlValue::from(record.entry_id.as_uuid()),
                ],
            )
            .await?;
        self.deps
            .storage
            .execute(
                "INSERT INTO embedding_records
                     (entry_kind, entry_id, version_id, provider, model, dimension,
                      stored_at, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'stored')",
                &[
                    SqlValue::from(record.entry_kind.as_str()),
                    SqlValue::from(record.entry_id.as_uuid()),
                    SqlValue::from(record.version_id.as_uuid()),
                    SqlValue::from(record.provider.as_str()),
                    SqlValue::from(record.model.as_str()),
                    SqlValue::from(record.dimension),
                    SqlValue::from(record.stored_at),
                ],
            )
            .await?;
        Ok(())
    }

    /// Record terminal failure for an entry's current version.
    pub async fn record_failed(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        version_id: VersionId,
        provider: &str,
        model: &str,
    ) -> EngramResult<()> {
        self.deps
            .storage
            .execute(
                "DELETE FROM embedding_records WHERE entry_kind = $1 AND entry_id = $2",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                ],
            )
            .await?;
        self.deps
            .storage
            .execute(
                "INSERT INTO embedding_records
                     (entry_kind, entry_id, version_id, provider, model, dimension,
                      stored_at, status)
                 VALUES ($1, $2, $3, $4, $5, 0, $6, 'failed')",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(version_id.as_uuid()),
                    SqlValue::from(provider),
                    SqlValue::from(model),
                    SqlValue::from(chrono::Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
    ) -> EngramResult<Option<EmbeddingRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM embedding_records
                 WHERE entry_kind = $1 AND entry_id = $2 AND status = 'stored'",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                ],
            )
            .await?;
        rows.first().map(decode).transpose()
    }

    /// Entries whose last attempt failed; `reindex --retry-failed` reopens
    /// exactly these.
    pub async fn list_failed(&self, limit: u32) -> EngramResult<Vec<(EntryKind, EntryId)>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT entry_kind, entry_id FROM embedding_records
                 WHERE status = 'failed' ORDER BY stored_at LIMIT $1",
                &[SqlValue::from(limit)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let kind: EntryKind = row.text("entry_kind")?.parse().map_err(|reason| {
                    engram_core::EngramError::from(ValidationError::InvalidValue {
                        field: "entry_kind".into(),
                        reason,
                    })
                })?;
                Ok((kind, EntryId::from_uuid(row.uuid("entry_id")?)))
            })
            .collect()
    }

    /// Counts by status for `reindex --stats`.
    pub async fn stats(&self) -> EngramResult<(u64, u64)> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT status, COUNT(*) AS n FROM embedding_records GROUP BY status",
                &[],
            )
            .await?;
        let mut stored = 0;
        let mut failed = 0;
        for row in &rows {
            let n = row.integer("n")? as u64;
            match row.text("status")?.as_str() {
                "stored" => stored = n,
                "failed" => failed = n,
                _ => {}
            }
        }
        Ok((stored, failed))
    }
}

// ============================================================================
// TESTS
// ============================================================================
