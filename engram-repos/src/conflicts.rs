//! Conflict repository
//!
//! Conflict rows are appended by the entry repository when two updates
//! land inside the conflict window. Resolution is a separate user action
//! that either picks a surviving version or merges content into a new one.

use crate::DbDeps;
use engram_adapters::{SqlRow, SqlValue, StorageTransaction};
use engram_core::{
    AgentId, ConflictId, ConflictRecord, EngramResult, EntryId, EntryKind, IdType, ResourceError,
    ValidationError, VersionId,
};

fn decode(row: &SqlRow) -> EngramResult<ConflictRecord> {
    Ok(ConflictRecord {
        conflict_id: ConflictId::from_uuid(row.uuid("conflict_id")?),
        entry_kind: row.text("entry_kind")?.parse().map_err(|reason| {
            engram_core::EngramError::from(ValidationError::InvalidValue {
                field: "entry_kind".into(),
                reason,
            })
        })?,
        entry_id: EntryId::from_uuid(row.uuid("entry_id")?),
        version_a: VersionId::from_uuid(row.uuid("version_a")?),
        version_b: VersionId::from_uuid(row.uuid("version_b")?),
        detected_at: row.timestamp("detected_at")?,
        resolved: row.boolean("resolved")?,
        resolved_by: row
            .opt_text("resolved_by")?
            .and_then(|raw| AgentId::new(raw).ok()),
        resolved_at: row.opt_timestamp("resolved_at")?,
        winning_version: row.opt_uuid("winning_version")?.map(VersionId::from_uuid),
    })
}

/// Insert a conflict row inside an open transaction.
pub(crate) async fn insert_in_tx(
    tx: &mut dyn StorageTransaction,
    record: &ConflictRecord,
) -> EngramResult<()> {
    tx.execute(
        "INSERT INTO conflicts
             (conflict_id, entry_kind, entry_id, version_a, version_b,
              detected_at, resolved, resolved_by, resolved_at, winning_version)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        &[
            SqlValue::from(record.conflict_id.as_uuid()),
            SqlValue::from(record.entry_kind.as_str()),
            SqlValue::from(record.entry_id.as_uuid()),
            SqlValue::from(record.version_a.as_uuid()),
            SqlValue::from(record.version_b.as_uuid()),
            SqlValue::from(record.detected_at),
            SqlValue::from(record.resolved),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Null,
        ],
    )
    .await?;
    Ok(())
}

/// Repository over conflict records.
pub struct ConflictRepository {
    deps: DbDeps,
}

impl ConflictRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    pub async fn get(&self, id: ConflictId) -> EngramResult<Option<ConflictRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM conflicts WHERE conflict_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.first().map(decode).transpose()
    }

    /// Unresolved conflicts for one entry.
    pub async fn unresolved_for_entry(&self, entry_id: EntryId) -> EngramResult<Vec<ConflictRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM conflicts
                 WHERE entry_id = $1 AND resolved = 0
                 ORDER BY detected_at",
                &[SqlValue::from(entry_id.as_uuid())],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Unresolved conflicts across a set of entries; used by the query
    /// pipeline's conflicts block.
    pub async fn unresolved_for_entries(
        &self,
        entry_ids: &[EntryId],
    ) -> EngramResult<Vec<ConflictRecord>> {
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for chunk in entry_ids.chunks(100) {
            let placeholders: Vec<String> =
                (1..=chunk.len()).map(|i| format!("${i}")).collect();
            let sql = format!(
                "SELECT * FROM conflicts WHERE resolved = 0 AND entry_id IN ({})
                 ORDER BY detected_at",
                placeholders.join(", ")
            );
            let params: Vec<SqlValue> = chunk
                .iter()
                .map(|id| SqlValue::from(id.as_uuid()))
                .collect();
            let rows = self.deps.storage.execute(&sql, &params).await?;
            for row in &rows {
                out.push(decode(row)?);
            }
        }
        Ok(out)
    }

    pub async fn list_unresolved(&self, limit: u32) -> EngramResult<Vec<ConflictRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM conflicts WHERE resolved = 0
                 ORDER BY detected_at LIMIT $1",
                &[SqlValue::from(limit)],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Mark a conflict resolved with the surviving version. The caller is
    /// responsible for having created a merged version first when merging.
    pub async fn resolve(
        &self,
        id: ConflictId,
        winning_version: VersionId,
        resolver: &AgentId,
    ) -> EngramResult<ConflictRecord> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| engram_core::EngramError::not_found("conflict", id))?;
        if record.resolved {
            return Err(ResourceError::StateConflict {
                reason: format!("conflict {id} is already resolved"),
            }
            .into());
        }
        let now = chrono::Utc::now();
        self.deps
            .storage
            .execute(
                "UPDATE conflicts
                 SET resolved = 1, resolved_by = $1, resolved_at = $2, winning_version = $3
                 WHERE conflict_id = $4",
                &[
                    SqlValue::from(resolver.as_str()),
                    SqlValue::from(now),
                    SqlValue::from(winning_version.as_uuid()),
                    SqlValue::from(id.as_uuid()),
                ],
            )
            .await?;
        Ok(ConflictRecord {
            resolved: true,
            resolved_by: Some(resolver.clone()),
            resolved_at: Some(now),
            winning_version: Some(winning_version),
            ..record
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;
    use engram_adapters::with_transaction;
    use futures_util::FutureExt;

    fn sample(entry_id: EntryId) -> ConflictRecord {
        ConflictRecord {
            conflict_id: ConflictId::now_v7(),
            entry_kind: EntryKind::Knowledge,
            entry_id,
            version_a: VersionId::now_v7(),
            version_b: VersionId::now_v7(),
            detected_at: chrono::Utc::now(),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            winning_version: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_resolve() {
        let deps = test_deps().await;
        let repo = ConflictRepository::new(deps.clone());
        let entry_id = EntryId::now_v7();
        let record = sample(entry_id);

        with_transaction(deps.storage.as_ref(), deps.retry, |tx| {
            let record = record.clone();
            async move { insert_in_tx(tx, &record).await }.boxed()
        })
        .await
        .unwrap();

        let unresolved = repo.unresolved_for_entry(entry_id).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert!(!unresolved[0].resolved);

        let resolver = AgentId::new("arbiter").unwrap();
        let resolved = repo
            .resolve(record.conflict_id, record.version_b, &resolver)
            .await
            .unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.winning_version, Some(record.version_b));

        assert!(repo.unresolved_for_entry(entry_id).await.unwrap().is_empty());
        // Double resolution is a state conflict.
        assert_eq!(
            repo.resolve(record.conflict_id, record.version_a, &resolver)
                .await
                .unwrap_err()
                .code(),
            2003
        );
    }
}
