//! Audit repository
//!
//! Audit rows for a mutation are written inside the same transaction as
//! the mutation, so failure is atomic with it. The standalone append used
//! by non-transactional paths never masks the caller's operation; its
//! failures are counted and logged by the audit service.

use crate::scopes::{scope_from_cols, scope_to_cols};
use crate::DbDeps;
use engram_adapters::{SqlRow, SqlValue, StorageTransaction};
use engram_core::{
    truncate_audit_payload, AgentId, AuditAction, AuditId, AuditRecord, EngramResult, EntryKind,
    IdType, ScopeRef, ValidationError,
};
use uuid::Uuid;

const INSERT_SQL: &str = "INSERT INTO audit_log
    (audit_id, action, entry_kind, entity_id, actor, scope_kind, scope_id,
     correlation_id, payload, payload_truncated, created_at)
 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

fn insert_params(record: &AuditRecord) -> Vec<SqlValue> {
    let (scope_kind, scope_id) = match &record.scope {
        Some(scope) => {
            let (k, i) = scope_to_cols(scope);
            (SqlValue::Text(k), SqlValue::Text(i))
        }
        None => (SqlValue::Null, SqlValue::Null),
    };
    vec![
        SqlValue::from(record.audit_id.as_uuid()),
        SqlValue::from(record.action.as_str()),
        match record.entry_kind {
            Some(kind) => SqlValue::from(kind.as_str()),
            None => SqlValue::Null,
        },
        SqlValue::from(record.entity_id),
        SqlValue::from(record.actor.as_str()),
        scope_kind,
        scope_id,
        SqlValue::from(record.correlation_id),
        match &record.payload {
            Some(p) => SqlValue::Text(p.to_string()),
            None => SqlValue::Null,
        },
        SqlValue::from(record.payload_truncated),
        SqlValue::from(record.created_at),
    ]
}

/// Build an audit record, truncating the payload snapshot at the cap.
pub(crate) fn build_record(
    action: AuditAction,
    entry_kind: Option<EntryKind>,
    entity_id: Option<Uuid>,
    actor: &AgentId,
    scope: Option<ScopeRef>,
    correlation_id: Option<Uuid>,
    payload: Option<serde_json::Value>,
) -> AuditRecord {
    let (payload, truncated) = match payload {
        Some(value) => {
            let serialized = value.to_string();
            let (kept, truncated) = truncate_audit_payload(&serialized);
            let stored = if truncated {
                serde_json::Value::String(kept)
            } else {
                value
            };
            (Some(stored), truncated)
        }
        None => (None, false),
    };
    AuditRecord {
        audit_id: AuditId::now_v7(),
        action,
        entry_kind,
        entity_id,
        actor: actor.clone(),
        scope,
        correlation_id,
        payload,
        payload_truncated: truncated,
        created_at: chrono::Utc::now(),
    }
}

/// Append an audit row inside an open transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn append_in_tx(
    tx: &mut dyn StorageTransaction,
    action: AuditAction,
    entry_kind: Option<EntryKind>,
    entity_id: Option<Uuid>,
    actor: &AgentId,
    scope: Option<ScopeRef>,
    correlation_id: Option<Uuid>,
    payload: Option<serde_json::Value>,
) -> EngramResult<AuditRecord> {
    let record = build_record(
        action,
        entry_kind,
        entity_id,
        actor,
        scope,
        correlation_id,
        payload,
    );
    tx.execute(INSERT_SQL, &insert_params(&record)).await?;
    Ok(record)
}

fn decode(row: &SqlRow) -> EngramResult<AuditRecord> {
    let scope = match (row.opt_text("scope_kind")?, row.opt_text("scope_id")?) {
        (Some(kind), Some(id)) => Some(scope_from_cols(&kind, &id)?),
        _ => None,
    };
    let entry_kind = row
        .opt_text("entry_kind")?
        .map(|raw| {
            raw.parse::<EntryKind>().map_err(|reason| {
                engram_core::EngramError::from(ValidationError::InvalidValue {
                    field: "entry_kind".into(),
                    reason,
                })
            })
        })
        .transpose()?;
    Ok(AuditRecord {
        audit_id: AuditId::from_uuid(row.uuid("audit_id")?),
        action: match row.text("action")?.as_str() {
            "create" => AuditAction::Create,
            "update" => AuditAction::Update,
            "delete" => AuditAction::Delete,
            "deactivate" => AuditAction::Deactivate,
            "reactivate" => AuditAction::Reactivate,
            "grant" => AuditAction::Grant,
            "revoke" => AuditAction::Revoke,
            "resolve" => AuditAction::Resolve,
            "lock_acquire" => AuditAction::LockAcquire,
            "lock_release" => AuditAction::LockRelease,
            "import" => AuditAction::Import,
            _ => AuditAction::ScopeDelete,
        },
        entry_kind,
        entity_id: row.opt_uuid("entity_id")?,
        actor: AgentId::new(row.text("actor")?).unwrap_or_else(|_| AgentId::system()),
        scope,
        correlation_id: row.opt_uuid("correlation_id")?,
        payload: row.opt_json("payload").unwrap_or(None),
        payload_truncated: row.boolean("payload_truncated")?,
        created_at: row.timestamp("created_at")?,
    })
}

/// Repository over the audit log.
pub struct AuditRepository {
    deps: DbDeps,
}

impl AuditRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    /// Append outside a transaction (lock operations, imports).
    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        action: AuditAction,
        entry_kind: Option<EntryKind>,
        entity_id: Option<Uuid>,
        actor: &AgentId,
        scope: Option<ScopeRef>,
        correlation_id: Option<Uuid>,
        payload: Option<serde_json::Value>,
    ) -> EngramResult<AuditRecord> {
        let record = build_record(
            action,
            entry_kind,
            entity_id,
            actor,
            scope,
            correlation_id,
            payload,
        );
        self.deps
            .storage
            .execute(INSERT_SQL, &insert_params(&record))
            .await?;
        Ok(record)
    }

    /// Recent records for an entity.
    pub async fn for_entity(&self, entity_id: Uuid, limit: u32) -> EngramResult<Vec<AuditRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM audit_log WHERE entity_id = $1
                 ORDER BY created_at DESC LIMIT $2",
                &[SqlValue::from(entity_id), SqlValue::from(limit)],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Recent records overall, newest first.
    pub async fn recent(&self, limit: u32) -> EngramResult<Vec<AuditRecord>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM audit_log ORDER BY created_at DESC LIMIT $1",
                &[SqlValue::from(limit)],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Drop records older than the retention horizon. Returns rows removed.
    pub async fn cleanup(&self, retention_days: u32) -> EngramResult<u64> {
        let horizon = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        let before = self.count().await?;
        self.deps
            .storage
            .execute(
                "DELETE FROM audit_log WHERE created_at < $1",
                &[SqlValue::from(horizon)],
            )
            .await?;
        let after = self.count().await?;
        Ok(before.saturating_sub(after))
    }

    async fn count(&self) -> EngramResult<u64> {
        let rows = self
            .deps
            .storage
            .execute("SELECT COUNT(*) AS n FROM audit_log", &[])
            .await?;
        Ok(rows.first().map(|r| r.integer("n")).transpose()?.unwrap_or(0) as u64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;

    #[tokio::test]
    async fn test_append_and_query() {
        let repo = AuditRepository::new(test_deps().await);
        let actor = AgentId::new("agent-a").unwrap();
        let entity = Uuid::now_v7();

        repo.append(
            AuditAction::Create,
            Some(EntryKind::Guideline),
            Some(entity),
            &actor,
            Some(ScopeRef::global()),
            None,
            Some(serde_json::json!({"name": "g"})),
        )
        .await
        .unwrap();

        let records = repo.for_entity(entity, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::Create);
        assert_eq!(records[0].actor, actor);
        assert!(!records[0].payload_truncated);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_truncated_not_dropped() {
        let repo = AuditRepository::new(test_deps().await);
        let actor = AgentId::new("agent-a").unwrap();
        let entity = Uuid::now_v7();
        let big = serde_json::json!({ "blob": "x".repeat(32 * 1024) });

        repo.append(
            AuditAction::Update,
            Some(EntryKind::Knowledge),
            Some(entity),
            &actor,
            None,
            None,
            Some(big),
        )
        .await
        .unwrap();

        let records = repo.for_entity(entity, 1).await.unwrap();
        assert!(records[0].payload_truncated);
        assert!(records[0].payload.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let deps = test_deps().await;
        let repo = AuditRepository::new(deps.clone());
        let actor = AgentId::new("agent-a").unwrap();
        repo.append(AuditAction::Create, None, None, &actor, None, None, None)
            .await
            .unwrap();

        // Age the row beyond the horizon.
        let old = chrono::Utc::now() - chrono::Duration::days(120);
        deps.storage
            .execute(
                "UPDATE audit_log SET created_at = $1",
                &[SqlValue::from(old)],
            )
            .await
            .unwrap();

        let removed = repo.cleanup(90).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.recent(10).await.unwrap().is_empty());
    }
}
