//! Audit service
//!
//! Wraps the audit repository for the non-transactional call sites.
//! A failed audit write never masks the operation being audited: it bumps
//! a counter and logs, nothing more.

use engram_core::{AgentId, AuditAction, EntryKind, ScopeRef};
use engram_repos::AuditRepository;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Failure-isolated audit writer.
pub struct AuditService {
    repo: AuditRepository,
    write_failures: AtomicU64,
}

impl AuditService {
    pub fn new(repo: AuditRepository) -> Self {
        Self {
            repo,
            write_failures: AtomicU64::new(0),
        }
    }

    /// Record a mutation. Infallible from the caller's perspective.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        action: AuditAction,
        entry_kind: Option<EntryKind>,
        entity_id: Option<Uuid>,
        actor: &AgentId,
        scope: Option<ScopeRef>,
        correlation_id: Option<Uuid>,
        payload: Option<serde_json::Value>,
    ) {
        let result = self
            .repo
            .append(
                action,
                entry_kind,
                entity_id,
                actor,
                scope,
                correlation_id,
                payload,
            )
            .await;
        if let Err(e) = result {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, action = %action, "audit write failed");
        }
    }

    /// How many audit writes have failed since startup.
    pub fn failure_count(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub async fn cleanup(&self, retention_days: u32) -> u64 {
        match self.repo.cleanup(retention_days).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "audit cleanup failed");
                0
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_adapters::{InProcessEventBus, SqliteAdapter, StorageAdapter};
    use engram_core::TxnRetryConfig;
    use engram_repos::{run_migrations, DbDeps};
    use std::sync::Arc;

    async fn service(migrated: bool) -> AuditService {
        let storage = Arc::new(SqliteAdapter::in_memory());
        storage.connect().await.unwrap();
        if migrated {
            run_migrations(storage.as_ref(), None).await.unwrap();
        }
        let deps = DbDeps::new(
            storage,
            InProcessEventBus::new(16),
            TxnRetryConfig {
                max_retries: 1,
                base_backoff: std::time::Duration::from_millis(1),
            },
        );
        AuditService::new(AuditRepository::new(deps))
    }

    #[tokio::test]
    async fn test_record_succeeds_silently() {
        let service = service(true).await;
        let actor = AgentId::new("a").unwrap();
        service
            .record(AuditAction::Create, None, None, &actor, None, None, None)
            .await;
        assert_eq!(service.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_counts_but_does_not_propagate() {
        // No migrations: the audit table is missing, every write fails.
        let service = service(false).await;
        let actor = AgentId::new("a").unwrap();
        service
            .record(AuditAction::Create, None, None, &actor, None, None, None)
            .await;
        service
            .record(AuditAction::Delete, None, None, &actor, None, None, None)
            .await;
        assert_eq!(service.failure_count(), 2);
    }
}
