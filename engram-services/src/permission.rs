//! Permission service
//!
//! Policy is checked at the boundary of every mutating handler. Resolution
//! walks the scope chain looking for a satisfying grant; absent one the
//! request is denied, except in permissive mode, which is available only
//! in the "development" environment. Decisions are cached briefly; the
//! cache is invalidated by grant/revoke events.

use dashmap::DashMap;
use engram_adapters::{
    ChangeAction, ChangeEvent, EventAdapter, SubscriptionGuard, ENTRY_CHANGED_CHANNEL,
};
use engram_core::{AgentId, EngramResult, PermissionError, ScopeRef};
use engram_repos::{GrantAction, GrantRepository};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DECISION_TTL: Duration = Duration::from_secs(30);

/// Scope-chain permission checks with a small decision cache.
pub struct PermissionService {
    grants: GrantRepository,
    permissive: bool,
    cache: Arc<DashMap<String, (bool, Instant)>>,
    _invalidation: SubscriptionGuard,
}

impl PermissionService {
    /// `environment` gates permissive mode: only the literal
    /// "development" enables it, never "staging" or "production".
    pub fn new(
        grants: GrantRepository,
        environment: &str,
        events: &dyn EventAdapter,
    ) -> Self {
        let cache: Arc<DashMap<String, (bool, Instant)>> = Arc::new(DashMap::new());
        let handler_cache = Arc::clone(&cache);
        let invalidation = events.subscribe(
            ENTRY_CHANGED_CHANNEL,
            Arc::new(move |value| {
                if let Ok(event) = serde_json::from_value::<ChangeEvent>(value.clone()) {
                    if matches!(event.action, ChangeAction::Grant | ChangeAction::Revoke) {
                        handler_cache.clear();
                    }
                }
            }),
        );
        Self {
            grants,
            permissive: environment == "development",
            cache,
            _invalidation: invalidation,
        }
    }

    /// Cache key for a decision. Scope fragments render a missing id as
    /// `-`, so an agent or scope literally named "null" cannot collide
    /// with an absent identifier.
    fn decision_key(agent: &AgentId, action: GrantAction, chain: &[ScopeRef]) -> String {
        let mut key = format!("{}|{}", agent.as_str(), action);
        for scope in chain {
            key.push('|');
            key.push_str(&scope.cache_key());
        }
        key
    }

    /// Check `action` for `agent` against a resolved scope chain.
    pub async fn check(
        &self,
        agent: &AgentId,
        action: GrantAction,
        chain: &[ScopeRef],
    ) -> EngramResult<()> {
        if self.permissive {
            return Ok(());
        }

        let key = Self::decision_key(agent, action, chain);
        if let Some(entry) = self.cache.get(&key) {
            let (allowed, at) = *entry;
            if at.elapsed() < DECISION_TTL {
                return if allowed {
                    Ok(())
                } else {
                    Err(self.denied(agent, action, chain))
                };
            }
        }

        let allowed = self.grants.has_grant(agent, action, chain).await?;
        self.cache.insert(key, (allowed, Instant::now()));
        if allowed {
            Ok(())
        } else {
            Err(self.denied(agent, action, chain))
        }
    }

    fn denied(
        &self,
        agent: &AgentId,
        action: GrantAction,
        chain: &[ScopeRef],
    ) -> engram_core::EngramError {
        let scope = chain.first().copied().unwrap_or_else(ScopeRef::global);
        PermissionError::Denied {
            agent: agent.clone(),
            action: action.to_string(),
            scope,
        }
        .into()
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_adapters::{InProcessEventBus, SqliteAdapter, StorageAdapter};
    use engram_core::{IdType, TxnRetryConfig};
    use engram_repos::{run_migrations, DbDeps};

    async fn fixture(environment: &str) -> (PermissionService, GrantRepository, Arc<InProcessEventBus>) {
        let storage = Arc::new(SqliteAdapter::in_memory());
        storage.connect().await.unwrap();
        run_migrations(storage.as_ref(), None).await.unwrap();
        let bus = InProcessEventBus::new(64);
        let deps = DbDeps::new(
            storage,
            bus.clone(),
            TxnRetryConfig {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
            },
        );
        let service = PermissionService::new(
            GrantRepository::new(deps.clone()),
            environment,
            bus.as_ref(),
        );
        (service, GrantRepository::new(deps), bus)
    }

    #[tokio::test]
    async fn test_denied_without_grant() {
        let (service, _grants, _bus) = fixture("production").await;
        let agent = AgentId::new("a").unwrap();
        let err = service
            .check(&agent, GrantAction::Write, &[ScopeRef::global()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), 6001);
    }

    #[tokio::test]
    async fn test_grant_on_ancestor_scope_allows() {
        let (service, grants, _bus) = fixture("production").await;
        let agent = AgentId::new("a").unwrap();
        grants
            .grant(&agent, GrantAction::Write, &ScopeRef::global())
            .await
            .unwrap();

        let project = ScopeRef::project(engram_core::ProjectId::now_v7());
        let chain = [project, ScopeRef::global()];
        service.check(&agent, GrantAction::Write, &chain).await.unwrap();
    }

    #[tokio::test]
    async fn test_permissive_only_in_development() {
        let agent = AgentId::new("anyone").unwrap();
        let chain = [ScopeRef::global()];

        let (dev, _, _bus) = fixture("development").await;
        assert!(dev.is_permissive());
        dev.check(&agent, GrantAction::Admin, &chain).await.unwrap();

        for env in ["staging", "production"] {
            let (service, _, _bus2) = fixture(env).await;
            assert!(!service.is_permissive());
            assert!(service
                .check(&agent, GrantAction::Admin, &chain)
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_revoke_event_invalidates_cache() {
        let (service, grants, _bus) = fixture("production").await;
        let agent = AgentId::new("a").unwrap();
        let chain = [ScopeRef::global()];

        grants
            .grant(&agent, GrantAction::Read, &ScopeRef::global())
            .await
            .unwrap();
        service.check(&agent, GrantAction::Read, &chain).await.unwrap();
        assert!(service.cached_decisions() > 0);

        grants
            .revoke(&agent, GrantAction::Read, &ScopeRef::global())
            .await
            .unwrap();
        // Give the bus one dispatch hop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.cached_decisions(), 0);
        assert!(service.check(&agent, GrantAction::Read, &chain).await.is_err());
    }
}
