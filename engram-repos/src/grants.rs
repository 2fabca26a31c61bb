//! Permission grant repository

use crate::scopes::{scope_from_cols, scope_to_cols};
use crate::DbDeps;
use engram_adapters::{ChangeAction, ChangeEvent, SqlRow, SqlValue, ENTRY_CHANGED_CHANNEL};
use engram_core::{AgentId, EngramResult, GrantId, IdType, ScopeRef, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Grantable actions, ordered by strength: admin implies write implies
/// read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantAction {
    Read,
    Write,
    Admin,
}

impl GrantAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantAction::Read => "read",
            GrantAction::Write => "write",
            GrantAction::Admin => "admin",
        }
    }

    /// Whether a grant of `self` satisfies a request for `needed`.
    pub fn satisfies(&self, needed: GrantAction) -> bool {
        self.rank() >= needed.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            GrantAction::Read => 0,
            GrantAction::Write => 1,
            GrantAction::Admin => 2,
        }
    }
}

impl fmt::Display for GrantAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(GrantAction::Read),
            "write" => Ok(GrantAction::Write),
            "admin" => Ok(GrantAction::Admin),
            other => Err(format!("unknown grant action: {other}")),
        }
    }
}

/// One stored grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub grant_id: GrantId,
    pub agent_id: AgentId,
    pub action: GrantAction,
    pub scope: ScopeRef,
    pub created_at: Timestamp,
}

fn decode(row: &SqlRow) -> EngramResult<Grant> {
    Ok(Grant {
        grant_id: GrantId::from_uuid(row.uuid("grant_id")?),
        agent_id: AgentId::new(row.text("agent_id")?).unwrap_or_else(|_| AgentId::system()),
        action: row.text("action")?.parse().map_err(|reason| {
            engram_core::EngramError::from(ValidationError::InvalidValue {
                field: "action".into(),
                reason,
            })
        })?,
        scope: scope_from_cols(&row.text("scope_kind")?, &row.text("scope_id")?)?,
        created_at: row.timestamp("created_at")?,
    })
}

/// Repository over permission grants.
pub struct GrantRepository {
    deps: DbDeps,
}

impl GrantRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    async fn publish(&self, action: ChangeAction, scope: ScopeRef) {
        let event = ChangeEvent::scope_only(action, scope);
        let value = serde_json::to_value(&event).unwrap_or_default();
        if let Err(e) = self.deps.events.publish(ENTRY_CHANGED_CHANNEL, value).await {
            tracing::warn!(error = %e, "failed to publish grant event");
        }
    }

    /// Grant an action at a scope. Idempotent.
    pub async fn grant(
        &self,
        agent_id: &AgentId,
        action: GrantAction,
        scope: &ScopeRef,
    ) -> EngramResult<Grant> {
        if !scope.is_well_formed() {
            return Err(ValidationError::InvalidScope {
                reason: format!("scope {scope} is malformed"),
            }
            .into());
        }
        let (scope_kind, scope_id) = scope_to_cols(scope);
        let grant = Grant {
            grant_id: GrantId::now_v7(),
            agent_id: agent_id.clone(),
            action,
            scope: *scope,
            created_at: chrono::Utc::now(),
        };
        let result = self
            .deps
            .storage
            .execute(
                "INSERT INTO grants (grant_id, agent_id, action, scope_kind, scope_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    SqlValue::from(grant.grant_id.as_uuid()),
                    SqlValue::from(grant.agent_id.as_str()),
                    SqlValue::from(grant.action.as_str()),
                    SqlValue::from(scope_kind.as_str()),
                    SqlValue::from(scope_id.as_str()),
                    SqlValue::from(grant.created_at),
                ],
            )
            .await;
        match result {
            Ok(_) => {
                self.publish(ChangeAction::Grant, *scope).await;
                Ok(grant)
            }
            Err(e) if crate::is_unique_violation(&e) => {
                // Already granted; return the stored row.
                let existing = self
                    .list_for_agent(agent_id)
                    .await?
                    .into_iter()
                    .find(|g| g.action == action && g.scope == *scope);
                existing.ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Revoke an exact grant. Returns whether one existed.
    pub async fn revoke(
        &self,
        agent_id: &AgentId,
        action: GrantAction,
        scope: &ScopeRef,
    ) -> EngramResult<bool> {
        let (scope_kind, scope_id) = scope_to_cols(scope);
        let existed = !self
            .deps
            .storage
            .execute(
                "SELECT grant_id FROM grants
                 WHERE agent_id = $1 AND action = $2 AND scope_kind = $3 AND scope_id = $4",
                &[
                    SqlValue::from(agent_id.as_str()),
                    SqlValue::from(action.as_str()),
                    SqlValue::from(scope_kind.as_str()),
                    SqlValue::from(scope_id.as_str()),
                ],
            )
            .await?
            .is_empty();
        if existed {
            self.deps
                .storage
                .execute(
                    "DELETE FROM grants
                     WHERE agent_id = $1 AND action = $2 AND scope_kind = $3 AND scope_id = $4",
                    &[
                        SqlValue::from(agent_id.as_str()),
                        SqlValue::from(action.as_str()),
                        SqlValue::from(scope_kind.as_str()),
                        SqlValue::from(scope_id.as_str()),
                    ],
                )
                .await?;
            self.publish(ChangeAction::Revoke, *scope).await;
        }
        Ok(existed)
    }

    pub async fn list_for_agent(&self, agent_id: &AgentId) -> EngramResult<Vec<Grant>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM grants WHERE agent_id = $1 ORDER BY created_at",
                &[SqlValue::from(agent_id.as_str())],
            )
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Whether any scope in the chain carries a satisfying grant for the
    /// agent.
    pub async fn has_grant(
        &self,
        agent_id: &AgentId,
        needed: GrantAction,
        chain: &[ScopeRef],
    ) -> EngramResult<bool> {
        let grants = self.list_for_agent(agent_id).await?;
        Ok(chain.iter().any(|scope| {
            grants
                .iter()
                .any(|g| g.scope == *scope && g.action.satisfies(needed))
        }))
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
    async fn test_grant_revoke_roundtrip() {
        let repo = GrantRepository::new(test_deps().await);
        let agent = AgentId::new("agent-a").unwrap();

        repo.grant(&agent, GrantAction::Write, &ScopeRef::global())
            .await
            .unwrap();
        // Idempotent.
        repo.grant(&agent, GrantAction::Write, &ScopeRef::global())
            .await
            .unwrap();
        assert_eq!(repo.list_for_agent(&agent).await.unwrap().len(), 1);

        assert!(repo
            .revoke(&agent, GrantAction::Write, &ScopeRef::global())
            .await
            .unwrap());
        assert!(!repo
            .revoke(&agent, GrantAction::Write, &ScopeRef::global())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_admin_satisfies_read_and_write() {
        let repo = GrantRepository::new(test_deps().await);
        let agent = AgentId::new("root").unwrap();
        repo.grant(&agent, GrantAction::Admin, &ScopeRef::global())
            .await
            .unwrap();

        let chain = [ScopeRef::global()];
        for needed in [GrantAction::Read, GrantAction::Write, GrantAction::Admin] {
            assert!(repo.has_grant(&agent, needed, &chain).await.unwrap());
        }

        let reader = AgentId::new("reader").unwrap();
        repo.grant(&reader, GrantAction::Read, &ScopeRef::global())
            .await
            .unwrap();
        assert!(repo
            .has_grant(&reader, GrantAction::Read, &chain)
            .await
            .unwrap());
        assert!(!repo
            .has_grant(&reader, GrantAction::Write, &chain)
            .await
            .unwrap());
    }
}
