//! Scope repository: organizations, projects, sessions, chain resolution,
//! and cascading scope deletion.

use crate::DbDeps;
use engram_adapters::{
    with_transaction, ChangeAction, ChangeEvent, SqlRow, SqlValue, StorageTransaction,
    ENTRY_CHANGED_CHANNEL,
};
use engram_core::{
    AgentId, EngramError, EngramResult, IdType, Org, OrgId, Project, ProjectId, ScopeChain,
    ScopeKind, ScopeRef, Session, SessionId, ValidationError,
};
use futures_util::FutureExt;
use uuid::Uuid;

// ============================================================================
// COLUMN CODECS
// ============================================================================

/// Scope columns store the id as an empty string for global so the unique
/// indexes treat global rows like any other.
pub(crate) fn scope_to_cols(scope: &ScopeRef) -> (String, String) {
    (
        scope.kind.as_str().to_string(),
        scope.id.map(|id| id.to_string()).unwrap_or_default(),
    )
}

pub(crate) fn scope_from_cols(kind: &str, id: &str) -> EngramResult<ScopeRef> {
    let kind: ScopeKind = kind.parse().map_err(|reason| ValidationError::InvalidScope { reason })?;
    let id = if id.is_empty() {
        None
    } else {
        Some(id.parse::<Uuid>().map_err(|_| ValidationError::InvalidScope {
            reason: format!("malformed scope id '{id}'"),
        })?)
    };
    let scope = ScopeRef { kind, id };
    if !scope.is_well_formed() {
        return Err(ValidationError::InvalidScope {
            reason: format!("{kind} scope requires an id iff non-global"),
        }
        .into());
    }
    Ok(scope)
}

fn decode_org(row: &SqlRow) -> EngramResult<Org> {
    Ok(Org {
        org_id: OrgId::from_uuid(row.uuid("org_id")?),
        name: row.text("name")?,
        description: row.opt_text("description")?,
        created_at: row.timestamp("created_at")?,
        metadata: row.opt_json("metadata")?,
    })
}

fn decode_project(row: &SqlRow) -> EngramResult<Project> {
    Ok(Project {
        project_id: ProjectId::from_uuid(row.uuid("project_id")?),
        org_id: OrgId::from_uuid(row.uuid("org_id")?),
        name: row.text("name")?,
        description: row.opt_text("description")?,
        created_at: row.timestamp("created_at")?,
        metadata: row.opt_json("metadata")?,
    })
}

fn decode_session(row: &SqlRow) -> EngramResult<Session> {
    let agent_id = match row.opt_text("agent_id")? {
        Some(raw) => Some(AgentId::new(raw).map_err(|e| {
            EngramError::from(ValidationError::InvalidIdentifier {
                field: "agent_id".into(),
                input: e.to_string(),
            })
        })?),
        None => None,
    };
    Ok(Session {
        session_id: SessionId::from_uuid(row.uuid("session_id")?),
        project_id: ProjectId::from_uuid(row.uuid("project_id")?),
        agent_id,
        name: row.text("name")?,
        started_at: row.timestamp("started_at")?,
        ended_at: row.opt_timestamp("ended_at")?,
        metadata: row.opt_json("metadata")?,
    })
}

fn json_param(value: &Option<serde_json::Value>) -> SqlValue {
    match value {
        Some(v) => SqlValue::Text(v.to_string()),
        None => SqlValue::Null,
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Repository over the three scope tables.
pub struct ScopeRepository {
    deps: DbDeps,
}

impl ScopeRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    // ========================================================================
    // Organizations
    // ========================================================================

    pub async fn create_org(
        &self,
        name: &str,
        description: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EngramResult<Org> {
        if name.trim().is_empty() {
            return Err(EngramError::missing_field("name"));
        }
        let org = Org {
            org_id: OrgId::now_v7(),
            name: name.trim().to_string(),
            description,
            created_at: chrono::Utc::now(),
            metadata,
        };
        self.deps
            .storage
            .execute(
                "INSERT INTO orgs (org_id, name, description, created_at, metadata)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    SqlValue::from(org.org_id.as_uuid()),
                    SqlValue::from(org.name.as_str()),
                    SqlValue::from(org.description.clone()),
                    SqlValue::from(org.created_at),
                    json_param(&org.metadata),
                ],
            )
            .await
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    engram_core::ResourceError::AlreadyExists {
                        record: "org",
                        name: org.name.clone(),
                        scope: "global".into(),
                    }
                    .into()
                } else {
                    e
                }
            })?;
        Ok(org)
    }

    pub async fn get_org(&self, id: OrgId) -> EngramResult<Option<Org>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT org_id, name, description, created_at, metadata
                 FROM orgs WHERE org_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.first().map(decode_org).transpose()
    }

    pub async fn list_orgs(&self) -> EngramResult<Vec<Org>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT org_id, name, description, created_at, metadata
                 FROM orgs ORDER BY name",
                &[],
            )
            .await?;
        rows.iter().map(decode_org).collect()
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn create_project(
        &self,
        org_id: OrgId,
        name: &str,
        description: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EngramResult<Project> {
        if name.trim().is_empty() {
            return Err(EngramError::missing_field("name"));
        }
        if self.get_org(org_id).await?.is_none() {
            return Err(EngramError::not_found("org", org_id));
        }
        let project = Project {
            project_id: ProjectId::now_v7(),
            org_id,
            name: name.trim().to_string(),
            description,
            created_at: chrono::Utc::now(),
            metadata,
        };
        self.deps
            .storage
            .execute(
                "INSERT INTO projects (project_id, org_id, name, description, created_at, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    SqlValue::from(project.project_id.as_uuid()),
                    SqlValue::from(project.org_id.as_uuid()),
                    SqlValue::from(project.name.as_str()),
                    SqlValue::from(project.description.clone()),
                    SqlValue::from(project.created_at),
                    json_param(&project.metadata),
                ],
            )
            .await
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    engram_core::ResourceError::AlreadyExists {
                        record: "project",
                        name: project.name.clone(),
                        scope: format!("org/{org_id}"),
                    }
                    .into()
                } else {
                    e
                }
            })?;
        Ok(project)
    }

    pub async fn get_project(&self, id: ProjectId) -> EngramResult<Option<Project>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT project_id, org_id, name, description, created_at, metadata
                 FROM projects WHERE project_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.first().map(decode_project).transpose()
    }

    pub async fn list_projects(&self, org_id: OrgId) -> EngramResult<Vec<Project>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT project_id, org_id, name, description, created_at, metadata
                 FROM projects WHERE org_id = $1 ORDER BY name",
                &[SqlValue::from(org_id.as_uuid())],
            )
            .await?;
        rows.iter().map(decode_project).collect()
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub async fn create_session(
        &self,
        project_id: ProjectId,
        name: &str,
        agent_id: Option<AgentId>,
        metadata: Option<serde_json::Value>,
    ) -> EngramResult<Session> {
        if name.trim().is_empty() {
            return Err(EngramError::missing_field("name"));
        }
        if self.get_project(project_id).await?.is_none() {
            return Err(EngramError::not_found("project", project_id));
        }
        let session = Session {
            session_id: SessionId::now_v7(),
            project_id,
            agent_id,
            name: name.trim().to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            metadata,
        };
        self.deps
            .storage
            .execute(
                "INSERT INTO sessions
                     (session_id, project_id, agent_id, name, started_at, ended_at, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    SqlValue::from(session.session_id.as_uuid()),
                    SqlValue::from(session.project_id.as_uuid()),
                    match &session.agent_id {
                        Some(a) => SqlValue::from(a.as_str()),
                        None => SqlValue::Null,
                    },
                    SqlValue::from(session.name.as_str()),
                    SqlValue::from(session.started_at),
                    SqlValue::Null,
                    json_param(&session.metadata),
                ],
            )
            .await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: SessionId) -> EngramResult<Option<Session>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT session_id, project_id, agent_id, name, started_at, ended_at, metadata
                 FROM sessions WHERE session_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.first().map(decode_session).transpose()
    }

    pub async fn end_session(&self, id: SessionId) -> EngramResult<Session> {
        let session = self
            .get_session(id)
            .await?
            .ok_or_else(|| EngramError::not_found("session", id))?;
        let now = chrono::Utc::now();
        self.deps
            .storage
            .execute(
                "UPDATE sessions SET ended_at = $1 WHERE session_id = $2",
                &[SqlValue::from(now), SqlValue::from(id.as_uuid())],
            )
            .await?;
        Ok(Session {
            ended_at: Some(now),
            ..session
        })
    }

    // ========================================================================
    // Chain resolution
    // ========================================================================

    /// Materialize the scope chain most-specific first. Unknown or
    /// malformed identifiers are a validation error, never a silent
    /// fallback to global.
    pub async fn resolve_chain(&self, scope: &ScopeRef) -> EngramResult<ScopeChain> {
        if !scope.is_well_formed() {
            return Err(ValidationError::InvalidScope {
                reason: format!("scope {scope} is missing or carrying an unexpected id"),
            }
            .into());
        }
        let mut chain = Vec::with_capacity(4);
        match scope.kind {
            ScopeKind::Global => {}
            ScopeKind::Org => {
                let org_id = OrgId::from_uuid(scope.id.expect("well-formed"));
                if self.get_org(org_id).await?.is_none() {
                    return Err(ValidationError::InvalidIdentifier {
                        field: "org_id".into(),
                        input: org_id.to_string(),
                    }
                    .into());
                }
                chain.push(*scope);
            }
            ScopeKind::Project => {
                let project_id = ProjectId::from_uuid(scope.id.expect("well-formed"));
                let project = self.get_project(project_id).await?.ok_or_else(|| {
                    EngramError::from(ValidationError::InvalidIdentifier {
                        field: "project_id".into(),
                        input: project_id.to_string(),
                    })
                })?;
                chain.push(*scope);
                chain.push(ScopeRef::org(project.org_id));
            }
            ScopeKind::Session => {
                let session_id = SessionId::from_uuid(scope.id.expect("well-formed"));
                let session = self.get_session(session_id).await?.ok_or_else(|| {
                    EngramError::from(ValidationError::InvalidIdentifier {
                        field: "session_id".into(),
                        input: session_id.to_string(),
                    })
                })?;
                let project = self.get_project(session.project_id).await?.ok_or_else(|| {
                    EngramError::from(ValidationError::InvalidIdentifier {
                        field: "project_id".into(),
                        input: session.project_id.to_string(),
                    })
                })?;
                chain.push(*scope);
                chain.push(ScopeRef::project(session.project_id));
                chain.push(ScopeRef::org(project.org_id));
            }
        }
        chain.push(ScopeRef::global());
        Ok(ScopeChain::new(chain))
    }

    // ========================================================================
    // Cascade deletion
    // ========================================================================

    /// Delete a scope and everything it owns: entries with their versions,
    /// tag attachments, relations (both directions), graph nodes,
    /// embedding records, votes, and child scopes. One transaction.
    pub async fn delete_scope(&self, scope: &ScopeRef, actor: &AgentId) -> EngramResult<u64> {
        if scope.is_global() {
            return Err(ValidationError::InvalidScope {
                reason: "the global scope cannot be deleted".into(),
            }
            .into());
        }
        let targets = self.collect_descendants(scope).await?;
        let actor = actor.clone();
        let deleted = with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let targets = targets.clone();
            let actor = actor.clone();
            async move {
                let mut deleted = 0u64;
                for target in &targets {
                    deleted += delete_scope_rows(tx, target).await?;
                }
                // Remove the scope rows themselves, children first.
                for target in &targets {
                    let (kind, id) = scope_to_cols(target);
                    match kind.as_str() {
                        "session" => {
                            tx.execute(
                                "DELETE FROM sessions WHERE session_id = $1",
                                &[SqlValue::from(id.as_str())],
                            )
                            .await?;
                        }
                        "project" => {
                            tx.execute(
                                "DELETE FROM projects WHERE project_id = $1",
                                &[SqlValue::from(id.as_str())],
                            )
                            .await?;
                        }
                        "org" => {
                            tx.execute(
                                "DELETE FROM orgs WHERE org_id = $1",
                                &[SqlValue::from(id.as_str())],
                            )
                            .await?;
                        }
                        _ => {}
                    }
                }
                crate::audit::append_in_tx(
                    tx,
                    engram_core::AuditAction::ScopeDelete,
                    None,
                    None,
                    &actor,
                    Some(*targets.first().expect("non-empty")),
                    None,
                    Some(serde_json::json!({ "cascaded_scopes": targets.len() })),
                )
                .await?;
                Ok(deleted)
            }
            .boxed()
        })
        .await?;

        let event = ChangeEvent::scope_only(ChangeAction::Delete, *scope);
        self.deps
            .events
            .publish(ENTRY_CHANGED_CHANNEL, serde_json::to_value(&event).unwrap_or_default())
            .await?;
        Ok(deleted)
    }

    /// The scope plus all scopes nested under it, most specific first.
    async fn collect_descendants(&self, scope: &ScopeRef) -> EngramResult<Vec<ScopeRef>> {
        let mut out = Vec::new();
        match scope.kind {
            ScopeKind::Session => out.push(*scope),
            ScopeKind::Project => {
                let project_id = ProjectId::from_uuid(scope.id.expect("non-global"));
                let rows = self
                    .deps
                    .storage
                    .execute(
                        "SELECT session_id FROM sessions WHERE project_id = $1",
                        &[SqlValue::from(project_id.as_uuid())],
                    )
                    .await?;
                for row in &rows {
                    out.push(ScopeRef::session(SessionId::from_uuid(row.uuid("session_id")?)));
                }
                out.push(*scope);
            }
            ScopeKind::Org => {
                let org_id = OrgId::from_uuid(scope.id.expect("non-global"));
                let projects = self.list_projects(org_id).await?;
                for project in &projects {
                    let rows = self
                        .deps
                        .storage
                        .execute(
                            "SELECT session_id FROM sessions WHERE project_id = $1",
                            &[SqlValue::from(project.project_id.as_uuid())],
                        )
                        .await?;
                    for row in &rows {
                        out.push(ScopeRef::session(SessionId::from_uuid(
                            row.uuid("session_id")?,
                        )));
                    }
                }
                for project in &projects {
                    out.push(ScopeRef::project(project.project_id));
                }
                out.push(*scope);
            }
            ScopeKind::Global => {}
        }
        Ok(out)
    }
}

/// Delete the rows owned by one scope inside an open transaction.
async fn delete_scope_rows(
    tx: &mut dyn StorageTransaction,
    scope: &ScopeRef,
) -> EngramResult<u64> {
    let (kind, id) = scope_to_cols(scope);
    let rows = tx
        .execute(
            "SELECT entry_id FROM entries WHERE scope_kind = $1 AND scope_id = $2",
            &[SqlValue::from(kind.as_str()), SqlValue::from(id.as_str())],
        )
        .await?;
    let mut deleted = 0u64;
    for row in &rows {
        let entry_id = row.text("entry_id")?;
        crate::entries::delete_entry_rows(tx, &entry_id).await?;
        deleted += 1;
    }
    Ok(deleted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use engram_adapters::{InProcessEventBus, SqliteAdapter, StorageAdapter};
    use engram_core::TxnRetryConfig;
    use std::sync::Arc;

    pub(crate) async fn test_deps() -> DbDeps {
        let storage = Arc::new(SqliteAdapter::in_memory());
        storage.connect().await.unwrap();
        run_migrations(storage.as_ref(), None).await.unwrap();
        DbDeps::new(
            storage,
            InProcessEventBus::new(64),
            TxnRetryConfig {
                max_retries: 2,
                base_backoff: std::time::Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_org_project_session_hierarchy() {
        let repo = ScopeRepository::new(test_deps().await);

        let org = repo.create_org("acme", None, None).await.unwrap();
        let project = repo
            .create_project(org.org_id, "backend", None, None)
            .await
            .unwrap();
        let session = repo
            .create_session(project.project_id, "pairing", None, None)
            .await
            .unwrap();

        assert_eq!(repo.get_org(org.org_id).await.unwrap().unwrap().name, "acme");
        assert_eq!(
            repo.get_project(project.project_id)
                .await
                .unwrap()
                .unwrap()
                .org_id,
            org.org_id
        );
        assert_eq!(
            repo.get_session(session.session_id)
                .await
                .unwrap()
                .unwrap()
                .project_id,
            project.project_id
        );
    }

    #[tokio::test]
    async fn test_duplicate_org_name_rejected() {
        let repo = ScopeRepository::new(test_deps().await);
        repo.create_org("acme", None, None).await.unwrap();
        let err = repo.create_org("acme", None, None).await.unwrap_err();
        assert_eq!(err.code(), 2002);
    }

    #[tokio::test]
    async fn test_project_requires_existing_org() {
        let repo = ScopeRepository::new(test_deps().await);
        let err = repo
            .create_project(OrgId::now_v7(), "backend", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 2001);
    }

    #[tokio::test]
    async fn test_resolve_chain_orders_specific_first() {
        let repo = ScopeRepository::new(test_deps().await);
        let org = repo.create_org("acme", None, None).await.unwrap();
        let project = repo
            .create_project(org.org_id, "backend", None, None)
            .await
            .unwrap();
        let session = repo
            .create_session(project.project_id, "s", None, None)
            .await
            .unwrap();

        let chain = repo
            .resolve_chain(&ScopeRef::session(session.session_id))
            .await
            .unwrap();
        let kinds: Vec<ScopeKind> = chain.scopes().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ScopeKind::Session,
                ScopeKind::Project,
                ScopeKind::Org,
                ScopeKind::Global
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_chain_rejects_unknown_project() {
        let repo = ScopeRepository::new(test_deps().await);
        let err = repo
            .resolve_chain(&ScopeRef::project(ProjectId::now_v7()))
            .await
            .unwrap_err();
        // Validation error, not a silent fallback.
        assert_eq!(err.code(), 1004);
    }

    #[tokio::test]
    async fn test_global_scope_cannot_be_deleted() {
        let repo = ScopeRepository::new(test_deps().await);
        let actor = AgentId::new("admin").unwrap();
        assert!(repo.delete_scope(&ScopeRef::global(), &actor).await.is_err());
    }
}
