//! Scope tool handlers: org, project, session

use super::parse_params;
use crate::runtime::AppContext;
use engram_core::{
    AgentId, EngramError, EngramResult, OrgId, ProjectId, ScopeRef, SessionId, ValidationError,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub(super) fn org_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "get", "list", "delete"] },
            "id": { "type": "string", "format": "uuid" },
            "name": { "type": "string" },
            "description": { "type": "string" },
            "metadata": { "type": "object" }
        },
        "required": ["action"]
    })
}

pub(super) fn project_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "get", "list", "delete"] },
            "id": { "type": "string", "format": "uuid" },
            "org_id": { "type": "string", "format": "uuid" },
            "name": { "type": "string" },
            "description": { "type": "string" },
            "metadata": { "type": "object" }
        },
        "required": ["action"]
    })
}

pub(super) fn session_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "get", "end", "delete"] },
            "id": { "type": "string", "format": "uuid" },
            "project_id": { "type": "string", "format": "uuid" },
            "name": { "type": "string" },
            "metadata": { "type": "object" }
        },
        "required": ["action"]
    })
}

#[derive(Deserialize)]
struct ScopeParams {
    id: Option<uuid::Uuid>,
    org_id: Option<OrgId>,
    project_id: Option<ProjectId>,
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

pub(super) async fn handle_scope(
    ctx: &AppContext,
    agent: &AgentId,
    tool: &str,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: ScopeParams = parse_params(params)?;
    match (tool, action) {
        ("org", "create") => {
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let org = ctx.scopes.create_org(&name, p.description, p.metadata).await?;
            Ok(json!({ "org": org }))
        }
        ("org", "get") => {
            let id = OrgId::from_uuid_param(p.id)?;
            let org = ctx
                .scopes
                .get_org(id)
                .await?
                .ok_or_else(|| EngramError::not_found("org", id))?;
            Ok(json!({ "org": org }))
        }
        ("org", "list") => {
            let orgs = ctx.scopes.list_orgs().await?;
            let count = orgs.len();
            Ok(json!({ "orgs": orgs, "count": count }))
        }
        ("org", "delete") => {
            let id = OrgId::from_uuid_param(p.id)?;
            let removed = ctx
                .scopes
                .delete_scope(&ScopeRef::org(id), agent)
                .await?;
            Ok(json!({ "deleted": true, "entries_removed": removed }))
        }
        ("project", "create") => {
            let org_id = p.org_id.ok_or_else(|| EngramError::missing_field("org_id"))?;
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let project = ctx
                .scopes
                .create_project(org_id, &name, p.description, p.metadata)
                .await?;
            Ok(json!({ "project": project }))
        }
        ("project", "get") => {
            let id = ProjectId::from_uuid_param(p.id)?;
            let project = ctx
                .scopes
                .get_project(id)
                .await?
                .ok_or_else(|| EngramError::not_found("project", id))?;
            Ok(json!({ "project": project }))
        }
        ("project", "list") => {
            let org_id = p.org_id.ok_or_else(|| EngramError::missing_field("org_id"))?;
            let projects = ctx.scopes.list_projects(org_id).await?;
            let count = projects.len();
            Ok(json!({ "projects": projects, "count": count }))
        }
        ("project", "delete") => {
            let id = ProjectId::from_uuid_param(p.id)?;
            let removed = ctx
                .scopes
                .delete_scope(&ScopeRef::project(id), agent)
                .await?;
            Ok(json!({ "deleted": true, "entries_removed": removed }))
        }
        ("session", "create") => {
            let project_id = p
                .project_id
                .ok_or_else(|| EngramError::missing_field("project_id"))?;
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let session = ctx
                .scopes
                .create_session(project_id, &name, Some(agent.clone()), p.metadata)
                .await?;
            Ok(json!({ "session": session }))
        }
        ("session", "get") => {
            let id = SessionId::from_uuid_param(p.id)?;
            let session = ctx
                .scopes
                .get_session(id)
                .await?
                .ok_or_else(|| EngramError::not_found("session", id))?;
            Ok(json!({ "session": session }))
        }
        ("session", "end") => {
            let id = SessionId::from_uuid_param(p.id)?;
            let session = ctx.scopes.end_session(id).await?;
            Ok(json!({ "session": session }))
        }
        ("session", "delete") => {
            let id = SessionId::from_uuid_param(p.id)?;
            let removed = ctx
                .scopes
                .delete_scope(&ScopeRef::session(id), agent)
                .await?;
            Ok(json!({ "deleted": true, "entries_removed": removed }))
        }
        (tool, other) => Err(ValidationError::UnknownAction {
            tool: tool.to_string(),
            action: other.to_string(),
        }
        .into()),
    }
}

/// Small helper: required uuid param into a typed id.
trait FromUuidParam: Sized {
    fn from_uuid_param(raw: Option<uuid::Uuid>) -> EngramResult<Self>;
}

macro_rules! impl_from_uuid_param {
    ($($name:ident),*) => {
        $(impl FromUuidParam for $name {
            fn from_uuid_param(raw: Option<uuid::Uuid>) -> EngramResult<Self> {
                raw.map(<$name as engram_core::IdType>::from_uuid)
                    .ok_or_else(|| EngramError::missing_field("id"))
            }
        })*
    };
}

impl_from_uuid_param!(OrgId, ProjectId, SessionId);
