//! Tool handlers and the routing table

mod coordination;
mod entries;
mod query;
mod scopes;

use crate::dispatch::ToolRequest;
use crate::runtime::AppContext;
use engram_core::{AgentId, EngramResult, ValidationError};
use serde_json::{json, Value};

/// Parse a handler's typed parameter struct out of the raw params object.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> EngramResult<T> {
    serde_json::from_value(params.clone()).map_err(|e| {
        ValidationError::InvalidValue {
            field: "params".into(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// One entry in the tool catalog.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub actions: &'static [&'static str],
    pub input_schema: Value,
}

/// The advertised tool set. The dispatcher's routing table and this
/// catalog are kept adjacent so they cannot drift silently.
pub fn tool_catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "guideline",
            description: "Create, read, version, and retire guideline entries",
            actions: &["create", "get", "list", "update", "delete", "history", "deactivate", "reactivate"],
            input_schema: entries::entry_schema("guideline"),
        },
        ToolSpec {
            name: "knowledge",
            description: "Create, read, version, and retire knowledge entries",
            actions: &["create", "get", "list", "update", "delete", "history", "deactivate", "reactivate"],
            input_schema: entries::entry_schema("knowledge"),
        },
        ToolSpec {
            name: "tool",
            description: "Create, read, version, and retire tool entries",
            actions: &["create", "get", "list", "update", "delete", "history", "deactivate", "reactivate"],
            input_schema: entries::entry_schema("tool"),
        },
        ToolSpec {
            name: "org",
            description: "Organization scope management",
            actions: &["create", "get", "list", "delete"],
            input_schema: scopes::org_schema(),
        },
        ToolSpec {
            name: "project",
            description: "Project scope management",
            actions: &["create", "get", "list", "delete"],
            input_schema: scopes::project_schema(),
        },
        ToolSpec {
            name: "session",
            description: "Session scope management",
            actions: &["create", "get", "end", "delete"],
            input_schema: scopes::session_schema(),
        },
        ToolSpec {
            name: "query",
            description: "Ranked retrieval across entry kinds with inheritance",
            actions: &["search", "context"],
            input_schema: query::query_schema(),
        },
        ToolSpec {
            name: "tag",
            description: "Tag management and attachment",
            actions: &["create", "list", "delete", "attach", "detach"],
            input_schema: entries::tag_schema(),
        },
        ToolSpec {
            name: "relation",
            description: "Typed directed relations between entries",
            actions: &["create", "delete", "list", "graph"],
            input_schema: entries::relation_schema(),
        },
        ToolSpec {
            name: "file_lock",
            description: "Exclusive time-bounded file claims for agents",
            actions: &["acquire", "release", "extend", "status", "list"],
            input_schema: coordination::lock_schema(),
        },
        ToolSpec {
            name: "permission",
            description: "Grant management and checks",
            actions: &["grant", "revoke", "list", "check"],
            input_schema: coordination::permission_schema(),
        },
        ToolSpec {
            name: "conflict",
            description: "Concurrent-update conflict inspection and resolution",
            actions: &["list", "get", "resolve"],
            input_schema: coordination::conflict_schema(),
        },
        ToolSpec {
            name: "voting",
            description: "Up/down votes on entries",
            actions: &["cast", "retract", "tally"],
            input_schema: coordination::voting_schema(),
        },
        ToolSpec {
            name: "analytics",
            description: "Store statistics, cache counters, and audit history",
            actions: &["stats", "audit"],
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["stats", "audit"] },
                    "entity_id": { "type": "string", "format": "uuid" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 500 }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "export",
            description: "Export entries for a kind and scope as JSON",
            actions: &["run"],
            input_schema: crate::transfer::export_schema(),
        },
        ToolSpec {
            name: "import",
            description: "Import a previously exported JSON document",
            actions: &["run"],
            input_schema: crate::transfer::import_schema(),
        },
        ToolSpec {
            name: "backup",
            description: "Database backups: create, list, cleanup",
            actions: &["create", "list", "cleanup"],
            input_schema: crate::transfer::backup_schema(),
        },
        ToolSpec {
            name: "verify",
            description: "Check a proposed action against critical guidelines",
            actions: &["check"],
            input_schema: query::verify_schema(),
        },
        ToolSpec {
            name: "health",
            description: "Service health",
            actions: &["get"],
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolSpec {
            name: "init",
            description: "Initialize storage and report the data layout",
            actions: &["run"],
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

/// Route one request to its handler.
pub async fn route(
    ctx: &AppContext,
    agent: &AgentId,
    request: &ToolRequest,
) -> EngramResult<Value> {
    let tool = request.tool.as_str();
    let action = request.action.as_str();
    let params = &request.params;

    match (tool, action) {
        ("guideline" | "knowledge" | "tool", _) => {
            entries::handle_entry(ctx, agent, tool, action, params).await
        }
        ("org" | "project" | "session", _) => {
            scopes::handle_scope(ctx, agent, tool, action, params).await
        }
        ("tag", _) => entries::handle_tag(ctx, action, params).await,
        ("relation", _) => entries::handle_relation(ctx, agent, action, params).await,
        ("query", _) => query::handle_query(ctx, action, params).await,
        ("file_lock", _) => coordination::handle_lock(ctx, agent, action, params).await,
        ("permission", _) => coordination::handle_permission(ctx, agent, action, params).await,
        ("conflict", _) => coordination::handle_conflict(ctx, agent, action, params).await,
        ("voting", _) => coordination::handle_voting(ctx, agent, action, params).await,
        ("analytics", "stats") => query::handle_analytics(ctx).await,
        ("analytics", "audit") => query::handle_audit_log(ctx, params).await,
        ("export", _) => crate::transfer::handle_export(ctx, params).await,
        ("import", _) => crate::transfer::handle_import(ctx, agent, params).await,
        ("backup", _) => crate::transfer::handle_backup(ctx, action, params).await,
        ("verify", _) => query::handle_verify(ctx, params).await,
        ("health", _) => Ok(serde_json::to_value(ctx.health().await).unwrap_or_default()),
        ("init", _) => query::handle_init(ctx).await,
        _ => Err(ValidationError::UnknownAction {
            tool: tool.to_string(),
            action: action.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique() {
        let catalog = tool_catalog();
        let mut names: Vec<&str> = catalog.iter().map(|t| t.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_catalog_schemas_are_objects() {
        for spec in tool_catalog() {
            assert!(spec.input_schema.is_object(), "{} schema", spec.name);
            assert!(!spec.actions.is_empty());
        }
    }
}
