//! Entry, tag, and relation tool handlers

use super::parse_params;
use crate::runtime::AppContext;
use engram_core::{
    AgentId, Direction, EngramError, EngramResult, Entry, EntryFilter, EntryId, EntryKind,
    EntryPatch, EntryPayload, GuidelineExamples, GuidelinePayload, KnowledgePayload, Page,
    RelationId, RelationType, ScopeRef, Timestamp, ToolPayload, ValidationError,
};
use engram_repos::NewEntry;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;

// ============================================================================
// SCHEMAS
// ============================================================================

pub(super) fn entry_schema(kind: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["create", "get", "list", "update", "delete", "history",
                         "deactivate", "reactivate"]
            },
            "id": { "type": "string", "format": "uuid" },
            "name": { "type": "string" },
            "scope": {
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": ["global", "org", "project", "session"] },
                    "id": { "type": "string", "format": "uuid" }
                },
                "required": ["type"]
            },
            "category": { "type": "string" },
            "tags": { "type": "array", "items": { "type": "string" } },
            "reason": { "type": "string", "description": format!("Change reason recorded on the new {kind} version") },
        },
        "required": ["action"]
    })
}

pub(super) fn tag_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "list", "delete", "attach", "detach"] },
            "name": { "type": "string" },
            "color": { "type": "string" },
            "description": { "type": "string" },
            "entry_type": { "type": "string", "enum": ["guideline", "knowledge", "tool"] },
            "entry_id": { "type": "string", "format": "uuid" }
        },
        "required": ["action"]
    })
}

pub(super) fn relation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "delete", "list", "graph"] },
            "source_type": { "type": "string", "enum": ["guideline", "knowledge", "tool"] },
            "source_id": { "type": "string", "format": "uuid" },
            "target_type": { "type": "string", "enum": ["guideline", "knowledge", "tool"] },
            "target_id": { "type": "string", "format": "uuid" },
            "relation_type": {
                "type": "string",
                "enum": ["applies_to", "depends_on", "conflicts_with", "related_to",
                         "parent_task", "subtask_of"]
            },
            "properties": { "type": "object" }
        },
        "required": ["action"]
    })
}

// ============================================================================
// ENTRY HANDLERS
// ============================================================================

#[derive(Deserialize)]
struct CreateParams {
    name: String,
    scope: ScopeRef,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    correlation_id: Option<uuid::Uuid>,
    #[serde(flatten)]
    payload: PayloadParams,
}

/// Kind-specific payload fields, flattened into the params object.
#[derive(Deserialize, Default, Clone)]
struct PayloadParams {
    // guideline / knowledge
    content: Option<String>,
    rationale: Option<String>,
    examples: Option<Value>,
    priority: Option<i32>,
    source: Option<String>,
    confidence: Option<f64>,
    valid_from: Option<Timestamp>,
    valid_until: Option<Timestamp>,
    // tool
    description: Option<String>,
    parameters: Option<Value>,
    constraints: Option<String>,
}

impl PayloadParams {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.rationale.is_none()
            && self.examples.is_none()
            && self.priority.is_none()
            && self.source.is_none()
            && self.confidence.is_none()
            && self.valid_from.is_none()
            && self.valid_until.is_none()
            && self.description.is_none()
            && self.parameters.is_none()
            && self.constraints.is_none()
    }

    /// Build a full payload, starting from `base` when patching.
    fn build(&self, kind: EntryKind, base: Option<&EntryPayload>) -> EngramResult<EntryPayload> {
        match kind {
            EntryKind::Guideline => {
                let base = match base {
                    Some(EntryPayload::Guideline(g)) => Some(g),
                    _ => None,
                };
                let examples = match &self.examples {
                    Some(raw) => serde_json::from_value::<GuidelineExamples>(raw.clone())
                        .map_err(|e| {
                            EngramError::invalid_value("examples", e.to_string())
                        })?,
                    None => base.map(|b| b.examples.clone()).unwrap_or_default(),
                };
                Ok(EntryPayload::Guideline(GuidelinePayload {
                    content: self
                        .content
                        .clone()
                        .or_else(|| base.map(|b| b.content.clone()))
                        .ok_or_else(|| EngramError::missing_field("content"))?,
                    rationale: self
                        .rationale
                        .clone()
                        .or_else(|| base.and_then(|b| b.rationale.clone())),
                    examples,
                    priority: self
                        .priority
                        .or_else(|| base.map(|b| b.priority))
                        .unwrap_or(50),
                }))
            }
            EntryKind::Knowledge => {
                let base = match base {
                    Some(EntryPayload::Knowledge(k)) => Some(k),
                    _ => None,
                };
                Ok(EntryPayload::Knowledge(KnowledgePayload {
                    content: self
                        .content
                        .clone()
                        .or_else(|| base.map(|b| b.content.clone()))
                        .ok_or_else(|| EngramError::missing_field("content"))?,
                    source: self
                        .source
                        .clone()
                        .or_else(|| base.and_then(|b| b.source.clone())),
                    confidence: self
                        .confidence
                        .or_else(|| base.map(|b| b.confidence))
                        .unwrap_or(0.8),
                    valid_from: self.valid_from.or_else(|| base.and_then(|b| b.valid_from)),
                    valid_until: self
                        .valid_until
                        .or_else(|| base.and_then(|b| b.valid_until)),
                }))
            }
            EntryKind::Tool => {
                let base = match base {
                    Some(EntryPayload::Tool(t)) => Some(t),
                    _ => None,
                };
                let examples = match &self.examples {
                    Some(raw) => serde_json::from_value::<Vec<String>>(raw.clone())
                        .map_err(|e| EngramError::invalid_value("examples", e.to_string()))?,
                    None => base.map(|b| b.examples.clone()).unwrap_or_default(),
                };
                Ok(EntryPayload::Tool(ToolPayload {
                    description: self
                        .description
                        .clone()
                        .or_else(|| base.map(|b| b.description.clone()))
                        .ok_or_else(|| EngramError::missing_field("description"))?,
                    parameters: self
                        .parameters
                        .clone()
                        .or_else(|| base.map(|b| b.parameters.clone()))
                        .unwrap_or_else(|| json!({})),
                    examples,
                    constraints: self
                        .constraints
                        .clone()
                        .or_else(|| base.and_then(|b| b.constraints.clone())),
                }))
            }
        }
    }
}

#[derive(Deserialize)]
struct GetParams {
    id: Option<EntryId>,
    name: Option<String>,
    scope: Option<ScopeRef>,
    #[serde(default = "default_true")]
    inherit: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct ListParams {
    scope: ScopeRef,
    #[serde(default = "default_true")]
    inherit: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    include_inactive: bool,
    #[serde(default)]
    name_prefix: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: EntryId,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    correlation_id: Option<uuid::Uuid>,
    #[serde(flatten)]
    payload: PayloadParams,
}

#[derive(Deserialize)]
struct IdParams {
    id: EntryId,
    #[serde(default)]
    reason: Option<String>,
}

fn entry_value(entry: &Entry) -> Value {
    serde_json::to_value(entry).unwrap_or_default()
}

pub(super) async fn handle_entry(
    ctx: &AppContext,
    agent: &AgentId,
    tool: &str,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let kind = EntryKind::from_str(tool)
        .map_err(|reason| EngramError::invalid_value("tool", reason))?;
    match action {
        "create" => {
            let p: CreateParams = parse_params(params)?;
            let payload = p.payload.build(kind, None)?;
            let entry = ctx
                .entries
                .create(NewEntry {
                    name: p.name,
                    category: p.category,
                    scope: p.scope,
                    payload,
                    tags: p.tags,
                    created_by: agent.clone(),
                    correlation_id: p.correlation_id,
                })
                .await?;
            Ok(json!({ "entry": entry_value(&entry) }))
        }
        "get" => {
            let p: GetParams = parse_params(params)?;
            let entry = match (p.id, p.name) {
                (Some(id), _) => ctx.entries.get_by_id(id).await?,
                (None, Some(name)) => {
                    let scope = p.scope.unwrap_or_else(ScopeRef::global);
                    ctx.entries.get_by_name(kind, &name, &scope, p.inherit).await?
                }
                (None, None) => return Err(EngramError::missing_field("id or name")),
            };
            match entry {
                Some(entry) if entry.kind == kind => {
                    let tags = ctx.tags.tags_for_entry(kind, entry.entry_id).await?;
                    Ok(json!({ "entry": entry_value(&entry), "tags": tags }))
                }
                _ => Err(EngramError::not_found(kind.as_str(), "requested entry")),
            }
        }
        "list" => {
            let p: ListParams = parse_params(params)?;
            let entries = ctx
                .entries
                .list(
                    kind,
                    &EntryFilter {
                        scope: p.scope,
                        inherit: p.inherit,
                        category: p.category,
                        include_inactive: p.include_inactive,
                        name_prefix: p.name_prefix,
                    },
                    Page {
                        limit: p.limit.unwrap_or(50).min(200),
                        offset: p.offset.unwrap_or(0),
                    },
                )
                .await?;
            let count = entries.len();
            Ok(json!({
                "entries": entries.iter().map(entry_value).collect::<Vec<_>>(),
                "count": count,
            }))
        }
        "update" => {
            let p: UpdateParams = parse_params(params)?;
            let payload = if p.payload.is_empty() {
                None
            } else {
                let current = ctx
                    .entries
                    .get_by_id(p.id)
                    .await?
                    .ok_or_else(|| EngramError::not_found(kind.as_str(), p.id))?;
                Some(p.payload.build(kind, Some(&current.payload))?)
            };
            let (entry, conflict) = ctx
                .entries
                .update(
                    p.id,
                    EntryPatch {
                        name: p.name,
                        category: p.category,
                        payload,
                    },
                    p.reason.as_deref().unwrap_or(""),
                    agent,
                    p.correlation_id,
                )
                .await?;
            Ok(json!({
                "entry": entry_value(&entry),
                "conflict": conflict,
            }))
        }
        "delete" => {
            let p: IdParams = parse_params(params)?;
            let entry = ctx.entries.delete(p.id, agent).await?;
            Ok(json!({ "deleted": true, "entry_id": entry.entry_id }))
        }
        "history" => {
            let p: IdParams = parse_params(params)?;
            let versions = ctx.entries.history(p.id).await?;
            if versions.is_empty() {
                return Err(EngramError::not_found(kind.as_str(), p.id));
            }
            let count = versions.len();
            Ok(json!({ "versions": versions, "count": count }))
        }
        "deactivate" => {
            let p: IdParams = parse_params(params)?;
            let entry = ctx
                .entries
                .deactivate(p.id, p.reason.as_deref().unwrap_or(""), agent)
                .await?;
            Ok(json!({ "entry": entry_value(&entry) }))
        }
        "reactivate" => {
            let p: IdParams = parse_params(params)?;
            let reason = p
                .reason
                .ok_or_else(|| EngramError::missing_field("reason"))?;
            let entry = ctx.entries.reactivate(p.id, &reason, agent).await?;
            Ok(json!({ "entry": entry_value(&entry) }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: tool.to_string(),
            action: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// TAG HANDLERS
// ============================================================================

#[derive(Deserialize)]
struct TagParams {
    name: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    description: Option<String>,
    entry_type: Option<EntryKind>,
    entry_id: Option<EntryId>,
}

pub(super) async fn handle_tag(
    ctx: &AppContext,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: TagParams = parse_params(params)?;
    match action {
        "create" => {
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let tag = ctx.tags.create(&name, p.color, p.description).await?;
            Ok(json!({ "tag": tag }))
        }
        "list" => {
            let tags = ctx.tags.list().await?;
            let count = tags.len();
            Ok(json!({ "tags": tags, "count": count }))
        }
        "delete" => {
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let deleted = ctx.tags.delete(&name).await?;
            Ok(json!({ "deleted": deleted }))
        }
        "attach" | "detach" => {
            let name = p.name.ok_or_else(|| EngramError::missing_field("name"))?;
            let kind = p
                .entry_type
                .ok_or_else(|| EngramError::missing_field("entry_type"))?;
            let entry_id = p
                .entry_id
                .ok_or_else(|| EngramError::missing_field("entry_id"))?;
            if action == "attach" {
                let tag = ctx.tags.attach(kind, entry_id, &name).await?;
                Ok(json!({ "attached": true, "tag": tag }))
            } else {
                let detached = ctx.tags.detach(kind, entry_id, &name).await?;
                Ok(json!({ "detached": detached }))
            }
        }
        other => Err(ValidationError::UnknownAction {
            tool: "tag".into(),
            action: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// RELATION HANDLERS
// ============================================================================

#[derive(Deserialize)]
struct RelationParams {
    id: Option<RelationId>,
    source_type: Option<EntryKind>,
    source_id: Option<EntryId>,
    target_type: Option<EntryKind>,
    target_id: Option<EntryId>,
    relation_type: Option<RelationType>,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(rename = "type")]
    entry_type: Option<EntryKind>,
    entry_id: Option<EntryId>,
    #[serde(default)]
    direction: Option<Direction>,
}

pub(super) async fn handle_relation(
    ctx: &AppContext,
    agent: &AgentId,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: RelationParams = parse_params(params)?;
    match action {
        "create" => {
            let relation = ctx
                .relations
                .create(
                    p.source_type
                        .ok_or_else(|| EngramError::missing_field("source_type"))?,
                    p.source_id
                        .ok_or_else(|| EngramError::missing_field("source_id"))?,
                    p.target_type
                        .ok_or_else(|| EngramError::missing_field("target_type"))?,
                    p.target_id
                        .ok_or_else(|| EngramError::missing_field("target_id"))?,
                    p.relation_type
                        .ok_or_else(|| EngramError::missing_field("relation_type"))?,
                    p.properties,
                    agent,
                )
                .await?;
            Ok(json!({ "relation": relation }))
        }
        "delete" => {
            let id = p.id.ok_or_else(|| EngramError::missing_field("id"))?;
            let deleted = ctx.relations.delete(id).await?;
            Ok(json!({ "deleted": deleted }))
        }
        "list" => {
            let entry_id = p
                .entry_id
                .ok_or_else(|| EngramError::missing_field("entry_id"))?;
            let relations = ctx
                .relations
                .for_entry(entry_id, p.direction.unwrap_or(Direction::Both))
                .await?;
            let count = relations.len();
            Ok(json!({ "relations": relations, "count": count }))
        }
        "graph" => {
            let entry_id = p
                .entry_id
                .ok_or_else(|| EngramError::missing_field("entry_id"))?;
            let edges = ctx.relations.edges_for_entry(entry_id).await?;
            let count = edges.len();
            Ok(json!({ "edges": edges, "count": count }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: "relation".into(),
            action: other.to_string(),
        }
        .into()),
    }
}
