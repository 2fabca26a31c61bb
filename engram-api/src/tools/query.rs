//! Query, analytics, verification, health, and init handlers

use super::parse_params;
use crate::runtime::AppContext;
use engram_core::{
    EngramResult, QueryRequest, ResponseShape, ScopeChain, ScopeRef, ValidationError,
};
use engram_services::ProposedAction;
use serde::Deserialize;
use serde_json::{json, Value};

pub(super) fn query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["search", "context"] },
            "scope": {
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": ["global", "org", "project", "session"] },
                    "id": { "type": "string", "format": "uuid" },
                    "inherit": { "type": "boolean", "default": true }
                },
                "required": ["type"]
            },
            "types": {
                "type": "array",
                "items": { "type": "string", "enum": ["guidelines", "knowledge", "tools"] }
            },
            "search": { "type": "string" },
            "tags": {
                "type": "object",
                "properties": {
                    "include": { "type": "array", "items": { "type": "string" } },
                    "require": { "type": "array", "items": { "type": "string" } },
                    "exclude": { "type": "array", "items": { "type": "string" } }
                }
            },
            "category": { "type": "string" },
            "priority": {
                "type": "object",
                "properties": { "min": { "type": "integer" }, "max": { "type": "integer" } }
            },
            "related_to": {
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "id": { "type": "string", "format": "uuid" },
                    "direction": { "type": "string", "enum": ["forward", "backward", "both"] },
                    "depth": { "type": "integer", "minimum": 1, "maximum": 5 }
                }
            },
            "semantic": {
                "type": "object",
                "properties": {
                    "enabled": { "type": "boolean" },
                    "threshold": { "type": "number" }
                }
            },
            "limit": { "type": "integer", "minimum": 1, "maximum": 100 },
            "cursor": { "type": "string" }
        },
        "required": ["action", "scope"]
    })
}

pub(super) fn verify_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["check"] },
            "description": { "type": "string" },
            "payload": { "type": "object" },
            "scope": {
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "id": { "type": "string", "format": "uuid" }
                }
            }
        },
        "required": ["action", "description"]
    })
}

pub(super) async fn handle_query(
    ctx: &AppContext,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let mut request: QueryRequest = parse_params(params)?;
    if action == "context" {
        request.shape = ResponseShape::Context;
    }
    let response = ctx.engine.execute(request).await?;
    Ok(serde_json::to_value(response).unwrap_or_default())
}

#[derive(Deserialize)]
struct VerifyParams {
    description: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    scope: Option<ScopeRef>,
}

pub(super) async fn handle_verify(ctx: &AppContext, params: &Value) -> EngramResult<Value> {
    let p: VerifyParams = parse_params(params)?;
    let chain: ScopeChain = match p.scope {
        Some(scope) => ctx.entries.resolve_chain(&scope).await?,
        None => ScopeChain::global_only(),
    };
    let outcome = ctx
        .verification
        .verify(
            &ProposedAction {
                description: p.description,
                payload: p.payload,
            },
            &chain,
        )
        .await?;
    Ok(serde_json::to_value(outcome).unwrap_or_default())
}

const ANALYTICS_CACHE_KEY: &str = "analytics:stats";
const ANALYTICS_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(5);

pub(super) async fn handle_analytics(ctx: &AppContext) -> EngramResult<Value> {
    // Derived counts are cheap to serve from the shared cache for a few
    // seconds; misses fall through to fresh counting.
    if let Ok(Some(cached)) = ctx.runtime.stats_cache.get(ANALYTICS_CACHE_KEY).await {
        if let Ok(value) = serde_json::from_slice::<Value>(&cached) {
            return Ok(value);
        }
    }

    let mut counts = serde_json::Map::new();
    for (label, sql) in [
        ("entries", "SELECT COUNT(*) AS n FROM entries WHERE active = 1"),
        ("inactive_entries", "SELECT COUNT(*) AS n FROM entries WHERE active = 0"),
        ("versions", "SELECT COUNT(*) AS n FROM entry_versions"),
        ("tags", "SELECT COUNT(*) AS n FROM tags"),
        ("relations", "SELECT COUNT(*) AS n FROM relations"),
        ("unresolved_conflicts", "SELECT COUNT(*) AS n FROM conflicts WHERE resolved = 0"),
        ("active_locks", "SELECT COUNT(*) AS n FROM file_locks"),
    ] {
        let rows = ctx.storage.execute(sql, &[]).await?;
        let n = rows.first().map(|r| r.integer("n")).transpose()?.unwrap_or(0);
        counts.insert(label.to_string(), json!(n));
    }

    let cache = ctx.runtime.query_cache.stats();
    let (stored, failed) = ctx.embeddings.stats().await?;
    let stats = json!({
        "counts": counts,
        "query_cache": {
            "hits": cache.hits,
            "misses": cache.misses,
            "invalidations": cache.invalidations,
            "entries": cache.entries,
            "bytes": cache.bytes,
        },
        "embeddings": { "stored": stored, "failed": failed },
        "audit_write_failures": ctx.audit.failure_count(),
        "rate_limit_buckets": ctx.runtime.rate_limiter.bucket_count(),
    });

    if let Ok(bytes) = serde_json::to_vec(&stats) {
        let _ = ctx
            .runtime
            .stats_cache
            .set(ANALYTICS_CACHE_KEY, bytes, Some(ANALYTICS_CACHE_TTL))
            .await;
    }
    Ok(stats)
}

#[derive(Deserialize)]
struct AuditLogParams {
    #[serde(default)]
    entity_id: Option<uuid::Uuid>,
    #[serde(default)]
    limit: Option<u32>,
}

pub(super) async fn handle_audit_log(ctx: &AppContext, params: &Value) -> EngramResult<Value> {
    let p: AuditLogParams = parse_params(params)?;
    let limit = p.limit.unwrap_or(50).min(500);
    let records = match p.entity_id {
        Some(entity_id) => ctx.audit_repo.for_entity(entity_id, limit).await?,
        None => ctx.audit_repo.recent(limit).await?,
    };
    let count = records.len();
    Ok(json!({ "records": records, "count": count }))
}

pub(super) async fn handle_init(ctx: &AppContext) -> EngramResult<Value> {
    // Migrations already ran at context build; init re-validates and
    // reports the layout so agents can confirm their environment.
    ctx.storage.health().await?;
    Ok(json!({
        "data_dir": ctx.config.data_dir.display().to_string(),
        "backend": ctx.storage.backend_name(),
        "environment": ctx.config.environment,
        "embedding_enabled": ctx.runtime.embedding_pool.is_some(),
    }))
}

// Keep the unknown-action error close to the other handlers for reuse.
#[allow(dead_code)]
pub(super) fn unknown(tool: &str, action: &str) -> engram_core::EngramError {
    ValidationError::UnknownAction {
        tool: tool.to_string(),
        action: action.to_string(),
    }
    .into()
}
