//! Coordination tool handlers: file locks, permissions, conflicts, votes

use super::parse_params;
use crate::runtime::AppContext;
use engram_core::{
    AgentId, ConflictId, ConflictResolution, EngramError, EngramResult, EntryId, EntryKind,
    EntryPatch, LockHandle, LockId, ScopeRef, ValidationError, VersionId,
};
use engram_repos::{GrantAction, VoteValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

// ============================================================================
// SCHEMAS
// ============================================================================

pub(super) fn lock_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["acquire", "release", "extend", "status", "list"] },
            "path": { "type": "string" },
            "ttl_ms": { "type": "integer", "minimum": 1000, "default": 60000 },
            "lock_id": { "type": "string", "format": "uuid" },
            "token": { "type": "string" }
        },
        "required": ["action"]
    })
}

pub(super) fn permission_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["grant", "revoke", "list", "check"] },
            "target_agent_id": { "type": "string" },
            "grant": { "type": "string", "enum": ["read", "write", "admin"] },
            "scope": {
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "id": { "type": "string", "format": "uuid" }
                }
            }
        },
        "required": ["action"]
    })
}

pub(super) fn conflict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["list", "get", "resolve"] },
            "id": { "type": "string", "format": "uuid" },
            "entry_id": { "type": "string", "format": "uuid" },
            "winning_version": { "type": "string", "format": "uuid" },
            "merged": { "type": "object" }
        },
        "required": ["action"]
    })
}

pub(super) fn voting_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["cast", "retract", "tally"] },
            "entry_type": { "type": "string", "enum": ["guideline", "knowledge", "tool"] },
            "entry_id": { "type": "string", "format": "uuid" },
            "vote": { "type": "string", "enum": ["up", "down"] }
        },
        "required": ["action", "entry_type", "entry_id"]
    })
}

// ============================================================================
// FILE LOCKS
// ============================================================================

#[derive(Deserialize)]
struct LockParams {
    path: Option<String>,
    #[serde(default)]
    ttl_ms: Option<u64>,
    lock_id: Option<LockId>,
    token: Option<String>,
}

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
const MAX_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

pub(super) async fn handle_lock(
    ctx: &AppContext,
    agent: &AgentId,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: LockParams = parse_params(params)?;
    let ttl = p
        .ttl_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_LOCK_TTL)
        .min(MAX_LOCK_TTL);
    match action {
        "acquire" => {
            let path = p.path.ok_or_else(|| EngramError::missing_field("path"))?;
            match ctx.file_locks.acquire(&path, agent, ttl).await? {
                Some(handle) => Ok(json!({ "acquired": true, "lock": handle })),
                None => {
                    let holder = ctx.file_locks.get(&path).await?;
                    Ok(json!({ "acquired": false, "held_by": holder.map(|l| l.owner) }))
                }
            }
        }
        "release" | "extend" => {
            let path = p.path.ok_or_else(|| EngramError::missing_field("path"))?;
            let token = p.token.ok_or_else(|| EngramError::missing_field("token"))?;
            let lock_id = p
                .lock_id
                .ok_or_else(|| EngramError::missing_field("lock_id"))?;
            let handle = LockHandle {
                lock_id,
                path,
                owner: agent.clone(),
                token,
                expires_at: chrono::Utc::now(),
            };
            if action == "release" {
                let released = ctx.file_locks.release(&handle).await?;
                Ok(json!({ "released": released }))
            } else {
                let extended = ctx.file_locks.extend(&handle, ttl).await?;
                Ok(json!({ "extended": extended }))
            }
        }
        "status" => {
            let path = p.path.ok_or_else(|| EngramError::missing_field("path"))?;
            let lock = ctx.file_locks.get(&path).await?;
            Ok(json!({
                "locked": lock.is_some(),
                "lock": lock,
            }))
        }
        "list" => {
            let locks = ctx.file_locks.list_active().await?;
            let count = locks.len();
            Ok(json!({ "locks": locks, "count": count }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: "file_lock".into(),
            action: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// PERMISSIONS
// ============================================================================

#[derive(Deserialize)]
struct PermissionParams {
    target_agent_id: Option<String>,
    grant: Option<GrantAction>,
    #[serde(default)]
    scope: Option<ScopeRef>,
}

pub(super) async fn handle_permission(
    ctx: &AppContext,
    agent: &AgentId,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: PermissionParams = parse_params(params)?;
    let scope = p.scope.unwrap_or_else(ScopeRef::global);
    let target = match &p.target_agent_id {
        Some(raw) => AgentId::new(raw.as_str())
            .map_err(|e| EngramError::invalid_value("target_agent_id", e.to_string()))?,
        None => agent.clone(),
    };
    match action {
        "grant" => {
            let needed = p.grant.ok_or_else(|| EngramError::missing_field("grant"))?;
            let grant = ctx.grants.grant(&target, needed, &scope).await?;
            Ok(json!({ "grant": grant }))
        }
        "revoke" => {
            let needed = p.grant.ok_or_else(|| EngramError::missing_field("grant"))?;
            let revoked = ctx.grants.revoke(&target, needed, &scope).await?;
            Ok(json!({ "revoked": revoked }))
        }
        "list" => {
            let grants = ctx.grants.list_for_agent(&target).await?;
            let count = grants.len();
            Ok(json!({ "grants": grants, "count": count }))
        }
        "check" => {
            let needed = p.grant.ok_or_else(|| EngramError::missing_field("grant"))?;
            let chain = ctx.entries.resolve_chain(&scope).await?;
            let allowed = ctx
                .permissions
                .check(&target, needed, chain.scopes())
                .await
                .is_ok();
            Ok(json!({ "allowed": allowed }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: "permission".into(),
            action: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// CONFLICTS
// ============================================================================

#[derive(Deserialize)]
struct ConflictParams {
    id: Option<ConflictId>,
    entry_id: Option<EntryId>,
    winning_version: Option<VersionId>,
    #[serde(default)]
    merged: Option<Value>,
    #[serde(default)]
    limit: Option<u32>,
}

pub(super) async fn handle_conflict(
    ctx: &AppContext,
    agent: &AgentId,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: ConflictParams = parse_params(params)?;
    match action {
        "list" => {
            let conflicts = match p.entry_id {
                Some(entry_id) => ctx.conflicts.unresolved_for_entry(entry_id).await?,
                None => ctx.conflicts.list_unresolved(p.limit.unwrap_or(50)).await?,
            };
            let count = conflicts.len();
            Ok(json!({ "conflicts": conflicts, "count": count }))
        }
        "get" => {
            let id = p.id.ok_or_else(|| EngramError::missing_field("id"))?;
            let conflict = ctx
                .conflicts
                .get(id)
                .await?
                .ok_or_else(|| EngramError::not_found("conflict", id))?;
            Ok(json!({ "conflict": conflict }))
        }
        "resolve" => {
            let id = p.id.ok_or_else(|| EngramError::missing_field("id"))?;
            let conflict = ctx
                .conflicts
                .get(id)
                .await?
                .ok_or_else(|| EngramError::not_found("conflict", id))?;

            let resolution = match (p.winning_version, p.merged) {
                (Some(version_id), None) => ConflictResolution::Pick { version_id },
                (None, Some(raw)) => ConflictResolution::Merge {
                    payload: serde_json::from_value(raw).map_err(|e| {
                        EngramError::invalid_value("merged", e.to_string())
                    })?,
                },
                _ => {
                    return Err(EngramError::invalid_value(
                        "resolution",
                        "provide exactly one of winning_version or merged",
                    ))
                }
            };

            let winning = match resolution {
                ConflictResolution::Pick { version_id } => {
                    // Re-assert the picked version as the head so the pick
                    // is durable even when it lost the original race.
                    let version = ctx
                        .entries
                        .get_version(version_id)
                        .await?
                        .ok_or_else(|| EngramError::not_found("version", version_id))?;
                    ctx.entries
                        .update(
                            conflict.entry_id,
                            EntryPatch {
                                payload: Some(version.payload),
                                ..Default::default()
                            },
                            "conflict resolution: picked surviving version",
                            agent,
                            None,
                        )
                        .await?;
                    version_id
                }
                ConflictResolution::Merge { payload } => {
                    let (entry, _) = ctx
                        .entries
                        .update(
                            conflict.entry_id,
                            EntryPatch {
                                payload: Some(payload),
                                ..Default::default()
                            },
                            "conflict resolution: merged content",
                            agent,
                            None,
                        )
                        .await?;
                    entry.head_version_id
                }
            };

            let resolved = ctx.conflicts.resolve(id, winning, agent).await?;
            Ok(json!({ "conflict": resolved }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: "conflict".into(),
            action: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// VOTING
// ============================================================================

#[derive(Deserialize)]
struct VotingParams {
    entry_type: EntryKind,
    entry_id: EntryId,
    vote: Option<VoteValue>,
}

pub(super) async fn handle_voting(
    ctx: &AppContext,
    agent: &AgentId,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: VotingParams = parse_params(params)?;
    match action {
        "cast" => {
            let vote = p.vote.ok_or_else(|| EngramError::missing_field("vote"))?;
            ctx.votes.cast(p.entry_type, p.entry_id, agent, vote).await?;
            let tally = ctx.votes.tally(p.entry_type, p.entry_id).await?;
            Ok(json!({ "tally": tally }))
        }
        "retract" => {
            let retracted = ctx.votes.retract(p.entry_type, p.entry_id, agent).await?;
            Ok(json!({ "retracted": retracted }))
        }
        "tally" => {
            let tally = ctx.votes.tally(p.entry_type, p.entry_id).await?;
            Ok(json!({ "tally": tally, "net": tally.net() }))
        }
        other => Err(ValidationError::UnknownAction {
            tool: "voting".into(),
            action: other.to_string(),
        }
        .into()),
    }
}
