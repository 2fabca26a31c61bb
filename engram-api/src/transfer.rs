//! Export, import, and backup
//!
//! Export renders entries for a kind/scope selection as a portable JSON
//! document; import replays it through the repositories so invariants,
//! events, and audit rows all apply. Backups are consistent single-file
//! snapshots of the SQLite store.

use crate::runtime::AppContext;
use crate::tools::parse_params;
use engram_core::{
    AgentId, EngramError, EngramResult, EntryFilter, EntryKind, EntryPayload, Page, ScopeRef,
    SystemError,
};
use engram_repos::NewEntry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// SCHEMAS
// ============================================================================

pub fn export_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["run"] },
            "types": {
                "type": "array",
                "items": { "type": "string", "enum": ["guidelines", "knowledge", "tools"] }
            },
            "scope": {
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "id": { "type": "string", "format": "uuid" }
                }
            },
            "include_inactive": { "type": "boolean", "default": false }
        },
        "required": ["action"]
    })
}

pub fn import_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["run"] },
            "document": { "type": "object" },
            "skip_existing": { "type": "boolean", "default": true }
        },
        "required": ["action", "document"]
    })
}

pub fn backup_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["create", "list", "cleanup"] },
            "keep": { "type": "integer", "minimum": 1, "default": 5 }
        },
        "required": ["action"]
    })
}

// ============================================================================
// EXPORT
// ============================================================================

/// Portable export document. Volatile fields (ids, timestamps, version
/// history) are intentionally absent; import regenerates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: u32,
    pub scope: ScopeRef,
    pub entries: Vec<ExportedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedEntry {
    pub kind: EntryKind,
    pub name: String,
    pub category: Option<String>,
    pub payload: EntryPayload,
    pub tags: Vec<String>,
    pub active: bool,
}

#[derive(Deserialize)]
struct ExportParams {
    #[serde(default, rename = "types")]
    kinds: Vec<EntryKind>,
    #[serde(default)]
    scope: Option<ScopeRef>,
    #[serde(default)]
    include_inactive: bool,
}

pub async fn handle_export(ctx: &AppContext, params: &Value) -> EngramResult<Value> {
    let p: ExportParams = parse_params(params)?;
    let scope = p.scope.unwrap_or_else(ScopeRef::global);
    let kinds = if p.kinds.is_empty() {
        EntryKind::ALL.to_vec()
    } else {
        p.kinds
    };

    let mut exported = Vec::new();
    for kind in kinds {
        let entries = ctx
            .entries
            .list(
                kind,
                &EntryFilter {
                    scope,
                    inherit: false,
                    category: None,
                    include_inactive: p.include_inactive,
                    name_prefix: None,
                },
                Page {
                    limit: 10_000,
                    offset: 0,
                },
            )
            .await?;
        for entry in entries {
            let tags = ctx
                .tags
                .tags_for_entry(kind, entry.entry_id)
                .await?
                .into_iter()
                .map(|t| t.name)
                .collect();
            exported.push(ExportedEntry {
                kind,
                name: entry.name,
                category: entry.category,
                payload: entry.payload,
                tags,
                active: entry.active,
            });
        }
    }

    let document = ExportDocument {
        version: 1,
        scope,
        entries: exported,
    };
    let count = document.entries.len();
    Ok(json!({
        "document": document,
        "count": count,
    }))
}

// ============================================================================
// IMPORT
// ============================================================================

#[derive(Deserialize)]
struct ImportParams {
    document: ExportDocument,
    #[serde(default = "default_skip")]
    skip_existing: bool,
}

fn default_skip() -> bool {
    true
}

pub async fn handle_import(
    ctx: &AppContext,
    agent: &AgentId,
    params: &Value,
) -> EngramResult<Value> {
    let p: ImportParams = parse_params(params)?;
    if p.document.version != 1 {
        return Err(EngramError::invalid_value(
            "document.version",
            format!("unsupported export version {}", p.document.version),
        ));
    }

    let mut imported = 0u64;
    let mut skipped = 0u64;
    for item in p.document.entries {
        let exists = ctx
            .entries
            .get_by_name(item.kind, &item.name, &p.document.scope, false)
            .await?
            .is_some();
        if exists {
            if p.skip_existing {
                skipped += 1;
                continue;
            }
            return Err(engram_core::ResourceError::AlreadyExists {
                record: "entry",
                name: item.name.clone(),
                scope: p.document.scope.to_string(),
            }
            .into());
        }
        let created = ctx
            .entries
            .create(NewEntry {
                name: item.name,
                category: item.category,
                scope: p.document.scope,
                payload: item.payload,
                tags: item.tags,
                created_by: agent.clone(),
                correlation_id: None,
            })
            .await?;
        if !item.active {
            ctx.entries
                .deactivate(created.entry_id, "imported inactive", agent)
                .await?;
        }
        imported += 1;
    }
    Ok(json!({ "imported": imported, "skipped": skipped }))
}

// ============================================================================
// BACKUP
// ============================================================================

#[derive(Deserialize)]
struct BackupParams {
    #[serde(default)]
    keep: Option<usize>,
}

fn backups_dir(ctx: &AppContext) -> std::path::PathBuf {
    ctx.config.data_dir.join("backups")
}

pub async fn handle_backup(
    ctx: &AppContext,
    action: &str,
    params: &Value,
) -> EngramResult<Value> {
    let p: BackupParams = parse_params(params)?;
    match action {
        "create" => {
            if ctx.storage.backend_name() != "sqlite" {
                return Err(SystemError::Internal {
                    reason: "backups require the sqlite backend".into(),
                }
                .into());
            }
            // One backup at a time.
            let hold = ctx
                .runtime
                .resource_locks
                .acquire(
                    "maintenance:backup",
                    std::time::Duration::from_secs(300),
                    &AgentId::system(),
                )
                .await?
                .ok_or_else(|| {
                    EngramError::from(engram_core::ResourceError::StateConflict {
                        reason: "a backup is already running".into(),
                    })
                })?;
            let dir = backups_dir(ctx);
            std::fs::create_dir_all(&dir).map_err(|e| SystemError::Io {
                reason: format!("create {}: {e}", dir.display()),
            })?;
            let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
            let target = dir.join(format!("engram-{stamp}.db"));
            // VACUUM INTO produces a consistent single-file snapshot even
            // with WAL active.
            let escaped = target.display().to_string().replace('\'', "''");
            let result = ctx
                .storage
                .execute_script(&format!("VACUUM INTO '{escaped}'"))
                .await;
            let _ = ctx.runtime.resource_locks.release(&hold).await;
            result?;
            Ok(json!({ "backup": target.display().to_string() }))
        }
        "list" => {
            let entries = list_backups(ctx)?;
            let count = entries.len();
            Ok(json!({ "backups": entries, "count": count }))
        }
        "cleanup" => {
            let keep = p.keep.unwrap_or(5).max(1);
            let mut entries = list_backups(ctx)?;
            // Newest first by the sortable timestamp in the name.
            entries.sort_by(|a, b| b.cmp(a));
            let mut removed = 0u64;
            for stale in entries.iter().skip(keep) {
                if std::fs::remove_file(backups_dir(ctx).join(stale)).is_ok() {
                    removed += 1;
                }
            }
            Ok(json!({ "removed": removed, "kept": entries.len().min(keep) }))
        }
        other => Err(engram_core::ValidationError::UnknownAction {
            tool: "backup".into(),
            action: other.to_string(),
        }
        .into()),
    }
}

fn list_backups(ctx: &AppContext) -> EngramResult<Vec<String>> {
    let dir = backups_dir(ctx);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let read = std::fs::read_dir(&dir).map_err(|e| SystemError::Io {
        reason: format!("read {}: {e}", dir.display()),
    })?;
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("engram-") && name.ends_with(".db") {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}
