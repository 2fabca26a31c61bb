//! Entry repository
//!
//! Create inserts entry + version 1, attaches tags, mirrors a graph node,
//! audits, publishes `entry:changed{create}`, and enqueues embedding work.
//! Update appends a version, advances the head pointer, and records a
//! conflict when the previous head landed inside the conflict window.
//! Delete removes versions, tag attachments, relations in both directions,
//! graph rows, embedding records, and votes in one transaction.

use crate::scopes::{scope_from_cols, scope_to_cols};
use crate::{DbDeps, EmbeddingSink, ScopeRepository};
use engram_adapters::{
    with_transaction, ChangeAction, ChangeEvent, SqlRow, SqlValue, StorageTransaction,
    ENTRY_CHANGED_CHANNEL,
};
use engram_core::{
    content_fingerprint, AgentId, AuditAction, ConflictId, ConflictRecord, EmbeddingJob,
    EngramError, EngramResult, Entry, EntryFilter, EntryId, EntryKind, EntryPatch, EntryPayload,
    EntryVersion, IdType, Page, ResourceError, ScopeChain, ScopeRef, ValidationError, VersionId,
    CONFLICT_WINDOW_MS,
};
use futures_util::FutureExt;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// ROW CODECS
// ============================================================================

pub(crate) fn decode_entry(row: &SqlRow) -> EngramResult<Entry> {
    let payload: EntryPayload = serde_json::from_str(&row.text("payload")?).map_err(|e| {
        EngramError::from(engram_core::DatabaseError::Decode {
            reason: format!("entry payload: {e}"),
        })
    })?;
    Ok(Entry {
        entry_id: EntryId::from_uuid(row.uuid("entry_id")?),
        kind: row.text("kind")?.parse().map_err(|reason| {
            EngramError::from(ValidationError::InvalidValue {
                field: "kind".into(),
                reason,
            })
        })?,
        name: row.text("name")?,
        category: row.opt_text("category")?,
        scope: scope_from_cols(&row.text("scope_kind")?, &row.text("scope_id")?)?,
        active: row.boolean("active")?,
        created_at: row.timestamp("created_at")?,
        created_by: AgentId::new(row.text("created_by")?).unwrap_or_else(|_| AgentId::system()),
        updated_at: row.timestamp("updated_at")?,
        head_version: row.integer("head_version")? as i32,
        head_version_id: VersionId::from_uuid(row.uuid("head_version_id")?),
        payload,
    })
}

fn decode_version(row: &SqlRow) -> EngramResult<EntryVersion> {
    let payload: EntryPayload = serde_json::from_str(&row.text("payload")?).map_err(|e| {
        EngramError::from(engram_core::DatabaseError::Decode {
            reason: format!("version payload: {e}"),
        })
    })?;
    Ok(EntryVersion {
        version_id: VersionId::from_uuid(row.uuid("version_id")?),
        entry_id: EntryId::from_uuid(row.uuid("entry_id")?),
        version_number: row.integer("version_number")? as i32,
        payload,
        change_reason: row.text("change_reason")?,
        created_by: AgentId::new(row.text("created_by")?).unwrap_or_else(|_| AgentId::system()),
        created_at: row.timestamp("created_at")?,
    })
}

async fn insert_version(
    tx: &mut dyn StorageTransaction,
    version: &EntryVersion,
) -> EngramResult<()> {
    tx.execute(
        "INSERT INTO entry_versions
             (version_id, entry_id, version_number, payload, change_reason,
              created_by, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        &[
            SqlValue::from(version.version_id.as_uuid()),
            SqlValue::from(version.entry_id.as_uuid()),
            SqlValue::from(version.version_number),
            SqlValue::Text(serde_json::to_string(&version.payload).unwrap_or_default()),
            SqlValue::from(version.change_reason.as_str()),
            SqlValue::from(version.created_by.as_str()),
            SqlValue::from(version.created_at),
        ],
    )
    .await?;
    Ok(())
}

async fn update_head(
    tx: &mut dyn StorageTransaction,
    entry: &Entry,
) -> EngramResult<()> {
    tx.execute(
        "UPDATE entries
         SET name = $1, category = $2, active = $3, updated_at = $4,
             head_version = $5, head_version_id = $6, payload = $7
         WHERE entry_id = $8",
        &[
            SqlValue::from(entry.name.as_str()),
            SqlValue::from(entry.category.clone()),
            SqlValue::from(entry.active),
            SqlValue::from(entry.updated_at),
            SqlValue::from(entry.head_version),
            SqlValue::from(entry.head_version_id.as_uuid()),
            SqlValue::Text(serde_json::to_string(&entry.payload).unwrap_or_default()),
            SqlValue::from(entry.entry_id.as_uuid()),
        ],
    )
    .await?;
    Ok(())
}

async fn active_name_taken(
    tx: &mut dyn StorageTransaction,
    kind: EntryKind,
    scope: &ScopeRef,
    name: &str,
    exclude: Option<EntryId>,
) -> EngramResult<bool> {
    let (scope_kind, scope_id) = scope_to_cols(scope);
    let rows = tx
        .execute(
            "SELECT entry_id FROM entries
             WHERE kind = $1 AND scope_kind = $2 AND scope_id = $3
               AND name = $4 AND active = 1",
            &[
                SqlValue::from(kind.as_str()),
                SqlValue::from(scope_kind.as_str()),
                SqlValue::from(scope_id.as_str()),
                SqlValue::from(name),
            ],
        )
        .await?;
    for row in &rows {
        let id = EntryId::from_uuid(row.uuid("entry_id")?);
        if Some(id) != exclude {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Remove every row owned by one entry. Shared with the scope cascade.
pub(crate) async fn delete_entry_rows(
    tx: &mut dyn StorageTransaction,
    entry_id: &str,
) -> EngramResult<()> {
    let id = SqlValue::from(entry_id);
    tx.execute("DELETE FROM entry_versions WHERE entry_id = $1", &[id.clone()])
        .await?;
    tx.execute("DELETE FROM tag_attachments WHERE entry_id = $1", &[id.clone()])
        .await?;
    tx.execute(
        "DELETE FROM relations WHERE source_id = $1 OR target_id = $1",
        &[id.clone()],
    )
    .await?;
    tx.execute("DELETE FROM graph_nodes WHERE entry_id = $1", &[id.clone()])
        .await?;
    tx.execute(
        "DELETE FROM embedding_records WHERE entry_id = $1",
        &[id.clone()],
    )
    .await?;
    tx.execute("DELETE FROM conflicts WHERE entry_id = $1", &[id.clone()])
        .await?;
    tx.execute("DELETE FROM votes WHERE entry_id = $1", &[id.clone()])
        .await?;
    tx.execute("DELETE FROM entries WHERE entry_id = $1", &[id]).await?;
    Ok(())
}

// ============================================================================
// INPUT TYPES
// ============================================================================

/// Input to `create`.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub name: String,
    pub category: Option<String>,
    pub scope: ScopeRef,
    pub payload: EntryPayload,
    pub tags: Vec<String>,
    pub created_by: AgentId,
    pub correlation_id: Option<Uuid>,
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Repository over entries and their versions.
pub struct EntryRepository {
    deps: DbDeps,
    scopes: ScopeRepository,
    embeddings: Arc<dyn EmbeddingSink>,
}

impl EntryRepository {
    pub fn new(deps: DbDeps, embeddings: Arc<dyn EmbeddingSink>) -> Self {
        Self {
            scopes: ScopeRepository::new(deps.clone()),
            deps,
            embeddings,
        }
    }

    async fn publish(&self, event: ChangeEvent) {
        let value = serde_json::to_value(&event).unwrap_or_default();
        if let Err(e) = self.deps.events.publish(ENTRY_CHANGED_CHANNEL, value).await {
            tracing::warn!(error = %e, "failed to publish entry:changed event");
        }
    }

    fn enqueue_embedding(&self, entry: &Entry) {
        self.embeddings.enqueue(EmbeddingJob {
            entry_kind: entry.kind,
            entry_id: entry.entry_id,
            version_id: entry.head_version_id,
            text_fingerprint: content_fingerprint(&entry.search_text()),
        });
    }

    /// Keep the lexical index in step with the head payload. Best effort:
    /// the fts stage tolerates a stale or missing index.
    async fn sync_fts(&self, entry: &Entry, remove_only: bool) {
        if self.deps.storage.backend_name() != "sqlite" {
            return;
        }
        let delete = self
            .deps
            .storage
            .execute(
                "DELETE FROM entries_fts WHERE entry_id = $1",
                &[SqlValue::from(entry.entry_id.as_uuid())],
            )
            .await;
        if let Err(e) = delete {
            tracing::warn!(error = %e, "fts delete failed");
            return;
        }
        if remove_only || !entry.active {
            return;
        }
        let insert = self
            .deps
            .storage
            .execute(
                "INSERT INTO entries_fts (entry_id, kind, name, body)
                 VALUES ($1, $2, $3, $4)",
                &[
                    SqlValue::from(entry.entry_id.as_uuid()),
                    SqlValue::from(entry.kind.as_str()),
                    SqlValue::from(entry.name.as_str()),
                    SqlValue::Text(entry.search_text()),
                ],
            )
            .await;
        if let Err(e) = insert {
            tracing::warn!(error = %e, "fts insert failed");
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    pub async fn create(&self, input: NewEntry) -> EngramResult<Entry> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(EngramError::missing_field("name"));
        }
        input
            .payload
            .validate()
            .map_err(|reason| EngramError::invalid_value("payload", reason))?;
        // Chain resolution validates the scope reference and existence.
        self.scopes.resolve_chain(&input.scope).await?;

        let kind = input.payload.kind();
        let now = chrono::Utc::now();
        let entry = Entry {
            entry_id: EntryId::now_v7(),
            kind,
            name: name.clone(),
            category: input.category.clone(),
            scope: input.scope,
            active: true,
            created_at: now,
            created_by: input.created_by.clone(),
            updated_at: now,
            head_version: 1,
            head_version_id: VersionId::now_v7(),
            payload: input.payload.clone(),
        };
        let version = EntryVersion {
            version_id: entry.head_version_id,
            entry_id: entry.entry_id,
            version_number: 1,
            payload: entry.payload.clone(),
            change_reason: "created".to_string(),
            created_by: input.created_by.clone(),
            created_at: now,
        };

        let tags = input.tags.clone();
        let correlation_id = input.correlation_id;
        let created = with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let entry = entry.clone();
            let version = version.clone();
            let tags = tags.clone();
            async move {
                if active_name_taken(tx, entry.kind, &entry.scope, &entry.name, None).await? {
                    return Err(ResourceError::AlreadyExists {
                        record: "entry",
                        name: entry.name.clone(),
                        scope: entry.scope.to_string(),
                    }
                    .into());
                }
                let (scope_kind, scope_id) = scope_to_cols(&entry.scope);
                tx.execute(
                    "INSERT INTO entries
                         (entry_id, kind, name, category, scope_kind, scope_id, active,
                          created_at, created_by, updated_at, head_version,
                          head_version_id, payload)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                    &[
                        SqlValue::from(entry.entry_id.as_uuid()),
                        SqlValue::from(entry.kind.as_str()),
                        SqlValue::from(entry.name.as_str()),
                        SqlValue::from(entry.category.clone()),
                        SqlValue::from(scope_kind.as_str()),
                        SqlValue::from(scope_id.as_str()),
                        SqlValue::from(entry.active),
                        SqlValue::from(entry.created_at),
                        SqlValue::from(entry.created_by.as_str()),
                        SqlValue::from(entry.updated_at),
                        SqlValue::from(entry.head_version),
                        SqlValue::from(entry.head_version_id.as_uuid()),
                        SqlValue::Text(
                            serde_json::to_string(&entry.payload).unwrap_or_default(),
                        ),
                    ],
                )
                .await?;
                insert_version(tx, &version).await?;

                for tag in &tags {
                    let tag_id = crate::tags::get_or_create_in_tx(tx, tag).await?;
                    tx.execute(
                        "INSERT INTO tag_attachments (entry_kind, entry_id, tag_id)
                         VALUES ($1, $2, $3)",
                        &[
                            SqlValue::from(entry.kind.as_str()),
                            SqlValue::from(entry.entry_id.as_uuid()),
                            SqlValue::from(tag_id.as_uuid()),
                        ],
                    )
                    .await?;
                }

                // Mirror into the graph surface with the same scope.
                tx.execute(
                    "INSERT INTO graph_nodes (entry_kind, entry_id, scope_kind, scope_id, label)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        SqlValue::from(entry.kind.as_str()),
                        SqlValue::from(entry.entry_id.as_uuid()),
                        SqlValue::from(scope_kind.as_str()),
                        SqlValue::from(scope_id.as_str()),
                        SqlValue::from(entry.name.as_str()),
                    ],
                )
                .await?;

                crate::audit::append_in_tx(
                    tx,
                    AuditAction::Create,
                    Some(entry.kind),
                    Some(entry.entry_id.as_uuid()),
                    &entry.created_by,
                    Some(entry.scope),
                    correlation_id,
                    Some(serde_json::json!({ "name": entry.name })),
                )
                .await?;
                Ok(entry)
            }
            .boxed()
        })
        .await?;

        self.publish(ChangeEvent::entry(
            ChangeAction::Create,
            created.kind,
            created.entry_id.as_uuid(),
            created.scope,
        ))
        .await;
        self.enqueue_embedding(&created);
        self.sync_fts(&created, false).await;
        Ok(created)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_by_id(&self, id: EntryId) -> EngramResult<Option<Entry>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM entries WHERE entry_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.first().map(decode_entry).transpose()
    }

    /// Lookup by name within a scope, optionally walking the chain. The
    /// most specific match wins.
    pub async fn get_by_name(
        &self,
        kind: EntryKind,
        name: &str,
        scope: &ScopeRef,
        inherit: bool,
    ) -> EngramResult<Option<Entry>> {
        let chain = self.scopes.resolve_chain(scope).await?;
        let scopes: Vec<ScopeRef> = if inherit {
            chain.scopes().to_vec()
        } else {
            vec![*scope]
        };
        for candidate in &scopes {
            let (scope_kind, scope_id) = scope_to_cols(candidate);
            let rows = self
                .deps
                .storage
                .execute(
                    "SELECT * FROM entries
                     WHERE kind = $1 AND scope_kind = $2 AND scope_id = $3
                       AND name = $4 AND active = 1",
                    &[
                        SqlValue::from(kind.as_str()),
                        SqlValue::from(scope_kind.as_str()),
                        SqlValue::from(scope_id.as_str()),
                        SqlValue::from(name),
                    ],
                )
                .await?;
            if let Some(row) = rows.first() {
                return Ok(Some(decode_entry(row)?));
            }
        }
        Ok(None)
    }

    /// List entries for a filter with offset pagination. Inherited scopes
    /// preserve specific-first ordering.
    pub async fn list(
        &self,
        kind: EntryKind,
        filter: &EntryFilter,
        page: Page,
    ) -> EngramResult<Vec<Entry>> {
        let chain = self.scopes.resolve_chain(&filter.scope).await?;
        let scopes: Vec<ScopeRef> = if filter.inherit {
            chain.scopes().to_vec()
        } else {
            vec![filter.scope]
        };
        let budget = (page.offset + page.limit) as usize;
        let mut entries =
            self.fetch_for_scopes(kind, &scopes, filter.include_inactive, budget.max(1)).await?;
        if let Some(category) = &filter.category {
            entries.retain(|e| e.category.as_deref() == Some(category.as_str()));
        }
        if let Some(prefix) = &filter.name_prefix {
            entries.retain(|e| e.name.starts_with(prefix.as_str()));
        }
        Ok(entries
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    /// Load active entries across an ordered scope list up to a budget.
    /// Scope order is preserved so downstream stages see specific-first.
    pub async fn fetch_for_scopes(
        &self,
        kind: EntryKind,
        scopes: &[ScopeRef],
        include_inactive: bool,
        budget: usize,
    ) -> EngramResult<Vec<Entry>> {
        let mut out: Vec<Entry> = Vec::new();
        for scope in scopes {
            if out.len() >= budget {
                break;
            }
            let remaining = (budget - out.len()) as i64;
            let (scope_kind, scope_id) = scope_to_cols(scope);
            let sql = if include_inactive {
                "SELECT * FROM entries
                 WHERE kind = $1 AND scope_kind = $2 AND scope_id = $3
                 ORDER BY name LIMIT $4"
            } else {
                "SELECT * FROM entries
                 WHERE kind = $1 AND scope_kind = $2 AND scope_id = $3 AND active = 1
                 ORDER BY name LIMIT $4"
            };
            let rows = self
                .deps
                .storage
                .execute(
                    sql,
                    &[
                        SqlValue::from(kind.as_str()),
                        SqlValue::from(scope_kind.as_str()),
                        SqlValue::from(scope_id.as_str()),
                        SqlValue::Integer(remaining),
                    ],
                )
                .await?;
            for row in &rows {
                out.push(decode_entry(row)?);
            }
        }
        Ok(out)
    }

    pub async fn history(&self, id: EntryId) -> EngramResult<Vec<EntryVersion>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM entry_versions WHERE entry_id = $1
                 ORDER BY version_number",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        rows.iter().map(decode_version).collect()
    }

    pub async fn get_version(&self, version_id: VersionId) -> EngramResult<Option<EntryVersion>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM entry_versions WHERE version_id = $1",
                &[SqlValue::from(version_id.as_uuid())],
            )
            .await?;
        rows.first().map(decode_version).transpose()
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Apply a patch as a new version. Returns the updated entry and the
    /// conflict record when this update landed inside the conflict window
    /// of the previous one.
    pub async fn update(
        &self,
        id: EntryId,
        patch: EntryPatch,
        reason: &str,
        actor: &AgentId,
        correlation_id: Option<Uuid>,
    ) -> EngramResult<(Entry, Option<ConflictRecord>)> {
        if patch.is_empty() {
            return Err(EngramError::invalid_value("patch", "no fields to update"));
        }
        if let Some(payload) = &patch.payload {
            payload
                .validate()
                .map_err(|reason| EngramError::invalid_value("payload", reason))?;
        }
        let reason = if reason.trim().is_empty() {
            "updated".to_string()
        } else {
            reason.trim().to_string()
        };

        let actor = actor.clone();
        let result = with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let patch = patch.clone();
            let reason = reason.clone();
            let actor = actor.clone();
            async move {
                let rows = tx
                    .execute(
                        "SELECT * FROM entries WHERE entry_id = $1",
                        &[SqlValue::from(id.as_uuid())],
                    )
                    .await?;
                let current = rows
                    .first()
                    .map(decode_entry)
                    .transpose()?
                    .ok_or_else(|| EngramError::not_found("entry", id))?;

                if let Some(payload) = &patch.payload {
                    if payload.kind() != current.kind {
                        return Err(EngramError::invalid_value(
                            "payload",
                            format!(
                                "kind {} does not match entry kind {}",
                                payload.kind(),
                                current.kind
                            ),
                        ));
                    }
                }

                let prev_head = tx
                    .execute(
                        "SELECT * FROM entry_versions WHERE version_id = $1",
                        &[SqlValue::from(current.head_version_id.as_uuid())],
                    )
                    .await?
                    .first()
                    .map(decode_version)
                    .transpose()?
                    .ok_or_else(|| {
                        EngramError::internal(format!(
                            "head version missing for entry {id}"
                        ))
                    })?;

                let new_name = patch.name.clone().unwrap_or_else(|| current.name.clone());
                if new_name != current.name
                    && active_name_taken(tx, current.kind, &current.scope, &new_name, Some(id))
                        .await?
                {
                    return Err(ResourceError::AlreadyExists {
                        record: "entry",
                        name: new_name.clone(),
                        scope: current.scope.to_string(),
                    }
                    .into());
                }

                let now = chrono::Utc::now();
                let version = EntryVersion {
                    version_id: VersionId::now_v7(),
                    entry_id: id,
                    version_number: current.head_version + 1,
                    payload: patch.payload.clone().unwrap_or_else(|| current.payload.clone()),
                    change_reason: reason.clone(),
                    created_by: actor.clone(),
                    created_at: now,
                };
                insert_version(tx, &version).await?;

                let updated = Entry {
                    name: new_name,
                    category: patch.category.clone().or_else(|| current.category.clone()),
                    updated_at: now,
                    head_version: version.version_number,
                    head_version_id: version.version_id,
                    payload: version.payload.clone(),
                    ..current.clone()
                };
                update_head(tx, &updated).await?;

                // Optimistic window: a previous *update* inside the window
                // means two writers raced. Version 1 is creation, never a
                // conflict peer.
                let elapsed_ms = now
                    .signed_duration_since(prev_head.created_at)
                    .num_milliseconds();
                let conflict = if prev_head.version_number >= 2
                    && elapsed_ms < CONFLICT_WINDOW_MS
                {
                    let record = ConflictRecord {
                        conflict_id: ConflictId::now_v7(),
                        entry_kind: updated.kind,
                        entry_id: id,
                        version_a: prev_head.version_id,
                        version_b: version.version_id,
                        detected_at: now,
                        resolved: false,
                        resolved_by: None,
                        resolved_at: None,
                        winning_version: None,
                    };
                    crate::conflicts::insert_in_tx(tx, &record).await?;
                    Some(record)
                } else {
                    None
                };

                crate::audit::append_in_tx(
                    tx,
                    AuditAction::Update,
                    Some(updated.kind),
                    Some(id.as_uuid()),
                    &actor,
                    Some(updated.scope),
                    correlation_id,
                    Some(serde_json::json!({
                        "version": version.version_number,
                        "reason": reason,
                    })),
                )
                .await?;
                Ok((updated, conflict))
            }
            .boxed()
        })
        .await?;

        let (entry, conflict) = &result;
        self.publish(ChangeEvent::entry(
            ChangeAction::Update,
            entry.kind,
            entry.entry_id.as_uuid(),
            entry.scope,
        ))
        .await;
        self.enqueue_embedding(entry);
        self.sync_fts(entry, false).await;
        if conflict.is_some() {
            tracing::info!(entry_id = %entry.entry_id, "concurrent update conflict recorded");
        }
        Ok(result)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn deactivate(
        &self,
        id: EntryId,
        reason: &str,
        actor: &AgentId,
    ) -> EngramResult<Entry> {
        let entry = self
            .set_active(id, false, reason, actor, AuditAction::Deactivate)
            .await?;
        self.publish(ChangeEvent::entry(
            ChangeAction::Deactivate,
            entry.kind,
            entry.entry_id.as_uuid(),
            entry.scope,
        ))
        .await;
        self.sync_fts(&entry, true).await;
        Ok(entry)
    }

    /// Reactivation requires an explicit reason and re-checks the active
    /// name uniqueness the entry left behind.
    pub async fn reactivate(
        &self,
        id: EntryId,
        reason: &str,
        actor: &AgentId,
    ) -> EngramResult<Entry> {
        if reason.trim().is_empty() {
            return Err(EngramError::missing_field("reason"));
        }
        let entry = self
            .set_active(id, true, reason, actor, AuditAction::Reactivate)
            .await?;
        self.publish(ChangeEvent::entry(
            ChangeAction::Reactivate,
            entry.kind,
            entry.entry_id.as_uuid(),
            entry.scope,
        ))
        .await;
        self.sync_fts(&entry, false).await;
        Ok(entry)
    }

    async fn set_active(
        &self,
        id: EntryId,
        active: bool,
        reason: &str,
        actor: &AgentId,
        action: AuditAction,
    ) -> EngramResult<Entry> {
        let reason = if reason.trim().is_empty() {
            if active { "reactivated" } else { "deactivated" }.to_string()
        } else {
            reason.trim().to_string()
        };
        let actor = actor.clone();
        with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let reason = reason.clone();
            let actor = actor.clone();
            async move {
                let rows = tx
                    .execute(
                        "SELECT * FROM entries WHERE entry_id = $1",
                        &[SqlValue::from(id.as_uuid())],
                    )
                    .await?;
                let current = rows
                    .first()
                    .map(decode_entry)
                    .transpose()?
                    .ok_or_else(|| EngramError::not_found("entry", id))?;
                if current.active == active {
                    return Err(ResourceError::StateConflict {
                        reason: format!(
                            "entry {id} is already {}",
                            if active { "active" } else { "inactive" }
                        ),
                    }
                    .into());
                }
                if active
                    && active_name_taken(tx, current.kind, &current.scope, &current.name, Some(id))
                        .await?
                {
                    return Err(ResourceError::AlreadyExists {
                        record: "entry",
                        name: current.name.clone(),
                        scope: current.scope.to_string(),
                    }
                    .into());
                }

                let now = chrono::Utc::now();
                let version = EntryVersion {
                    version_id: VersionId::now_v7(),
                    entry_id: id,
                    version_number: current.head_version + 1,
                    payload: current.payload.clone(),
                    change_reason: reason.clone(),
                    created_by: actor.clone(),
                    created_at: now,
                };
                insert_version(tx, &version).await?;

                let updated = Entry {
                    active,
                    updated_at: now,
                    head_version: version.version_number,
                    head_version_id: version.version_id,
                    ..current
                };
                update_head(tx, &updated).await?;

                crate::audit::append_in_tx(
                    tx,
                    action,
                    Some(updated.kind),
                    Some(id.as_uuid()),
                    &actor,
                    Some(updated.scope),
                    None,
                    Some(serde_json::json!({ "reason": reason })),
                )
                .await?;
                Ok(updated)
            }
            .boxed()
        })
        .await
    }

    // ========================================================================
    // Delete
    // ========================================================================

    pub async fn delete(&self, id: EntryId, actor: &AgentId) -> EngramResult<Entry> {
        let actor = actor.clone();
        let entry = with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let actor = actor.clone();
            async move {
                let rows = tx
                    .execute(
                        "SELECT * FROM entries WHERE entry_id = $1",
                        &[SqlValue::from(id.as_uuid())],
                    )
                    .await?;
                let entry = rows
                    .first()
                    .map(decode_entry)
                    .transpose()?
                    .ok_or_else(|| EngramError::not_found("entry", id))?;
                delete_entry_rows(tx, &id.as_uuid().to_string()).await?;
                crate::audit::append_in_tx(
                    tx,
                    AuditAction::Delete,
                    Some(entry.kind),
                    Some(id.as_uuid()),
                    &actor,
                    Some(entry.scope),
                    None,
                    Some(serde_json::json!({ "name": entry.name })),
                )
                .await?;
                Ok(entry)
            }
            .boxed()
        })
        .await?;

        self.publish(ChangeEvent::entry(
            ChangeAction::Delete,
            entry.kind,
            entry.entry_id.as_uuid(),
            entry.scope,
        ))
        .await;
        self.sync_fts(&entry, true).await;
        Ok(entry)
    }

    /// Resolve the scope chain for a query scope. Exposed for pipeline use
    /// so the resolve stage shares repository validation.
    pub async fn resolve_chain(&self, scope: &ScopeRef) -> EngramResult<ScopeChain> {
        self.scopes.resolve_chain(scope).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;
    use crate::NullEmbeddingSink;
    use engram_core::{GuidelineExamples, GuidelinePayload, KnowledgePayload};

    pub(crate) fn guideline_payload(priority: i32, content: &str) -> EntryPayload {
        EntryPayload::Guideline(GuidelinePayload {
            content: content.to_string(),
            rationale: None,
            examples: GuidelineExamples::default(),
            priority,
        })
    }

    pub(crate) fn knowledge_payload(content: &str) -> EntryPayload {
        EntryPayload::Knowledge(KnowledgePayload {
            content: content.to_string(),
            source: None,
            confidence: 0.9,
            valid_from: None,
            valid_until: None,
        })
    }

    pub(crate) fn new_entry(name: &str, scope: ScopeRef, payload: EntryPayload) -> NewEntry {
        NewEntry {
            name: name.to_string(),
            category: None,
            scope,
            payload,
            tags: vec![],
            created_by: AgentId::new("tester").unwrap(),
            correlation_id: None,
        }
    }

    async fn repo() -> (EntryRepository, DbDeps) {
        let deps = test_deps().await;
        (
            EntryRepository::new(deps.clone(), Arc::new(NullEmbeddingSink)),
            deps,
        )
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let (repo, _deps) = repo().await;
        let created = repo
            .create(new_entry(
                "sql-params",
                ScopeRef::global(),
                guideline_payload(95, "use parameterized queries"),
            ))
            .await
            .unwrap();

        let fetched = repo.get_by_id(created.entry_id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.head_version, 1);
        assert!(fetched.active);
    }

    #[tokio::test]
    async fn test_active_name_uniqueness() {
        let (repo, _deps) = repo().await;
        repo.create(new_entry(
            "dup",
            ScopeRef::global(),
            guideline_payload(10, "a"),
        ))
        .await
        .unwrap();
        let err = repo
            .create(new_entry(
                "dup",
                ScopeRef::global(),
                guideline_payload(20, "b"),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 2002);
    }

    #[tokio::test]
    async fn test_update_appends_versions_and_history() {
        let (repo, _deps) = repo().await;
        let actor = AgentId::new("tester").unwrap();
        let created = repo
            .create(new_entry(
                "run_tests",
                ScopeRef::global(),
                knowledge_payload("run tests"),
            ))
            .await
            .unwrap();

        let patch = EntryPatch {
            payload: Some(knowledge_payload("run test suite")),
            ..Default::default()
        };
        let (updated, _) = repo
            .update(created.entry_id, patch.clone(), "clarify", &actor, None)
            .await
            .unwrap();
        assert_eq!(updated.head_version, 2);

        // Same patch again: head advances by one more.
        let (updated, _) = repo
            .update(created.entry_id, patch, "again", &actor, None)
            .await
            .unwrap();
        assert_eq!(updated.head_version, 3);

        let history = repo.history(created.entry_id).await.unwrap();
        assert_eq!(history.len(), 3);
        let numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(history[1].change_reason, "clarify");
        assert_eq!(history[2].change_reason, "again");
        assert_eq!(updated.head_version_id, history[2].version_id);
    }

    #[tokio::test]
    async fn test_conflict_window_detection() {
        let (repo, deps) = repo().await;
        let a = AgentId::new("agent-a").unwrap();
        let b = AgentId::new("agent-b").unwrap();
        let created = repo
            .create(new_entry(
                "K",
                ScopeRef::global(),
                knowledge_payload("initial"),
            ))
            .await
            .unwrap();

        // First update (v2): previous head is creation, no conflict.
        let (_, conflict) = repo
            .update(
                created.entry_id,
                EntryPatch {
                    payload: Some(knowledge_payload("from A")),
                    ..Default::default()
                },
                "a",
                &a,
                None,
            )
            .await
            .unwrap();
        assert!(conflict.is_none());

        // Second update lands well inside the window: conflict (v2, v3).
        let (entry, conflict) = repo
            .update(
                created.entry_id,
                EntryPatch {
                    payload: Some(knowledge_payload("from B")),
                    ..Default::default()
                },
                "b",
                &b,
                None,
            )
            .await
            .unwrap();
        let conflict = conflict.expect("conflict inside window");
        assert_eq!(entry.head_version, 3);
        assert!(!conflict.resolved);
        let history = repo.history(created.entry_id).await.unwrap();
        assert_eq!(conflict.version_a, history[1].version_id);
        assert_eq!(conflict.version_b, history[2].version_id);
    }

    #[tokio::test]
    async fn test_no_conflict_outside_window() {
        let (repo, deps) = repo().await;
        let actor = AgentId::new("tester").unwrap();
        let created = repo
            .create(new_entry(
                "K",
                ScopeRef::global(),
                knowledge_payload("initial"),
            ))
            .await
            .unwrap();
        repo.update(
            created.entry_id,
            EntryPatch {
                payload: Some(knowledge_payload("v2")),
                ..Default::default()
            },
            "",
            &actor,
            None,
        )
        .await
        .unwrap();

        // Age the head version beyond the window (t + 5.001s equivalent).
        let head = repo.get_by_id(created.entry_id).await.unwrap().unwrap();
        let old = chrono::Utc::now() - chrono::Duration::milliseconds(5_001);
        deps.storage
            .execute(
                "UPDATE entry_versions SET created_at = $1 WHERE version_id = $2",
                &[SqlValue::from(old), SqlValue::from(head.head_version_id.as_uuid())],
            )
            .await
            .unwrap();

        let (_, conflict) = repo
            .update(
                created.entry_id,
                EntryPatch {
                    payload: Some(knowledge_payload("v3")),
                    ..Default::default()
                },
                "",
                &actor,
                None,
            )
            .await
            .unwrap();
        assert!(conflict.is_none());
    }

    #[tokio::test]
    async fn test_deactivate_reactivate_lifecycle() {
        let (repo, _deps) = repo().await;
        let actor = AgentId::new("tester").unwrap();
        let created = repo
            .create(new_entry(
                "g",
                ScopeRef::global(),
                guideline_payload(50, "content"),
            ))
            .await
            .unwrap();

        let inactive = repo
            .deactivate(created.entry_id, "superseded", &actor)
            .await
            .unwrap();
        assert!(!inactive.active);
        assert_eq!(inactive.head_version, 2);

        // Name is free while inactive.
        repo.create(new_entry(
            "g",
            ScopeRef::global(),
            guideline_payload(60, "replacement"),
        ))
        .await
        .unwrap();

        // Reactivation requires a reason and now collides on the name.
        assert_eq!(
            repo.reactivate(created.entry_id, "", &actor)
                .await
                .unwrap_err()
                .code(),
            1001
        );
        assert_eq!(
            repo.reactivate(created.entry_id, "bring back", &actor)
                .await
                .unwrap_err()
                .code(),
            2002
        );

        // Versions survive deactivation.
        assert_eq!(repo.history(created.entry_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (repo, deps) = repo().await;
        let actor = AgentId::new("tester").unwrap();
        let mut input = new_entry(
            "victim",
            ScopeRef::global(),
            knowledge_payload("to be deleted"),
        );
        input.tags = vec!["doomed".into()];
        let created = repo.create(input).await.unwrap();

        repo.delete(created.entry_id, &actor).await.unwrap();

        assert!(repo.get_by_id(created.entry_id).await.unwrap().is_none());
        assert!(repo.history(created.entry_id).await.unwrap().is_empty());
        let attachments = deps
            .storage
            .execute(
                "SELECT * FROM tag_attachments WHERE entry_id = $1",
                &[SqlValue::from(created.entry_id.as_uuid())],
            )
            .await
            .unwrap();
        assert!(attachments.is_empty());
        let nodes = deps
            .storage
            .execute(
                "SELECT * FROM graph_nodes WHERE entry_id = $1",
                &[SqlValue::from(created.entry_id.as_uuid())],
            )
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_head_invariant_holds() {
        let (repo, _deps) = repo().await;
        let actor = AgentId::new("tester").unwrap();
        let created = repo
            .create(new_entry(
                "inv",
                ScopeRef::global(),
                knowledge_payload("x"),
            ))
            .await
            .unwrap();
        for i in 0..4 {
            repo.update(
                created.entry_id,
                EntryPatch {
                    payload: Some(knowledge_payload(&format!("x{i}"))),
                    ..Default::default()
                },
                "",
                &actor,
                None,
            )
            .await
            .unwrap();
        }
        let entry = repo.get_by_id(created.entry_id).await.unwrap().unwrap();
        let history = repo.history(created.entry_id).await.unwrap();
        let max = history.iter().map(|v| v.version_number).max().unwrap();
        assert_eq!(entry.head_version, max);
    }
}
