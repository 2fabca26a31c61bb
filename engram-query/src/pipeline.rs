//! The eight-stage query pipeline
//!
//! A linear, idempotent sequence over one mutable context:
//! resolve → fetch → fts → filter → tags → relations → score → format.
//! Stages never re-enter the pipeline. The executed result is cached only
//! on success; the resolve stage rejects malformed scope identifiers with
//! a validation error rather than silently widening the scope.

use crate::cache::QueryCache;
use crate::cursor::CursorCodec;
use crate::score::{final_score, rank_order, recency_weight, ScoreInputs};
use engram_adapters::{SqlValue, StorageAdapter};
use engram_core::{
    ConflictRecord, EngramError, EngramResult, Entry, EntryId, EntryKind, QueryRequest,
    ResponseShape, ScopeChain, ScopeRef, Tag, ValidationError, DEFAULT_FETCH_BUDGET,
    RELATED_NODE_BUDGET,
};
use engram_repos::{ConflictRepository, EntryRepository, RelationRepository, TagRepository};
use engram_services::{EmbeddingProvider, VectorStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// RESPONSE SHAPES
// ============================================================================

/// A fully-projected result entry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredEntry {
    #[serde(flatten)]
    pub entry: Entry,
    pub tags: Vec<Tag>,
    pub score: f64,
}

/// Summary projection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SummaryEntry {
    pub entry_id: EntryId,
    pub kind: EntryKind,
    pub name: String,
    pub category: Option<String>,
    pub scope: ScopeRef,
    pub score: f64,
}

/// One result row in the requested projection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum QueryResultEntry {
    Full(Box<ScoredEntry>),
    Summary(SummaryEntry),
    Context { context: String },
}

/// The query response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueryResponse {
    pub entries: Vec<QueryResultEntry>,
    /// Pre-pagination result count (estimate under truncation).
    pub total: usize,
    /// Whether a fetch or traversal budget cut results short.
    pub truncated: bool,
    pub cache_hit: bool,
    pub next_cursor: Option<String>,
    /// Unresolved conflicts touching the returned entries.
    pub conflicts: Vec<ConflictRecord>,
}

// ============================================================================
// DEPENDENCIES AND CONTEXT
// ============================================================================

/// Everything the pipeline needs, assembled once by the runtime wiring.
#[derive(Clone)]
pub struct QueryDeps {
    pub entries: Arc<EntryRepository>,
    pub tags: Arc<TagRepository>,
    pub relations: Arc<RelationRepository>,
    pub conflicts: Arc<ConflictRepository>,
    pub storage: Arc<dyn StorageAdapter>,
    pub cache: Arc<QueryCache>,
    pub cursors: CursorCodec,
    /// Present only when the semantic path is enabled.
    pub vectors: Option<Arc<dyn VectorStore>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

/// Mutable state threaded through the stages.
struct PCtx {
    request: QueryRequest,
    scope_chain: ScopeChain,
    /// Per-kind lexical match sets from the fts stage.
    type_sets: HashMap<EntryKind, HashSet<EntryId>>,
    entries: HashMap<EntryKind, Vec<Entry>>,
    tag_map: HashMap<EntryId, Vec<Tag>>,
    /// Entries reachable through `related_to`, when requested.
    relation_set: Option<HashSet<EntryId>>,
    lexical: HashMap<EntryId, f64>,
    semantic: HashMap<EntryId, f64>,
    scores: HashMap<EntryId, f64>,
    offset: u64,
    limit: usize,
    truncated: bool,
}

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

// ============================================================================
// ENGINE
// ============================================================================

/// The query engine: stage machine plus cache front.
pub struct QueryEngine {
    deps: QueryDeps,
}

impl QueryEngine {
    pub fn new(deps: QueryDeps) -> Self {
        Self { deps }
    }

    pub async fn execute(&self, request: QueryRequest) -> EngramResult<QueryResponse> {
        let cache_key = QueryCache::key_for(&request);
        if let Some(hit) = self.deps.cache.get(&cache_key) {
            return Ok(hit);
        }

        let mut ctx = self.resolve(request).await?;
        self.fetch(&mut ctx).await?;
        self.fts(&mut ctx).await?;
        self.filter(&mut ctx).await?;
        self.load_tags(&mut ctx).await?;
        self.expand_relations(&mut ctx).await?;
        self.score(&mut ctx).await?;
        let response = self.format(&mut ctx).await?;

        // Populate only on success so a failed or cancelled query can
        // never poison the cache.
        self.deps.cache.put(
            cache_key,
            &response,
            ctx.scope_chain.scopes().to_vec(),
        );
        Ok(response)
    }

    // ========================================================================
    // Stage 1: resolve
    // ========================================================================

    async fn resolve(&self, mut request: QueryRequest) -> EngramResult<PCtx> {
        if request.kinds.is_empty() {
            request.kinds = EntryKind::ALL.to_vec();
        }
        request.kinds.dedup();
        if !request.scope.scope.is_well_formed() {
            return Err(ValidationError::InvalidScope {
                reason: format!("scope {} is malformed", request.scope.scope),
            }
            .into());
        }
        let limit = request
            .limit
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        let offset = match &request.cursor {
            Some(token) => self.deps.cursors.decode(token)?,
            None => 0,
        };
        // Chain materialization validates project/session identifiers.
        let scope_chain = self.deps.entries.resolve_chain(&request.scope.scope).await?;

        Ok(PCtx {
            request,
            scope_chain,
            type_sets: HashMap::new(),
            entries: HashMap::new(),
            tag_map: HashMap::new(),
            relation_set: None,
            lexical: HashMap::new(),
            semantic: HashMap::new(),
            scores: HashMap::new(),
            offset,
            limit,
            truncated: false,
        })
    }

    // ========================================================================
    // Stage 2: fetch
    // ========================================================================

    async fn fetch(&self, ctx: &mut PCtx) -> EngramResult<()> {
        let scopes: Vec<ScopeRef> = if ctx.request.scope.inherit {
            ctx.scope_chain.scopes().to_vec()
        } else {
            vec![ctx.request.scope.scope]
        };
        let budget = DEFAULT_FETCH_BUDGET.max(ctx.offset as usize + ctx.limit);
        for kind in ctx.request.kinds.clone() {
            let fetched = self
                .deps
                .entries
                .fetch_for_scopes(kind, &scopes, ctx.request.include_inactive, budget)
                .await?;
            if fetched.len() >= budget {
                ctx.truncated = true;
            }
            ctx.entries.insert(kind, fetched);
        }
        Ok(())
    }

    // ========================================================================
    // Stage 3: fts
    // ========================================================================

    async fn fts(&self, ctx: &mut PCtx) -> EngramResult<()> {
        let Some(search) = ctx.request.search.clone() else {
            return Ok(());
        };
        let tokens: Vec<String> = search
            .split_whitespace()
            .map(|t| {
                t.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(());
        }

        let index_hits = self.fts_index(&tokens).await;
        match index_hits {
            Ok(hits) => {
                for kind in ctx.request.kinds.clone() {
                    let set: HashSet<EntryId> = hits
                        .iter()
                        .filter(|(k, _)| *k == kind)
                        .map(|(_, id)| *id)
                        .collect();
                    for id in &set {
                        ctx.lexical.insert(*id, 1.0);
                    }
                    ctx.type_sets.insert(kind, set);
                }
            }
            Err(e) => {
                // Secondary index unavailable: substring matching over
                // the fetched entries.
                tracing::debug!(error = %e, "fts index unavailable; falling back");
                for (kind, entries) in &ctx.entries {
                    let mut set = HashSet::new();
                    for entry in entries {
                        let haystack = entry.search_text().to_lowercase();
                        let matched =
                            tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                        if matched == tokens.len() {
                            set.insert(entry.entry_id);
                            ctx.lexical.insert(entry.entry_id, 1.0);
                        } else if matched > 0 {
                            ctx.lexical
                                .insert(entry.entry_id, matched as f64 / tokens.len() as f64);
                        }
                    }
                    ctx.type_sets.insert(*kind, set);
                }
            }
        }

        // Without the semantic path the lexical match set is a hard
        // filter; with it, unmatched entries stay in play for vector
        // scoring.
        let semantic_enabled = self.semantic_active(ctx);
        if !semantic_enabled {
            for (kind, entries) in ctx.entries.iter_mut() {
                if let Some(set) = ctx.type_sets.get(kind) {
                    entries.retain(|e| set.contains(&e.entry_id));
                }
            }
        }
        Ok(())
    }

    async fn fts_index(&self, tokens: &[String]) -> EngramResult<Vec<(EntryKind, EntryId)>> {
        // Token-prefix query against the secondary index.
        let match_expr = tokens
            .iter()
            .map(|t| format!("{t}*"))
            .collect::<Vec<_>>()
            .join(" ");
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT entry_id, kind FROM entries_fts WHERE entries_fts MATCH $1",
                &[SqlValue::from(match_expr.as_str())],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: EntryKind = row
                .text("kind")?
                .parse()
                .map_err(|reason: String| EngramError::internal(reason))?;
            out.push((kind, EntryId::from_uuid_str(&row.text("entry_id")?)?));
        }
        Ok(out)
    }

    fn semantic_active(&self, ctx: &PCtx) -> bool {
        ctx.request.semantic.map(|s| s.enabled).unwrap_or(false)
            && self.deps.vectors.is_some()
            && self.deps.embedder.is_some()
    }

    // ========================================================================
    // Stage 4: filter
    // ========================================================================

    async fn filter(&self, ctx: &mut PCtx) -> EngramResult<()> {
        // Tag filters need attachments; batch-load them for the current
        // candidates before applying set operations.
        let tag_filter = ctx.request.tags.clone().filter(|f| !f.is_empty());
        if tag_filter.is_some() {
            let ids: Vec<EntryId> = ctx
                .entries
                .values()
                .flatten()
                .map(|e| e.entry_id)
                .collect();
            ctx.tag_map = self.deps.tags.tags_for_entries(&ids).await?;
        }

        let category = ctx.request.category.clone();
        let priority = ctx.request.priority;
        let date = ctx.request.date;
        let tag_map = &ctx.tag_map;

        for entries in ctx.entries.values_mut() {
            entries.retain(|entry| {
                if let Some(category) = &category {
                    if entry.category.as_deref() != Some(category.as_str()) {
                        return false;
                    }
                }
                if let Some(range) = priority {
                    let p = entry.effective_priority();
                    // Inclusive on both ends.
                    if p < range.min || p > range.max {
                        return false;
                    }
                }
                if let Some(range) = date {
                    if let Some(from) = range.from {
                        if entry.created_at < from {
                            return false;
                        }
                    }
                    if let Some(to) = range.to {
                        if entry.created_at > to {
                            return false;
                        }
                    }
                }
                if let Some(filter) = &tag_filter {
                    let names: HashSet<&str> = tag_map
                        .get(&entry.entry_id)
                        .map(|tags| tags.iter().map(|t| t.name.as_str()).collect())
                        .unwrap_or_default();
                    if !filter.include.is_empty()
                        && !filter.include.iter().any(|t| names.contains(t.as_str()))
                    {
                        return false;
                    }
                    if !filter.require.iter().all(|t| names.contains(t.as_str())) {
                        return false;
                    }
                    if filter.exclude.iter().any(|t| names.contains(t.as_str())) {
                        return false;
                    }
                }
                true
            });
        }
        Ok(())
    }

    // ========================================================================
    // Stage 5: tags
    // ========================================================================

    async fn load_tags(&self, ctx: &mut PCtx) -> EngramResult<()> {
        let missing: Vec<EntryId> = ctx
            .entries
            .values()
            .flatten()
            .map(|e| e.entry_id)
            .filter(|id| !ctx.tag_map.contains_key(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let loaded = self.deps.tags.tags_for_entries(&missing).await?;
        ctx.tag_map.extend(loaded);
        Ok(())
    }

    // ========================================================================
    // Stage 6: relations
    // ========================================================================

    async fn expand_relations(&self, ctx: &mut PCtx) -> EngramResult<()> {
        let Some(spec) = ctx.request.related_to.clone() else {
            return Ok(());
        };
        let result = self
            .deps
            .relations
            .traverse(
                (spec.kind, spec.id),
                spec.direction,
                spec.depth,
                RELATED_NODE_BUDGET,
            )
            .await?;
        if result.truncated {
            ctx.truncated = true;
        }
        let reached: HashSet<EntryId> = result.reached.iter().map(|(_, id)| *id).collect();
        for entries in ctx.entries.values_mut() {
            entries.retain(|e| reached.contains(&e.entry_id));
        }
        ctx.relation_set = Some(reached);
        Ok(())
    }

    // ========================================================================
    // Stage 7: score
    // ========================================================================

    async fn score(&self, ctx: &mut PCtx) -> EngramResult<()> {
        // Semantic similarities first, one provider call for the query.
        if self.semantic_active(ctx) {
            if let (Some(search), Some(embedder), Some(vectors)) = (
                ctx.request.search.clone(),
                self.deps.embedder.clone(),
                self.deps.vectors.clone(),
            ) {
                let threshold = ctx.request.semantic.map(|s| s.threshold).unwrap_or(0.0);
                match embedder.embed(&search).await {
                    Ok(query_vec) => {
                        for entry in ctx.entries.values().flatten() {
                            if let Some(stored) =
                                vectors.get(entry.kind, entry.entry_id).await?
                            {
                                if let Ok(sim) = stored.cosine_similarity(&query_vec) {
                                    if sim >= threshold {
                                        ctx.semantic.insert(entry.entry_id, sim as f64);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "query embedding failed; lexical only");
                    }
                }
            }
        }

        let now = chrono::Utc::now();
        let requested_tags: HashSet<&str> = ctx
            .request
            .tags
            .as_ref()
            .map(|f| {
                f.include
                    .iter()
                    .chain(f.require.iter())
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default();

        for entry in ctx.entries.values().flatten() {
            let tag_match = if requested_tags.is_empty() {
                0.0
            } else {
                let names: HashSet<&str> = ctx
                    .tag_map
                    .get(&entry.entry_id)
                    .map(|tags| tags.iter().map(|t| t.name.as_str()).collect())
                    .unwrap_or_default();
                requested_tags.intersection(&names).count() as f64 / requested_tags.len() as f64
            };
            let inputs = ScoreInputs {
                tag_match,
                scope_specificity: ctx.scope_chain.specificity_weight(&entry.scope),
                priority: entry.effective_priority(),
                lexical: ctx.lexical.get(&entry.entry_id).copied().unwrap_or(0.0),
                recency: recency_weight(entry.updated_at, now),
                semantic: ctx.semantic.get(&entry.entry_id).copied(),
            };
            ctx.scores.insert(entry.entry_id, final_score(&inputs));
        }
        Ok(())
    }

    // ========================================================================
    // Stage 8: format
    // ========================================================================

    async fn format(&self, ctx: &mut PCtx) -> EngramResult<QueryResponse> {
        let mut ranked: Vec<Entry> = Vec::new();
        // Keep request kind order, then rank across kinds.
        for kind in &ctx.request.kinds {
            if let Some(entries) = ctx.entries.get(kind) {
                ranked.extend(entries.iter().cloned());
            }
        }
        let scores = &ctx.scores;
        let chain = &ctx.scope_chain;
        ranked.sort_by(|a, b| {
            rank_order(
                a,
                b,
                |id| scores.get(&id).copied().unwrap_or(0.0),
                |e| chain.specificity_weight(&e.scope),
            )
        });

        let total = ranked.len();
        let offset = ctx.offset as usize;
        let page: Vec<Entry> = ranked.into_iter().skip(offset).take(ctx.limit).collect();
        let next_cursor = if offset + page.len() < total {
            Some(self.deps.cursors.encode((offset + page.len()) as u64))
        } else {
            None
        };

        let page_ids: Vec<EntryId> = page.iter().map(|e| e.entry_id).collect();
        let conflicts = self.deps.conflicts.unresolved_for_entries(&page_ids).await?;

        let entries = page
            .into_iter()
            .map(|entry| {
                let score = ctx.scores.get(&entry.entry_id).copied().unwrap_or(0.0);
                let tags = ctx.tag_map.get(&entry.entry_id).cloned().unwrap_or_default();
                match ctx.request.shape {
                    ResponseShape::Full => QueryResultEntry::Full(Box::new(ScoredEntry {
                        entry,
                        tags,
                        score,
                    })),
                    ResponseShape::Summary => QueryResultEntry::Summary(SummaryEntry {
                        entry_id: entry.entry_id,
                        kind: entry.kind,
                        name: entry.name,
                        category: entry.category,
                        scope: entry.scope,
                        score,
                    }),
                    ResponseShape::Context => QueryResultEntry::Context {
                        context: render_context_line(&entry),
                    },
                }
            })
            .collect();

        Ok(QueryResponse {
            entries,
            total,
            truncated: ctx.truncated,
            cache_hit: false,
            next_cursor,
            conflicts,
        })
    }
}

/// Compact one-line rendering for the context shape.
fn render_context_line(entry: &Entry) -> String {
    use engram_core::EntryPayload;
    match &entry.payload {
        EntryPayload::Guideline(g) => {
            format!("[guideline p{}] {}: {}", g.priority, entry.name, g.content)
        }
        EntryPayload::Knowledge(k) => format!("[knowledge] {}: {}", entry.name, k.content),
        EntryPayload::Tool(t) => format!("[tool] {}: {}", entry.name, t.description),
    }
}

// Helper for fts row decoding where the id arrives as text.
trait FromUuidStr: Sized {
    fn from_uuid_str(raw: &str) -> EngramResult<Self>;
}

impl FromUuidStr for EntryId {
    fn from_uuid_str(raw: &str) -> EngramResult<Self> {
        raw.parse::<uuid::Uuid>()
            .map(<EntryId as engram_core::IdType>::from_uuid)
            .map_err(|_| {
                ValidationError::InvalidIdentifier {
                    field: "entry_id".into(),
                    input: raw.to_string(),
                }
                .into()
            })
    }
}

use engram_core::IdType as _;

// ============================================================================
// TESTS
// ============================================================================
