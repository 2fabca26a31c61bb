//! Query request and filter types shared by the repositories and the
//! query pipeline.

use crate::{Direction, EntryId, EntryKind, ScopeRef, Timestamp};
use serde::{Deserialize, Serialize};

/// Per-kind fetch budget before request limits apply.
pub const DEFAULT_FETCH_BUDGET: usize = 100;

/// Maximum relation-traversal depth a request may ask for.
pub const MAX_RELATED_DEPTH: u32 = 5;

/// Node budget for one relation traversal.
pub const RELATED_NODE_BUDGET: usize = 256;

// ============================================================================
// FILTER PARTS
// ============================================================================

/// Tag set operations applied by the filter stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    /// Entry matches if it has any of these.
    #[serde(default)]
    pub include: Vec<String>,
    /// Entry matches only if it has all of these.
    #[serde(default)]
    pub require: Vec<String>,
    /// Entry is dropped if it has any of these.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.require.is_empty() && self.exclude.is_empty()
    }
}

/// Inclusive priority range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityRange {
    pub min: i32,
    pub max: i32,
}

/// Inclusive creation-date range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub from: Option<Timestamp>,
    #[serde(default)]
    pub to: Option<Timestamp>,
}

/// Relation-expansion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedToSpec {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub id: EntryId,
    pub direction: Direction,
    pub depth: u32,
}

/// Semantic-scoring request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemanticSpec {
    pub enabled: bool,
    /// Minimum cosine similarity for a semantic match to contribute.
    #[serde(default = "default_semantic_threshold")]
    pub threshold: f32,
}

fn default_semantic_threshold() -> f32 {
    0.0
}

/// Scope selection with optional ancestor inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeSelector {
    #[serde(flatten)]
    pub scope: ScopeRef,
    #[serde(default = "default_inherit")]
    pub inherit: bool,
}

fn default_inherit() -> bool {
    true
}

/// Requested response projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseShape {
    #[default]
    Full,
    Summary,
    Context,
}

// ============================================================================
// QUERY REQUEST
// ============================================================================

/// The ranked-query request shape (tool `query`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub scope: ScopeSelector,
    /// Empty means all three kinds.
    #[serde(rename = "types", default)]
    pub kinds: Vec<EntryKind>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub tags: Option<TagFilter>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<PriorityRange>,
    #[serde(default)]
    pub date: Option<DateRange>,
    #[serde(default)]
    pub related_to: Option<RelatedToSpec>,
    #[serde(default)]
    pub semantic: Option<SemanticSpec>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default)]
    pub shape: ResponseShape,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

// ============================================================================
// REPOSITORY LIST FILTER
// ============================================================================

/// Offset pagination for plain `list` operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Filter for repository-level `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub scope: ScopeRef,
    #[serde(default)]
    pub inherit: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default)]
    pub name_prefix: Option<String>,
}
