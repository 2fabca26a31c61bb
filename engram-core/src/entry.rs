//! Memory entry structures
//!
//! Three entry kinds share a common header; the kind-specific payload is
//! carried on the version record and denormalized onto the entry for the
//! head version.

use crate::{AgentId, EntryId, ScopeRef, Timestamp, VersionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTRY KIND
// ============================================================================

/// The three entry kinds. Kind is a tagged variant throughout the
/// repository, pipeline, and handler layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Guideline,
    Knowledge,
    Tool,
}

impl EntryKind {
    pub const ALL: [EntryKind; 3] = [EntryKind::Guideline, EntryKind::Knowledge, EntryKind::Tool];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Guideline => "guideline",
            EntryKind::Knowledge => "knowledge",
            EntryKind::Tool => "tool",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guideline" | "guidelines" => Ok(EntryKind::Guideline),
            "knowledge" => Ok(EntryKind::Knowledge),
            "tool" | "tools" => Ok(EntryKind::Tool),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

// ============================================================================
// KIND-SPECIFIC PAYLOADS
// ============================================================================

/// Good/bad example lists attached to a guideline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuidelineExamples {
    #[serde(default)]
    pub good: Vec<String>,
    #[serde(default)]
    pub bad: Vec<String>,
}

/// Payload of a guideline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelinePayload {
    pub content: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub examples: GuidelineExamples,
    /// Priority 0-100; higher guidelines outrank lower ones.
    pub priority: i32,
}

/// Payload of a knowledge entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePayload {
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub valid_from: Option<Timestamp>,
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
}

/// Payload of a tool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub description: String,
    /// Structured parameter description (JSON schema shaped, uninterpreted).
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub constraints: Option<String>,
}

/// Kind-tagged payload snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryPayload {
    Guideline(GuidelinePayload),
    Knowledge(KnowledgePayload),
    Tool(ToolPayload),
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPayload::Guideline(_) => EntryKind::Guideline,
            EntryPayload::Knowledge(_) => EntryKind::Knowledge,
            EntryPayload::Tool(_) => EntryKind::Tool,
        }
    }

    /// Priority carried by the payload; only guidelines have one.
    pub fn priority(&self) -> Option<i32> {
        match self {
            EntryPayload::Guideline(g) => Some(g.priority),
            _ => None,
        }
    }

    /// Text searched by the lexical stage and embedded by the semantic
    /// path. Extraction is per kind: guidelines use content + rationale,
    /// knowledge uses content + source, tools use description.
    pub fn search_text(&self, name: &str) -> String {
        match self {
            EntryPayload::Guideline(g) => match &g.rationale {
                Some(r) => format!("{name}\n{}\n{r}", g.content),
                None => format!("{name}\n{}", g.content),
            },
            EntryPayload::Knowledge(k) => match &k.source {
                Some(s) => format!("{name}\n{}\n{s}", k.content),
                None => format!("{name}\n{}", k.content),
            },
            EntryPayload::Tool(t) => format!("{name}\n{}", t.description),
        }
    }

    /// Validate payload-level constraints.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EntryPayload::Guideline(g) => {
                if g.content.trim().is_empty() {
                    return Err("guideline content must not be empty".into());
                }
                if !(0..=100).contains(&g.priority) {
                    return Err(format!("priority {} out of range 0..=100", g.priority));
                }
            }
            EntryPayload::Knowledge(k) => {
                if k.content.trim().is_empty() {
                    return Err("knowledge content must not be empty".into());
                }
                if !(0.0..=1.0).contains(&k.confidence) {
                    return Err(format!("confidence {} out of range 0..=1", k.confidence));
                }
                if let (Some(from), Some(until)) = (k.valid_from, k.valid_until) {
                    if until < from {
                        return Err("valid_until precedes valid_from".into());
                    }
                }
            }
            EntryPayload::Tool(t) => {
                if t.description.trim().is_empty() {
                    return Err("tool description must not be empty".into());
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// ENTRY
// ============================================================================

/// A memory entry: durable identity plus the head-version payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: EntryId,
    pub kind: EntryKind,
    pub name: String,
    /// Free categorization per kind (e.g. "security", "style").
    pub category: Option<String>,
    pub scope: ScopeRef,
    pub active: bool,
    pub created_at: Timestamp,
    pub created_by: AgentId,
    pub updated_at: Timestamp,
    /// Greatest version number; the current state.
    pub head_version: i32,
    pub head_version_id: VersionId,
    pub payload: EntryPayload,
}

impl Entry {
    /// Priority used by scoring; entries without one rank as 0.
    pub fn effective_priority(&self) -> i32 {
        self.payload.priority().unwrap_or(0)
    }

    pub fn search_text(&self) -> String {
        self.payload.search_text(&self.name)
    }
}

// ============================================================================
// TESTS
// ============================================================================
