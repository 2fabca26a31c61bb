//! Directed, typed relations between entries and the mirrored graph
//! surface used by traversal.

use crate::{AgentId, EntryId, EntryKind, RelationId, ScopeRef, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// RELATION TYPES
// ============================================================================

/// Closed set of relation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    AppliesTo,
    DependsOn,
    ConflictsWith,
    RelatedTo,
    ParentTask,
    SubtaskOf,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::AppliesTo => "applies_to",
            RelationType::DependsOn => "depends_on",
            RelationType::ConflictsWith => "conflicts_with",
            RelationType::RelatedTo => "related_to",
            RelationType::ParentTask => "parent_task",
            RelationType::SubtaskOf => "subtask_of",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applies_to" => Ok(RelationType::AppliesTo),
            "depends_on" => Ok(RelationType::DependsOn),
            "conflicts_with" => Ok(RelationType::ConflictsWith),
            "related_to" => Ok(RelationType::RelatedTo),
            "parent_task" => Ok(RelationType::ParentTask),
            "subtask_of" => Ok(RelationType::SubtaskOf),
            other => Err(format!("unknown relation type: {other}")),
        }
    }
}

/// Traversal direction for `related_to` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

// ============================================================================
// RELATION RECORD
// ============================================================================

/// A directed, typed edge between two entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub relation_id: RelationId,
    pub source_kind: EntryKind,
    pub source_id: EntryId,
    pub target_kind: EntryKind,
    pub target_id: EntryId,
    pub relation_type: RelationType,
    pub properties: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub created_by: AgentId,
}

// ============================================================================
// GRAPH SURFACE
// ============================================================================

/// Graph node mirroring one memory entry; shares its scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub scope: ScopeRef,
    pub label: String,
}

/// Graph edge mirroring one relation, same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub relation_id: RelationId,
    pub source: (EntryKind, EntryId),
    pub target: (EntryKind, EntryId),
    pub edge_type: RelationType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_type_roundtrip() {
        for t in [
            RelationType::AppliesTo,
            RelationType::DependsOn,
            RelationType::ConflictsWith,
            RelationType::RelatedTo,
            RelationType::ParentTask,
            RelationType::SubtaskOf,
        ] {
            assert_eq!(t.as_str().parse::<RelationType>().unwrap(), t);
        }
        assert!("friends_with".parse::<RelationType>().is_err());
    }

    #[test]
    fn test_direction_serde() {
        let d: Direction = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(d, Direction::Both);
    }
}
