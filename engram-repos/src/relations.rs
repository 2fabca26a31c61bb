//! Relation repository and bounded graph traversal

use crate::DbDeps;
use engram_adapters::{SqlRow, SqlValue};
use engram_core::{
    AgentId, Direction, EngramError, EngramResult, EntryId, EntryKind, GraphEdge, IdType,
    Relation, RelationId, RelationType, ResourceError, ValidationError, MAX_RELATED_DEPTH,
    RELATED_NODE_BUDGET,
};
use std::collections::{HashSet, VecDeque};

fn decode(row: &SqlRow) -> EngramResult<Relation> {
    let parse_kind = |raw: String| -> EngramResult<EntryKind> {
        raw.parse().map_err(|reason| {
            EngramError::from(ValidationError::InvalidValue {
                field: "kind".into(),
                reason,
            })
        })
    };
    Ok(Relation {
        relation_id: RelationId::from_uuid(row.uuid("relation_id")?),
        source_kind: parse_kind(row.text("source_kind")?)?,
        source_id: EntryId::from_uuid(row.uuid("source_id")?),
        target_kind: parse_kind(row.text("target_kind")?)?,
        target_id: EntryId::from_uuid(row.uuid("target_id")?),
        relation_type: row.text("relation_type")?.parse().map_err(|reason| {
            EngramError::from(ValidationError::InvalidValue {
                field: "relation_type".into(),
                reason,
            })
        })?,
        properties: row.opt_json("properties")?,
        created_at: row.timestamp("created_at")?,
        created_by: AgentId::new(row.text("created_by")?).unwrap_or_else(|_| AgentId::system()),
    })
}

/// Result of a bounded traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalResult {
    /// Reached entries, excluding the start node.
    pub reached: Vec<(EntryKind, EntryId)>,
    /// Set when the depth or node budget cut the walk short.
    pub truncated: bool,
}

/// Repository over relations and the mirrored graph edges.
pub struct RelationRepository {
    deps: DbDeps,
}

impl RelationRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    async fn entry_exists(&self, id: EntryId) -> EngramResult<bool> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT entry_id FROM entries WHERE entry_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        source_kind: EntryKind,
        source_id: EntryId,
        target_kind: EntryKind,
        target_id: EntryId,
        relation_type: RelationType,
        properties: Option<serde_json::Value>,
        created_by: &AgentId,
    ) -> EngramResult<Relation> {
        if source_id == target_id {
            return Err(EngramError::invalid_value(
                "target_id",
                "relation endpoints must differ",
            ));
        }
        if !self.entry_exists(source_id).await? {
            return Err(EngramError::not_found("entry", source_id));
        }
        if !self.entry_exists(target_id).await? {
            return Err(EngramError::not_found("entry", target_id));
        }
        let relation = Relation {
            relation_id: RelationId::now_v7(),
            source_kind,
            source_id,
            target_kind,
            target_id,
            relation_type,
            properties,
            created_at: chrono::Utc::now(),
            created_by: created_by.clone(),
        };
        self.deps
            .storage
            .execute(
                "INSERT INTO relations
                     (relation_id, source_kind, source_id, target_kind, target_id,
                      relation_type, properties, created_at, created_by)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    SqlValue::from(relation.relation_id.as_uuid()),
                    SqlValue::from(relation.source_kind.as_str()),
                    SqlValue::from(relation.source_id.as_uuid()),
                    SqlValue::from(relation.target_kind.as_str()),
                    SqlValue::from(relation.target_id.as_uuid()),
                    SqlValue::from(relation.relation_type.as_str()),
                    match &relation.properties {
                        Some(p) => SqlValue::Text(p.to_string()),
                        None => SqlValue::Null,
                    },
                    SqlValue::from(relation.created_at),
                    SqlValue::from(relation.created_by.as_str()),
                ],
            )
            .await
            .map_err(|e| {
                if crate::is_unique_violation(&e) {
                    ResourceError::StateConflict {
                        reason: "relation already exists".into(),
                    }
                    .into()
                } else {
                    e
                }
            })?;
        Ok(relation)
    }

    pub async fn delete(&self, id: RelationId) -> EngramResult<bool> {
        let existed = !self
            .deps
            .storage
            .execute(
                "SELECT relation_id FROM relations WHERE relation_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?
            .is_empty();
        self.deps
            .storage
            .execute(
                "DELETE FROM relations WHERE relation_id = $1",
                &[SqlValue::from(id.as_uuid())],
            )
            .await?;
        Ok(existed)
    }

    /// Relations touching an entry, in the requested direction.
    pub async fn for_entry(
        &self,
        entry_id: EntryId,
        direction: Direction,
    ) -> EngramResult<Vec<Relation>> {
        let sql = match direction {
            Direction::Forward => "SELECT * FROM relations WHERE source_id = $1",
            Direction::Backward => "SELECT * FROM relations WHERE target_id = $1",
            Direction::Both => "SELECT * FROM relations WHERE source_id = $1 OR target_id = $1",
        };
        let rows = self
            .deps
            .storage
            .execute(sql, &[SqlValue::from(entry_id.as_uuid())])
            .await?;
        rows.iter().map(decode).collect()
    }

    /// Graph edges view for one entry; mirrors relations one-to-one.
    pub async fn edges_for_entry(&self, entry_id: EntryId) -> EngramResult<Vec<GraphEdge>> {
        Ok(self
            .for_entry(entry_id, Direction::Both)
            .await?
            .into_iter()
            .map(|r| GraphEdge {
                relation_id: r.relation_id,
                source: (r.source_kind, r.source_id),
                target: (r.target_kind, r.target_id),
                edge_type: r.relation_type,
            })
            .collect())
    }

    /// Bounded breadth-first walk from a start entry.
    ///
    /// `Both` follows either edge orientation at every hop (union of
    /// frontiers). The walk stops at `depth` hops or the node budget,
    /// whichever comes first; hitting the budget flags truncation.
    pub async fn traverse(
        &self,
        start: (EntryKind, EntryId),
        direction: Direction,
        depth: u32,
        node_budget: usize,
    ) -> EngramResult<TraversalResult> {
        if depth == 0 || depth > MAX_RELATED_DEPTH {
            return Err(EngramError::from(ValidationError::OutOfRange {
                field: "depth".into(),
                min: 1,
                max: MAX_RELATED_DEPTH as i64,
            }));
        }
        let budget = node_budget.min(RELATED_NODE_BUDGET);

        let mut seen: HashSet<EntryId> = HashSet::from([start.1]);
        let mut reached: Vec<(EntryKind, EntryId)> = Vec::new();
        let mut truncated = false;
        let mut frontier: VecDeque<EntryId> = VecDeque::from([start.1]);

        for _hop in 0..depth {
            if frontier.is_empty() || truncated {
                break;
            }
            let mut next_frontier: VecDeque<EntryId> = VecDeque::new();
            while let Some(node) = frontier.pop_front() {
                let relations = self.for_entry(node, direction).await?;
                for relation in relations {
                    let neighbors: Vec<(EntryKind, EntryId)> = match direction {
                        Direction::Forward => vec![(relation.target_kind, relation.target_id)],
                        Direction::Backward => vec![(relation.source_kind, relation.source_id)],
                        Direction::Both => vec![
                            (relation.target_kind, relation.target_id),
                            (relation.source_kind, relation.source_id),
                        ],
                    };
                    for (kind, id) in neighbors {
                        if !seen.insert(id) {
                            continue;
                        }
                        if reached.len() >= budget {
                            truncated = true;
                            break;
                        }
                        reached.push((kind, id));
                        next_frontier.push_back(id);
                    }
                    if truncated {
                        break;
                    }
                }
                if truncated {
                    break;
                }
            }
            frontier = next_frontier;
        }

        if truncated {
            tracing::warn!(
                start = %start.1,
                budget,
                "relation traversal truncated by node budget"
            );
        }
        Ok(TraversalResult { reached, truncated })
    }
}

// ============================================================================
// TESTS
// ============================================================================
