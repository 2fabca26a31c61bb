//! Vote repository
//!
//! Agents cast one up/down vote per entry; tallies feed the voting tool
//! and analytics.

use crate::DbDeps;
use engram_adapters::SqlValue;
use engram_core::{AgentId, EngramResult, EntryId, EntryKind, IdType, VoteId};
use serde::{Deserialize, Serialize};

/// Vote direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteValue {
    Up,
    Down,
}

impl VoteValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteValue::Up => "up",
            VoteValue::Down => "down",
        }
    }
}

/// Aggregate tally for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub up: u64,
    pub down: u64,
}

impl VoteTally {
    pub fn net(&self) -> i64 {
        self.up as i64 - self.down as i64
    }
}

/// Repository over votes.
pub struct VoteRepository {
    deps: DbDeps,
}

impl VoteRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    /// Cast or change a vote. One row per (entry, agent).
    pub async fn cast(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        agent_id: &AgentId,
        value: VoteValue,
    ) -> EngramResult<()> {
        self.deps
            .storage
            .execute(
                "DELETE FROM votes WHERE entry_kind = $1 AND entry_id = $2 AND agent_id = $3",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(agent_id.as_str()),
                ],
            )
            .await?;
        self.deps
            .storage
            .execute(
                "INSERT INTO votes (vote_id, entry_kind, entry_id, agent_id, vote, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    SqlValue::from(VoteId::now_v7().as_uuid()),
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(agent_id.as_str()),
                    SqlValue::from(value.as_str()),
                    SqlValue::from(chrono::Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Remove an agent's vote. Returns whether one existed.
    pub async fn retract(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        agent_id: &AgentId,
    ) -> EngramResult<bool> {
        let existed = !self
            .deps
            .storage
            .execute(
                "SELECT vote_id FROM votes
                 WHERE entry_kind = $1 AND entry_id = $2 AND agent_id = $3",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(agent_id.as_str()),
                ],
            )
            .await?
            .is_empty();
        self.deps
            .storage
            .execute(
                "DELETE FROM votes WHERE entry_kind = $1 AND entry_id = $2 AND agent_id = $3",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                    SqlValue::from(agent_id.as_str()),
                ],
            )
            .await?;
        Ok(existed)
    }

    pub async fn tally(&self, kind: EntryKind, entry_id: EntryId) -> EngramResult<VoteTally> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT vote, COUNT(*) AS n FROM votes
                 WHERE entry_kind = $1 AND entry_id = $2 GROUP BY vote",
                &[
                    SqlValue::from(kind.as_str()),
                    SqlValue::from(entry_id.as_uuid()),
                ],
            )
            .await?;
        let mut tally = VoteTally::default();
        for row in &rows {
            let n = row.integer("n")? as u64;
            match row.text("vote")?.as_str() {
                "up" => tally.up = n,
                "down" => tally.down = n,
                _ => {}
            }
        }
        Ok(tally)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;

    #[tokio::test]
    async fn test_one_vote_per_agent() {
        let repo = VoteRepository::new(test_deps().await);
        let entry = EntryId::now_v7();
        let a = AgentId::new("a").unwrap();
        let b = AgentId::new("b").unwrap();

        repo.cast(EntryKind::Guideline, entry, &a, VoteValue::Up)
            .await
            .unwrap();
        repo.cast(EntryKind::Guideline, entry, &b, VoteValue::Down)
            .await
            .unwrap();
        // Changing a vote replaces it, never double counts.
        repo.cast(EntryKind::Guideline, entry, &a, VoteValue::Down)
            .await
            .unwrap();

        let tally = repo.tally(EntryKind::Guideline, entry).await.unwrap();
        assert_eq!(tally.up, 0);
        assert_eq!(tally.down, 2);
        assert_eq!(tally.net(), -2);

        assert!(repo.retract(EntryKind::Guideline, entry, &a).await.unwrap());
        let tally = repo.tally(EntryKind::Guideline, entry).await.unwrap();
        assert_eq!(tally.down, 1);
    }
}
