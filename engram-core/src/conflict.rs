//! Concurrent-update conflict records
//!
//! Two writers updating the same entry within the conflict window both
//! succeed; a conflict record is appended and surfaced by queries until
//! resolved.

use crate::{AgentId, ConflictId, EntryId, EntryKind, Timestamp, VersionId};
use serde::{Deserialize, Serialize};

/// Width of the concurrent-update window, in milliseconds, measured on the
/// server clock.
pub const CONFLICT_WINDOW_MS: i64 = 5_000;

/// A recorded concurrent-update conflict between two versions of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub version_a: VersionId,
    pub version_b: VersionId,
    pub detected_at: Timestamp,
    pub resolved: bool,
    pub resolved_by: Option<AgentId>,
    pub resolved_at: Option<Timestamp>,
    pub winning_version: Option<VersionId>,
}

/// How a conflict is resolved: pick one surviving version, or supply
/// merged content (which becomes a new version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ConflictResolution {
    Pick { version_id: VersionId },
    Merge { payload: crate::EntryPayload },
}
