//! Entry version snapshots
//!
//! Versions are append-only and numbered monotonically per entry starting
//! at 1. Every mutation (update, deactivate, reactivate) appends one.

use crate::{AgentId, EntryId, EntryPayload, Timestamp, VersionId};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of an entry's payload at a moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryVersion {
    pub version_id: VersionId,
    pub entry_id: EntryId,
    /// 1-based, strictly increasing per entry.
    pub version_number: i32,
    pub payload: EntryPayload,
    pub change_reason: String,
    pub created_by: AgentId,
    pub created_at: Timestamp,
}

/// Patch applied by `update`; unset fields keep the head value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    /// Full replacement payload; partial payload edits are expressed by
    /// the caller cloning the head payload first.
    pub payload: Option<EntryPayload>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.category.is_none() && self.payload.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GuidelineExamples, GuidelinePayload};

    #[test]
    fn test_patch_emptiness() {
        assert!(EntryPatch::default().is_empty());
        let patch = EntryPatch {
            payload: Some(EntryPayload::Guideline(GuidelinePayload {
                content: "x".into(),
                rationale: None,
                examples: GuidelineExamples::default(),
                priority: 1,
            })),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
