//! Tags and tag attachments

use crate::{EntryId, EntryKind, TagId, Timestamp};
use serde::{Deserialize, Serialize};

/// A tag: globally unique name with optional presentation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: TagId,
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
    pub created_at: Timestamp,
}

/// Many-to-many link between a tag and an entry, keyed
/// `(entry kind, entry id, tag id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagAttachment {
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub tag_id: TagId,
}

/// Normalize a tag name: lowercase, trimmed.
///
/// Uniqueness is enforced on the normalized form.
pub fn normalize_tag_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}
