//! Mutation audit records

use crate::{AgentId, AuditId, EntryKind, ScopeRef, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum stored payload size; larger snapshots are truncated and the
/// truncation is recorded, never silently dropped.
pub const MAX_AUDIT_PAYLOAD_BYTES: usize = 8 * 1024;

/// Audited mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Deactivate,
    Reactivate,
    Grant,
    Revoke,
    Resolve,
    LockAcquire,
    LockRelease,
    Import,
    ScopeDelete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Deactivate => "deactivate",
            AuditAction::Reactivate => "reactivate",
            AuditAction::Grant => "grant",
            AuditAction::Revoke => "revoke",
            AuditAction::Resolve => "resolve",
            AuditAction::LockAcquire => "lock_acquire",
            AuditAction::LockRelease => "lock_release",
            AuditAction::Import => "import",
            AuditAction::ScopeDelete => "scope_delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: AuditId,
    pub action: AuditAction,
    pub entry_kind: Option<EntryKind>,
    pub entity_id: Option<Uuid>,
    pub actor: AgentId,
    pub scope: Option<ScopeRef>,
    pub correlation_id: Option<Uuid>,
    pub payload: Option<serde_json::Value>,
    pub payload_truncated: bool,
    pub created_at: Timestamp,
}

/// Truncate a serialized payload to the audit size cap.
///
/// Returns the possibly-shortened JSON string and whether truncation
/// occurred. Truncation cuts on a char boundary.
pub fn truncate_audit_payload(serialized: &str) -> (String, bool) {
    if serialized.len() <= MAX_AUDIT_PAYLOAD_BYTES {
        return (serialized.to_string(), false);
    }
    let mut cut = MAX_AUDIT_PAYLOAD_BYTES;
    while cut > 0 && !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    (serialized[..cut].to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_flags_and_bounds() {
        let short = "{\"a\":1}";
        assert_eq!(truncate_audit_payload(short), (short.to_string(), false));

        let long = "x".repeat(MAX_AUDIT_PAYLOAD_BYTES + 100);
        let (out, truncated) = truncate_audit_payload(&long);
        assert!(truncated);
        assert_eq!(out.len(), MAX_AUDIT_PAYLOAD_BYTES);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let mut s = "a".repeat(MAX_AUDIT_PAYLOAD_BYTES - 1);
        s.push('é'); // 2-byte char straddling the cap
        let (out, truncated) = truncate_audit_payload(&s);
        assert!(truncated);
        assert!(out.len() <= MAX_AUDIT_PAYLOAD_BYTES);
        assert!(out.is_char_boundary(out.len()));
    }
}
