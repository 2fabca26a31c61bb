//! File lock types
//!
//! A lock is an exclusive, time-bounded claim by an agent on a file path.
//! Uniqueness holds on the path among unexpired locks; a lock past its
//! expiry is treated as absent everywhere.

use crate::{AgentId, LockId, Timestamp};
use serde::{Deserialize, Serialize};

/// Persisted lock row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub lock_id: LockId,
    pub path: String,
    pub owner: AgentId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    /// Opaque token required for release/extend (compare-and-delete).
    pub token: String,
}

impl FileLock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Handle returned to the acquiring agent. Carries the token; the token is
/// never exposed through list/get surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_id: LockId,
    pub path: String,
    pub owner: AgentId,
    pub token: String,
    pub expires_at: Timestamp,
}

impl From<FileLock> for LockHandle {
    fn from(lock: FileLock) -> Self {
        Self {
            lock_id: lock.lock_id,
            path: lock.path,
            owner: lock.owner,
            token: lock.token,
            expires_at: lock.expires_at,
        }
    }
}

/// Public view of a lock, token redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockView {
    pub lock_id: LockId,
    pub path: String,
    pub owner: AgentId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl From<FileLock> for LockView {
    fn from(lock: FileLock) -> Self {
        Self {
            lock_id: lock.lock_id,
            path: lock.path,
            owner: lock.owner,
            acquired_at: lock.acquired_at,
            expires_at: lock.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdType;
    use chrono::{Duration, Utc};

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let lock = FileLock {
            lock_id: LockId::now_v7(),
            path: "/src/x.ts".into(),
            owner: AgentId::new("a").unwrap(),
            acquired_at: now - Duration::seconds(60),
            expires_at: now,
            token: "t".into(),
        };
        // Expiry exactly at `now` counts as expired.
        assert!(lock.is_expired(now));
        assert!(!lock.is_expired(now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_view_redacts_token() {
        let lock = FileLock {
            lock_id: LockId::now_v7(),
            path: "/src/x.ts".into(),
            owner: AgentId::new("a").unwrap(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(60),
            token: "secret".into(),
        };
        let json = serde_json::to_string(&LockView::from(lock)).unwrap();
        assert!(!json.contains("secret"));
    }
}
