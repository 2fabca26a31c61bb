//! Generic resource-lock adapter
//!
//! Coordination primitive over arbitrary resource names. Handles carry an
//! opaque token; release and extend are compare-and-delete against both
//! owner and token. Distinct from the file-lock repository, which persists
//! agent file claims.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use engram_core::{AgentId, EngramResult};
use std::time::Duration;
use uuid::Uuid;

/// Handle returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLockHandle {
    pub resource: String,
    pub owner: AgentId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Narrow interface over an exclusive, TTL-bounded lock table.
#[async_trait]
pub trait LockAdapter: Send + Sync {
    /// Acquire the resource for `owner`; `None` when actively held by
    /// someone else. Stale holds never block.
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        owner: &AgentId,
    ) -> EngramResult<Option<ResourceLockHandle>>;

    /// Release only when owner and token both match.
    async fn release(&self, handle: &ResourceLockHandle) -> EngramResult<bool>;

    /// Extend expiry under the same comparison.
    async fn extend(&self, handle: &ResourceLockHandle, ttl: Duration) -> EngramResult<bool>;

    async fn is_locked(&self, resource: &str) -> EngramResult<bool>;

    async fn owner_of(&self, resource: &str) -> EngramResult<Option<AgentId>>;
}

struct Hold {
    owner: AgentId,
    token: String,
    expires_at: DateTime<Utc>,
}

impl Hold {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-process lock table on a concurrent map.
#[derive(Default)]
pub struct InProcessLockTable {
    holds: DashMap<String, Hold>,
}

impl InProcessLockTable {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ttl_to_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now()
        + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 4))
}

#[async_trait]
impl LockAdapter for InProcessLockTable {
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        owner: &AgentId,
    ) -> EngramResult<Option<ResourceLockHandle>> {
        let now = Utc::now();
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = ttl_to_expiry(ttl);

        // The entry API gives one atomic expire-then-insert step.
        let mut entry = self.holds.entry(resource.to_string()).or_insert_with(|| Hold {
            owner: owner.clone(),
            token: token.clone(),
            expires_at,
        });
        if entry.token != token {
            // Pre-existing hold: take over only when stale.
            if !entry.is_expired(now) {
                return Ok(None);
            }
            *entry.value_mut() = Hold {
                owner: owner.clone(),
                token: token.clone(),
                expires_at,
            };
        }
        drop(entry);

        Ok(Some(ResourceLockHandle {
            resource: resource.to_string(),
            owner: owner.clone(),
            token,
            expires_at,
        }))
    }

    async fn release(&self, handle: &ResourceLockHandle) -> EngramResult<bool> {
        let removed = self.holds.remove_if(&handle.resource, |_, hold| {
            hold.owner == handle.owner && hold.token == handle.token
        });
        Ok(removed.is_some())
    }

    async fn extend(&self, handle: &ResourceLockHandle, ttl: Duration) -> EngramResult<bool> {
        match self.holds.get_mut(&handle.resource) {
            Some(mut hold)
                if hold.owner == handle.owner
                    && hold.token == handle.token
                    && !hold.is_expired(Utc::now()) =>
            {
                hold.expires_at = ttl_to_expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, resource: &str) -> EngramResult<bool> {
        Ok(self
            .holds
            .get(resource)
            .is_some_and(|hold| !hold.is_expired(Utc::now())))
    }

    async fn owner_of(&self, resource: &str) -> EngramResult<Option<AgentId>> {
        Ok(self.holds.get(resource).and_then(|hold| {
            if hold.is_expired(Utc::now()) {
                None
            } else {
                Some(hold.owner.clone())
            }
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_acquisition() {
        let table = InProcessLockTable::new();
        let a = agent("a");
        let b = agent("b");

        let handle = table
            .acquire("build", Duration::from_secs(60), &a)
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(table.acquire("build", Duration::from_secs(60), &b).await.unwrap().is_none());
        assert!(table.is_locked("build").await.unwrap());
        assert_eq!(table.owner_of("build").await.unwrap(), Some(a.clone()));

        assert!(table.release(&handle).await.unwrap());
        assert!(!table.is_locked("build").await.unwrap());
        assert!(table
            .acquire("build", Duration::from_secs(60), &b)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let table = InProcessLockTable::new();
        let a = agent("a");
        let handle = table
            .acquire("r", Duration::from_secs(60), &a)
            .await
            .unwrap()
            .unwrap();

        let forged = ResourceLockHandle {
            token: "forged".into(),
            ..handle.clone()
        };
        assert!(!table.release(&forged).await.unwrap());
        assert!(table.is_locked("r").await.unwrap());
        assert!(table.release(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_hold_never_blocks() {
        let table = InProcessLockTable::new();
        let a = agent("a");
        let b = agent("b");

        table
            .acquire("r", Duration::from_millis(5), &a)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!table.is_locked("r").await.unwrap());
        assert_eq!(table.owner_of("r").await.unwrap(), None);
        let handle = table
            .acquire("r", Duration::from_secs(60), &b)
            .await
            .unwrap()
            .expect("stale hold is replaced");
        assert_eq!(handle.owner, b);
    }

    #[tokio::test]
    async fn test_extend_refuses_expired_or_forged() {
        let table = InProcessLockTable::new();
        let a = agent("a");
        let handle = table
            .acquire("r", Duration::from_millis(5), &a)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!table.extend(&handle, Duration::from_secs(60)).await.unwrap());

        let live = table
            .acquire("r2", Duration::from_secs(60), &a)
            .await
            .unwrap()
            .unwrap();
        let forged = ResourceLockHandle {
            token: "forged".into(),
            ..live.clone()
        };
        assert!(!table.extend(&forged, Duration::from_secs(60)).await.unwrap());
        assert!(table.extend(&live, Duration::from_secs(120)).await.unwrap());
    }
}
