//! File lock repository
//!
//! Acquisition is an atomic expire-then-insert inside one transaction:
//! delete any lock on the path whose expiry has passed, then insert. A
//! unique violation on the insert means another live holder won the race,
//! which surfaces as `None`, never as an error. Release and extend are
//! compare-and-delete against owner and token. Locks never auto-renew.

use crate::DbDeps;
use engram_adapters::{with_transaction, SqlRow, SqlValue};
use engram_core::{
    AgentId, AuditAction, EngramResult, FileLock, IdType, LockHandle, LockId, LockView,
};
use futures_util::FutureExt;
use std::time::Duration;
use uuid::Uuid;

fn decode(row: &SqlRow) -> EngramResult<FileLock> {
    Ok(FileLock {
        lock_id: LockId::from_uuid(row.uuid("lock_id")?),
        path: row.text("path")?,
        owner: AgentId::new(row.text("owner")?).unwrap_or_else(|_| AgentId::system()),
        acquired_at: row.timestamp("acquired_at")?,
        expires_at: row.timestamp("expires_at")?,
        token: row.text("token")?,
    })
}

/// Repository over persisted file locks.
pub struct FileLockRepository {
    deps: DbDeps,
}

impl FileLockRepository {
    pub fn new(deps: DbDeps) -> Self {
        Self { deps }
    }

    /// Acquire `path` for `owner`. Returns `None` when a live lock is
    /// held by anyone (the owner included; locks never auto-renew).
    pub async fn acquire(
        &self,
        path: &str,
        owner: &AgentId,
        ttl: Duration,
    ) -> EngramResult<Option<LockHandle>> {
        if path.trim().is_empty() {
            return Err(engram_core::EngramError::missing_field("path"));
        }
        let now = chrono::Utc::now();
        let lock = FileLock {
            lock_id: LockId::now_v7(),
            path: path.to_string(),
            owner: owner.clone(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            token: Uuid::new_v4().simple().to_string(),
        };

        let attempt = with_transaction(self.deps.storage.as_ref(), self.deps.retry, move |tx| {
            let lock = lock.clone();
            async move {
                tx.execute(
                    "DELETE FROM file_locks WHERE path = $1 AND expires_at <= $2",
                    &[SqlValue::from(lock.path.as_str()), SqlValue::from(lock.acquired_at)],
                )
                .await?;
                tx.execute(
                    "INSERT INTO file_locks
                         (lock_id, path, owner, acquired_at, expires_at, token)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        SqlValue::from(lock.lock_id.as_uuid()),
                        SqlValue::from(lock.path.as_str()),
                        SqlValue::from(lock.owner.as_str()),
                        SqlValue::from(lock.acquired_at),
                        SqlValue::from(lock.expires_at),
                        SqlValue::from(lock.token.as_str()),
                    ],
                )
                .await?;
                crate::audit::append_in_tx(
                    tx,
                    AuditAction::LockAcquire,
                    None,
                    Some(lock.lock_id.as_uuid()),
                    &lock.owner,
                    None,
                    None,
                    Some(serde_json::json!({ "path": lock.path })),
                )
                .await?;
                Ok(lock)
            }
            .boxed()
        })
        .await;

        match attempt {
            Ok(lock) => Ok(Some(lock.into())),
            Err(e) if crate::is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Release under owner + token comparison. Returns whether a row was
    /// removed.
    pub async fn release(&self, handle: &LockHandle) -> EngramResult<bool> {
        let existed = !self
            .deps
            .storage
            .execute(
                "SELECT lock_id FROM file_locks
                 WHERE path = $1 AND owner = $2 AND token = $3",
                &[
                    SqlValue::from(handle.path.as_str()),
                    SqlValue::from(handle.owner.as_str()),
                    SqlValue::from(handle.token.as_str()),
                ],
            )
            .await?
            .is_empty();
        if !existed {
            return Ok(false);
        }
        self.deps
            .storage
            .execute(
                "DELETE FROM file_locks
                 WHERE path = $1 AND owner = $2 AND token = $3",
                &[
                    SqlValue::from(handle.path.as_str()),
                    SqlValue::from(handle.owner.as_str()),
                    SqlValue::from(handle.token.as_str()),
                ],
            )
            .await?;
        let audit = crate::AuditRepository::new(self.deps.clone());
        let _ = audit
            .append(
                AuditAction::LockRelease,
                None,
                Some(handle.lock_id.as_uuid()),
                &handle.owner,
                None,
                None,
                Some(serde_json::json!({ "path": handle.path })),
            )
            .await;
        Ok(true)
    }

    /// Extend expiry under the same comparison; refuses expired locks.
    pub async fn extend(&self, handle: &LockHandle, ttl: Duration) -> EngramResult<bool> {
        let now = chrono::Utc::now();
        let new_expiry = now
            + chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let live = self
            .deps
            .storage
            .execute(
                "SELECT lock_id FROM file_locks
                 WHERE path = $1 AND owner = $2 AND token = $3 AND expires_at > $4",
                &[
                    SqlValue::from(handle.path.as_str()),
                    SqlValue::from(handle.owner.as_str()),
                    SqlValue::from(handle.token.as_str()),
                    SqlValue::from(now),
                ],
            )
            .await?;
        if live.is_empty() {
            return Ok(false);
        }
        self.deps
            .storage
            .execute(
                "UPDATE file_locks SET expires_at = $1
                 WHERE path = $2 AND owner = $3 AND token = $4",
                &[
                    SqlValue::from(new_expiry),
                    SqlValue::from(handle.path.as_str()),
                    SqlValue::from(handle.owner.as_str()),
                    SqlValue::from(handle.token.as_str()),
                ],
            )
            .await?;
        Ok(true)
    }

    /// Whether a live lock exists on the path. Expired rows count as
    /// absent.
    pub async fn is_locked(&self, path: &str) -> EngramResult<bool> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT lock_id FROM file_locks WHERE path = $1 AND expires_at > $2",
                &[SqlValue::from(path), SqlValue::from(chrono::Utc::now())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn get(&self, path: &str) -> EngramResult<Option<LockView>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM file_locks WHERE path = $1 AND expires_at > $2",
                &[SqlValue::from(path), SqlValue::from(chrono::Utc::now())],
            )
            .await?;
        Ok(rows.first().map(decode).transpose()?.map(LockView::from))
    }

    pub async fn list_active(&self) -> EngramResult<Vec<LockView>> {
        let rows = self
            .deps
            .storage
            .execute(
                "SELECT * FROM file_locks WHERE expires_at > $1 ORDER BY path",
                &[SqlValue::from(chrono::Utc::now())],
            )
            .await?;
        Ok(rows
            .iter()
            .map(decode)
            .collect::<EngramResult<Vec<_>>>()?
            .into_iter()
            .map(LockView::from)
            .collect())
    }

    /// Remove expired rows; returns how many were dropped.
    pub async fn cleanup_expired(&self) -> EngramResult<u64> {
        let now = chrono::Utc::now();
        let expired = self
            .deps
            .storage
            .execute(
                "SELECT COUNT(*) AS n FROM file_locks WHERE expires_at <= $1",
                &[SqlValue::from(now)],
            )
            .await?;
        let n = expired
            .first()
            .map(|r| r.integer("n"))
            .transpose()?
            .unwrap_or(0) as u64;
        self.deps
            .storage
            .execute(
                "DELETE FROM file_locks WHERE expires_at <= $1",
                &[SqlValue::from(now)],
            )
            .await?;
        Ok(n)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::tests::test_deps;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_exclusion_scenario() {
        let repo = FileLockRepository::new(test_deps().await);
        let a = agent("agent-a");
        let b = agent("agent-b");

        // A acquires, B is excluded, A releases, B acquires.
        let handle_a = repo
            .acquire("/src/x.ts", &a, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("A acquires");
        assert!(repo
            .acquire("/src/x.ts", &b, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        assert!(repo.is_locked("/src/x.ts").await.unwrap());

        assert!(repo.release(&handle_a).await.unwrap());
        assert!(!repo.is_locked("/src/x.ts").await.unwrap());

        let handle_b = repo
            .acquire("/src/x.ts", &b, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("B acquires after release");
        assert_eq!(handle_b.owner, b);
    }

    #[tokio::test]
    async fn test_stale_lock_never_blocks() {
        let repo = FileLockRepository::new(test_deps().await);
        let a = agent("agent-a");
        let b = agent("agent-b");

        repo.acquire("/src/y.ts", &a, Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!repo.is_locked("/src/y.ts").await.unwrap());
        let handle = repo
            .acquire("/src/y.ts", &b, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lock replaced");
        assert_eq!(handle.owner, b);
    }

    #[tokio::test]
    async fn test_release_requires_owner_and_token() {
        let repo = FileLockRepository::new(test_deps().await);
        let a = agent("agent-a");
        let handle = repo
            .acquire("/src/z.ts", &a, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let forged = LockHandle {
            token: "forged".into(),
            ..handle.clone()
        };
        assert!(!repo.release(&forged).await.unwrap());

        let wrong_owner = LockHandle {
            owner: agent("intruder"),
            ..handle.clone()
        };
        assert!(!repo.release(&wrong_owner).await.unwrap());

        assert!(repo.release(&handle).await.unwrap());
        // Second release finds nothing.
        assert!(!repo.release(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_only_live_matching_lock() {
        let repo = FileLockRepository::new(test_deps().await);
        let a = agent("agent-a");
        let handle = repo
            .acquire("/src/w.ts", &a, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(repo.extend(&handle, Duration::from_secs(120)).await.unwrap());
        let view = repo.get("/src/w.ts").await.unwrap().unwrap();
        assert!(view.expires_at > handle.expires_at);

        let forged = LockHandle {
            token: "forged".into(),
            ..handle.clone()
        };
        assert!(!repo.extend(&forged, Duration::from_secs(120)).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_expired() {
        let repo = FileLockRepository::new(test_deps().await);
        let a = agent("agent-a");
        repo.acquire("/stale", &a, Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        repo.acquire("/live", &a, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(repo.cleanup_expired().await.unwrap(), 1);
        assert_eq!(repo.list_active().await.unwrap().len(), 1);
    }
}
