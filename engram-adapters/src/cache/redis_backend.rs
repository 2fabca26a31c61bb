//! Distributed cache on redis with a managed connection.

use super::{validate_cache_key, CacheAdapter};
use async_trait::async_trait;
use engram_core::{EngramResult, NetworkError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

fn redis_err(e: redis::RedisError) -> engram_core::EngramError {
    NetworkError::Transport {
        reason: format!("redis: {e}"),
    }
    .into()
}

/// Redis-backed cache adapter. The connection manager reconnects
/// transparently; failures surface as network errors.
pub struct RedisCache {
    conn: ConnectionManager,
    /// Namespace prefix so several deployments can share one server.
    prefix: String,
}

impl RedisCache {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> EngramResult<Self> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl CacheAdapter for RedisCache {
    async fn get(&self, key: &str) -> EngramResult<Option<Vec<u8>>> {
        validate_cache_key(key)?;
        let mut conn = self.conn.clone();
        conn.get(self.namespaced(key)).await.map_err(redis_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> EngramResult<()> {
        validate_cache_key(key)?;
        let mut conn = self.conn.clone();
        let key = self.namespaced(key);
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(redis_err),
            None => conn.set(key, value).await.map_err(redis_err),
        }
    }

    async fn delete(&self, key: &str) -> EngramResult<bool> {
        validate_cache_key(key)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.namespaced(key)).await.map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> EngramResult<()> {
        // Scoped to this namespace; never flushes the whole server.
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn.keys(pattern).await.map_err(redis_err)?;
        if !keys.is_empty() {
            let _: i64 = conn.del(keys).await.map_err(redis_err)?;
        }
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> EngramResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        for key in keys {
            validate_cache_key(key)?;
        }
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let mut conn = self.conn.clone();
        conn.mget(namespaced).await.map_err(redis_err)
    }

    async fn set_many(
        &self,
        items: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> EngramResult<()> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}
