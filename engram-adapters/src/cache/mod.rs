//! Cache adapter interface
//!
//! Values are opaque byte payloads; callers serialize. Keys must be UTF-8
//! stable and size-bounded so both backends accept them verbatim.

mod memory;
mod redis_backend;

pub use memory::MemoryCache;
pub use redis_backend::RedisCache;

use async_trait::async_trait;
use engram_core::{EngramResult, ValidationError};
use std::time::Duration;

/// Upper bound on cache key length.
pub const MAX_CACHE_KEY_BYTES: usize = 512;

/// Reject keys that either backend could mangle.
pub fn validate_cache_key(key: &str) -> EngramResult<()> {
    if key.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "cache_key".into(),
            reason: "empty".into(),
        }
        .into());
    }
    if key.len() > MAX_CACHE_KEY_BYTES {
        return Err(ValidationError::InvalidValue {
            field: "cache_key".into(),
            reason: format!("{} bytes exceeds {MAX_CACHE_KEY_BYTES}", key.len()),
        }
        .into());
    }
    if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ValidationError::InvalidValue {
            field: "cache_key".into(),
            reason: "contains whitespace or control characters".into(),
        }
        .into());
    }
    Ok(())
}

/// Narrow interface over a key-value cache.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn get(&self, key: &str) -> EngramResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> EngramResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> EngramResult<bool>;

    async fn clear(&self) -> EngramResult<()>;

    /// Batch get; the result is positionally aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> EngramResult<Vec<Option<Vec<u8>>>>;

    async fn set_many(
        &self,
        items: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> EngramResult<()>;
}
