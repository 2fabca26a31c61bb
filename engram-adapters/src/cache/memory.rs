//! Bounded in-process LRU cache with per-value byte accounting.

use super::{validate_cache_key, CacheAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::EngramResult;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

struct Slot {
    data: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    entries: LruCache<String, Slot>,
    total_bytes: usize,
    max_bytes: usize,
    /// Guards against handler-driven re-entry while evicting.
    evicting: bool,
}

impl Inner {
    fn accounted_size(key: &str, data: &[u8]) -> usize {
        key.len() + data.len()
    }

    fn remove_accounting(&mut self, key: &str, data: &[u8]) {
        // Clamp: the counter never goes negative even if accounting drifts.
        self.total_bytes = self
            .total_bytes
            .saturating_sub(Self::accounted_size(key, data));
    }

    fn evict_to_budget(&mut self) {
        if self.evicting {
            return;
        }
        self.evicting = true;
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((key, slot)) => self.remove_accounting(&key, &slot.data),
                None => break,
            }
        }
        self.evicting = false;
    }
}

/// In-process LRU cache bounded by entry count and a global byte budget.
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                total_bytes: 0,
                max_bytes,
                evicting: false,
            }),
        }
    }

    /// Current accounted size, for stats surfaces.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("cache mutex").total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_sync(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("cache mutex");
        let expired = match inner.entries.get(key) {
            Some(slot) => slot.expires_at.is_some_and(|at| at <= Utc::now()),
            None => return None,
        };
        if expired {
            if let Some(slot) = inner.entries.pop(key) {
                inner.remove_accounting(key, &slot.data);
            }
            return None;
        }
        inner.entries.get(key).map(|slot| slot.data.clone())
    }

    fn set_sync(&self, key: String, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|t| {
            chrono::Duration::from_std(t)
                .ok()
                .map(|d| Utc::now() + d)
        });
        let mut inner = self.inner.lock().expect("cache mutex");
        if let Some(old) = inner.entries.pop(&key) {
            inner.remove_accounting(&key, &old.data);
        }
        inner.total_bytes += Inner::accounted_size(&key, &value);
        if let Some((evicted_key, evicted)) = inner.entries.push(
            key,
            Slot {
                data: value,
                expires_at,
            },
        ) {
            inner.remove_accounting(&evicted_key, &evicted.data);
        }
        inner.evict_to_budget();
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn get(&self, key: &str) -> EngramResult<Option<Vec<u8>>> {
        validate_cache_key(key)?;
        Ok(self.get_sync(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> EngramResult<()> {
        validate_cache_key(key)?;
        self.set_sync(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngramResult<bool> {
        validate_cache_key(key)?;
        let mut inner = self.inner.lock().expect("cache mutex");
        match inner.entries.pop(key) {
            Some(slot) => {
                inner.remove_accounting(key, &slot.data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> EngramResult<()> {
        let mut inner = self.inner.lock().expect("cache mutex");
        inner.entries.clear();
        inner.total_bytes = 0;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> EngramResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            validate_cache_key(key)?;
            out.push(self.get_sync(key));
        }
        Ok(out)
    }

    async fn set_many(
        &self,
        items: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> EngramResult<()> {
        for (key, value) in items {
            validate_cache_key(&key)?;
            self.set_sync(key, value, ttl);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = MemoryCache::new(16, 1 << 20);
        assert_eq!(cache.get("k1").await.unwrap(), None);

        cache.set("k1", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));

        assert!(cache.delete("k1").await.unwrap());
        assert!(!cache.delete("k1").await.unwrap());
        assert_eq!(cache.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_byte_accounting_on_eviction() {
        let cache = MemoryCache::new(64, 64);
        cache.set("a", vec![0u8; 30], None).await.unwrap();
        let after_first = cache.total_bytes();
        assert_eq!(after_first, 31);

        // Second insert pushes past 64 accounted bytes; the first entry
        // must be evicted and its exact size subtracted.
        cache.set("b", vec![0u8; 40], None).await.unwrap();
        assert_eq!(cache.total_bytes(), 41);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_accounting() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache.set("k", vec![0u8; 100], None).await.unwrap();
        cache.set("k", vec![0u8; 10], None).await.unwrap();
        assert_eq!(cache.total_bytes(), 11);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        // Expired read also releases the accounted bytes.
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_get_many_alignment() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        cache.set("c", b"3".to_vec(), None).await.unwrap();
        let out = cache
            .get_many(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_counter_never_negative() {
        let cache = MemoryCache::new(4, 16);
        for i in 0..32 {
            let key = format!("k{i}");
            cache.set(&key, vec![0u8; 8], None).await.unwrap();
        }
        // Saturating accounting holds the invariant under heavy eviction.
        assert!(cache.total_bytes() <= 16 + 16);
        cache.clear().await.unwrap();
        assert_eq!(cache.total_bytes(), 0);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, u16),
        Delete(u8),
        Get(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), 0u16..512).prop_map(|(k, n)| Op::Set(k, n)),
            any::<u8>().prop_map(Op::Delete),
            any::<u8>().prop_map(Op::Get),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Byte accounting is exact under arbitrary operation sequences:
        /// the counter equals the sum of live entries and stays within
        /// one entry of the budget.
        #[test]
        fn prop_byte_accounting_consistent(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let budget = 2048usize;
                let cache = MemoryCache::new(32, budget);
                for op in ops {
                    match op {
                        Op::Set(k, n) => {
                            cache.set(&format!("k{k}"), vec![0u8; n as usize], None).await.unwrap();
                        }
                        Op::Delete(k) => {
                            cache.delete(&format!("k{k}")).await.unwrap();
                        }
                        Op::Get(k) => {
                            let _ = cache.get(&format!("k{k}")).await.unwrap();
                        }
                    }
                    let total = cache.total_bytes();
                    prop_assert!(total <= budget + 512 + 4, "total {total} over budget");
                }
                cache.clear().await.unwrap();
                prop_assert_eq!(cache.total_bytes(), 0);
                Ok(())
            })?;
        }
    }
}
