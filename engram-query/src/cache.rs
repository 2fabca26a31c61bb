//! Query result cache
//!
//! LRU over serialized responses with per-value size accounting and a
//! global byte budget. The cache subscribes to `entry:changed`; an event
//! whose scope is an ancestor of (or equal to) a cached request's scope
//! chain invalidates that entry. Subscription setup lives in one
//! `wire_query_cache` helper so reconnects cannot leak listeners.

use crate::pipeline::QueryResponse;
use engram_adapters::{ChangeEvent, EventAdapter, SubscriptionGuard, ENTRY_CHANGED_CHANNEL};
use engram_core::{QueryCacheConfig, QueryRequest, ScopeRef};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct CachedResult {
    bytes: Vec<u8>,
    chain: Vec<ScopeRef>,
    stored_at: Instant,
}

struct Inner {
    entries: LruCache<String, CachedResult>,
    total_bytes: usize,
    max_bytes: usize,
    evicting: bool,
}

impl Inner {
    fn remove_accounting(&mut self, key_len: usize, value_len: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(key_len + value_len);
    }

    fn evict_to_budget(&mut self) {
        if self.evicting {
            return;
        }
        self.evicting = true;
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((key, value)) => self.remove_accounting(key.len(), value.bytes.len()),
                None => break,
            }
        }
        self.evicting = false;
    }
}

/// Counters exposed through analytics/health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// The cache. Values are serialized responses so size accounting reflects
/// what the transport would carry.
pub struct QueryCache {
    inner: Mutex<Inner>,
    ttl: std::time::Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(
                    NonZeroUsize::new(4096).expect("constant capacity is non-zero"),
                ),
                total_bytes: 0,
                max_bytes: config.max_bytes,
                evicting: false,
            }),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Stable cache key: SHA-256 over the canonical serialization of the
    /// request (kinds, scope, filters, search, related_to, limit, cursor).
    pub fn key_for(request: &QueryRequest) -> String {
        let canonical = serde_json::to_string(request).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("query:{}", hex::encode(hasher.finalize()))
    }

    pub fn get(&self, key: &str) -> Option<QueryResponse> {
        let mut inner = self.inner.lock().expect("query cache mutex");
        let expired = match inner.entries.get(key) {
            Some(cached) => cached.stored_at.elapsed() >= self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            if let Some(cached) = inner.entries.pop(key) {
                inner.remove_accounting(key.len(), cached.bytes.len());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let cached = inner.entries.get(key).expect("checked present");
        match serde_json::from_slice::<QueryResponse>(&cached.bytes) {
            Ok(mut response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                response.cache_hit = true;
                Some(response)
            }
            Err(_) => None,
        }
    }

    /// Store a response. Populated only on success paths; a cancelled or
    /// failed query never reaches here.
    pub fn put(&self, key: String, response: &QueryResponse, chain: Vec<ScopeRef>) {
        let Ok(bytes) = serde_json::to_vec(response) else {
            return;
        };
        let mut inner = self.inner.lock().expect("query cache mutex");
        if let Some(old) = inner.entries.pop(&key) {
            inner.remove_accounting(key.len(), old.bytes.len());
        }
        inner.total_bytes += key.len() + bytes.len();
        if let Some((evicted_key, evicted)) = inner.entries.push(
            key,
            CachedResult {
                bytes,
                chain,
                stored_at: Instant::now(),
            },
        ) {
            inner.remove_accounting(evicted_key.len(), evicted.bytes.len());
        }
        inner.evict_to_budget();
    }

    /// Drop every cached result whose scope chain contains `scope` (the
    /// event scope is an ancestor of, or equal to, the request scope).
    pub fn invalidate_scope(&self, scope: &ScopeRef) {
        let mut inner = self.inner.lock().expect("query cache mutex");
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, cached)| cached.chain.contains(scope))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(cached) = inner.entries.pop(&key) {
                inner.remove_accounting(key.len(), cached.bytes.len());
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("query cache mutex");
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn stats(&self) -> QueryCacheStats {
        let inner = self.inner.lock().expect("query cache mutex");
        QueryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
        }
    }
}

/// Subscribe the cache to mutation events. The returned guard owns the
/// subscription; dropping it detaches the handler, so setup and teardown
/// live in exactly one place.
pub fn wire_query_cache(cache: &Arc<QueryCache>, events: &dyn EventAdapter) -> SubscriptionGuard {
    let cache = Arc::clone(cache);
    events.subscribe(
        ENTRY_CHANGED_CHANNEL,
        Arc::new(move |value| {
            if let Ok(event) = serde_json::from_value::<ChangeEvent>(value.clone()) {
                cache.invalidate_scope(&event.scope);
            }
        }),
    )
}

// ============================================================================
// TESTS
// ============================================================================
