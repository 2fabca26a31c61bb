//! Engram Adapters - Infrastructure Primitives
//!
//! Four narrow interfaces abstract infrastructure: storage, cache, lock,
//! and event bus. Backend choice is made once at startup from
//! configuration; everything above the adapter layer is unaware of it.

pub mod cache;
pub mod event;
pub mod lock;
pub mod storage;

pub use cache::{validate_cache_key, CacheAdapter, MemoryCache, RedisCache, MAX_CACHE_KEY_BYTES};
pub use event::{
    ChangeAction, ChangeEvent, EventAdapter, EventHandler, InProcessEventBus, SubscriptionGuard,
    ENTRY_CHANGED_CHANNEL,
};
pub use lock::{InProcessLockTable, LockAdapter, ResourceLockHandle};
pub use storage::{
    with_transaction, PgConfig, PostgresAdapter, SqlRow, SqlValue, SqliteAdapter,
    StorageAdapter, StorageTransaction,
};
