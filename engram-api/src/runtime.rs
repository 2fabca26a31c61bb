//! Runtime and AppContext wiring
//!
//! Container holds one Runtime per process; Runtime carries the shared
//! resources (rate limiter, query cache, event bus, embedding workers);
//! AppContext assembles adapters, repositories, services, and the query
//! engine for a transport. Shared wiring lives in one function used by
//! both the stdio and HTTP paths.

use engram_adapters::{
    CacheAdapter, InProcessEventBus, InProcessLockTable, LockAdapter, MemoryCache, PgConfig,
    PostgresAdapter, RedisCache, SqliteAdapter, StorageAdapter, SubscriptionGuard,
};
use engram_core::{
    CacheBackendConfig, EmbeddingProviderKind, EngramConfig, EngramResult, HealthStatus,
    StorageBackendConfig,
};
use engram_query::{wire_query_cache, CursorCodec, QueryCache, QueryDeps, QueryEngine};
use engram_repos::{
    run_migrations, AuditRepository, ConflictRepository, DbDeps, EmbeddingRepository,
    EmbeddingSink, EntryRepository, FileLockRepository, GrantRepository, NullEmbeddingSink,
    RelationRepository, ScopeRepository, TagRepository, VoteRepository,
};
use engram_services::{
    AuditService, EmbeddingProvider, EmbeddingWorkerPool, FileVectorStore,
    HttpEmbeddingProvider, PermissionService, RateLimiter, StubEmbeddingProvider,
    VerificationService, VectorStore,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ============================================================================
// RUNTIME
// ============================================================================

/// Process-shared resources. Created once at startup; rebuilt only by
/// `Container::reset`.
pub struct Runtime {
    pub rate_limiter: Arc<RateLimiter>,
    pub query_cache: Arc<QueryCache>,
    /// Shared key-value cache (memory or redis) for derived data such as
    /// analytics snapshots.
    pub stats_cache: Arc<dyn CacheAdapter>,
    /// Generic resource locks guarding exclusive maintenance operations.
    pub resource_locks: Arc<dyn LockAdapter>,
    pub events: Arc<InProcessEventBus>,
    pub embedding_pool: Option<Arc<EmbeddingWorkerPool>>,
    pub started_at: Instant,
}

/// Process-level holder. Owns a single Runtime reference; `reset()`
/// tears it down for tests.
#[derive(Default)]
pub struct Container {
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, runtime: Arc<Runtime>) {
        *self.runtime.lock().expect("container lock") = Some(runtime);
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.lock().expect("container lock").clone()
    }

    /// Tear down the runtime. Shuts the event bus so no subscriber or
    /// worker outlives the reset.
    pub fn reset(&self) {
        if let Some(runtime) = self.runtime.lock().expect("container lock").take() {
            runtime.events.shutdown();
        }
    }
}

// ============================================================================
// APP CONTEXT
// ============================================================================

/// Per-transport dependency container assembled over a Runtime.
pub struct AppContext {
    pub config: EngramConfig,
    pub storage: Arc<dyn StorageAdapter>,
    pub entries: Arc<EntryRepository>,
    pub scopes: Arc<ScopeRepository>,
    pub tags: Arc<TagRepository>,
    pub relations: Arc<RelationRepository>,
    pub file_locks: Arc<FileLockRepository>,
    pub conflicts: Arc<ConflictRepository>,
    pub grants: Arc<GrantRepository>,
    pub votes: Arc<VoteRepository>,
    pub embeddings: Arc<EmbeddingRepository>,
    pub audit_repo: Arc<AuditRepository>,
    pub audit: Arc<AuditService>,
    pub permissions: Arc<PermissionService>,
    pub verification: Arc<VerificationService>,
    pub engine: Arc<QueryEngine>,
    pub runtime: Arc<Runtime>,
    /// Keeps the query cache subscribed for the context's lifetime.
    _cache_subscription: SubscriptionGuard,
}

/// Build the full context from validated configuration: adapters from
/// config, migrations, repositories, services, pipeline.
pub async fn build_app_context(config: EngramConfig) -> EngramResult<Arc<AppContext>> {
    let storage: Arc<dyn StorageAdapter> = match &config.storage {
        StorageBackendConfig::Sqlite { path } => Arc::new(SqliteAdapter::new(path)),
        StorageBackendConfig::Postgres {
            host,
            port,
            dbname,
            user,
            password,
            pool_size,
        } => Arc::new(PostgresAdapter::new(&PgConfig {
            host: host.clone(),
            port: *port,
            dbname: dbname.clone(),
            user: user.clone(),
            password: password.clone(),
            pool_size: *pool_size,
        })?),
    };
    storage.connect().await?;
    run_migrations(storage.as_ref(), Some(&config.data_dir)).await?;

    let events = InProcessEventBus::new(1024);
    let deps = DbDeps::new(storage.clone(), events.clone(), config.txn_retry);

    // Embedding path: provider, vector store, worker pool. The null sink
    // keeps the whole path dark when disabled.
    let (embedding_sink, embedding_pool, vectors, embedder): (
        Arc<dyn EmbeddingSink>,
        Option<Arc<EmbeddingWorkerPool>>,
        Option<Arc<dyn VectorStore>>,
        Option<Arc<dyn EmbeddingProvider>>,
    ) = match config.embedding.provider {
        EmbeddingProviderKind::Disabled => (Arc::new(NullEmbeddingSink), None, None, None),
        kind => {
            let provider: Arc<dyn EmbeddingProvider> = match kind {
                EmbeddingProviderKind::Stub => {
                    Arc::new(StubEmbeddingProvider::new(config.embedding.dimension))
                }
                _ => Arc::new(HttpEmbeddingProvider::new(&config.embedding)),
            };
            let store: Arc<dyn VectorStore> =
                Arc::new(FileVectorStore::open(&config.data_dir.join("vectors"))?);
            let pool = EmbeddingWorkerPool::start(
                config.embedding.clone(),
                provider.clone(),
                storage.clone(),
                EmbeddingRepository::new(deps.clone()),
                store.clone(),
            );
            (pool.clone() as Arc<dyn EmbeddingSink>, Some(pool), Some(store), Some(provider))
        }
    };

    let stats_cache: Arc<dyn CacheAdapter> = match &config.cache {
        CacheBackendConfig::Memory => Arc::new(MemoryCache::new(4096, 4 << 20)),
        CacheBackendConfig::Redis { url } => Arc::new(RedisCache::connect(url, "engram").await?),
    };

    let entries = Arc::new(EntryRepository::new(deps.clone(), embedding_sink));
    let runtime = Arc::new(Runtime {
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
        query_cache: Arc::new(QueryCache::new(config.query_cache)),
        stats_cache,
        resource_locks: Arc::new(InProcessLockTable::new()),
        events: events.clone(),
        embedding_pool,
        started_at: Instant::now(),
    });

    wire_shared(&config, deps, entries, runtime, vectors, embedder)
}

/// Shared wiring used by every backend path: security, query cache
/// subscription, services. Backend choice never branches here.
fn wire_shared(
    config: &EngramConfig,
    deps: DbDeps,
    entries: Arc<EntryRepository>,
    runtime: Arc<Runtime>,
    vectors: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> EngramResult<Arc<AppContext>> {
    let cache_subscription = wire_query_cache(&runtime.query_cache, runtime.events.as_ref());

    let grants = Arc::new(GrantRepository::new(deps.clone()));
    let permissions = Arc::new(PermissionService::new(
        GrantRepository::new(deps.clone()),
        &config.environment,
        runtime.events.as_ref(),
    ));
    let verification = Arc::new(VerificationService::new(entries.clone()));
    let audit_repo = Arc::new(AuditRepository::new(deps.clone()));
    let audit = Arc::new(AuditService::new(AuditRepository::new(deps.clone())));

    let tags = Arc::new(TagRepository::new(deps.clone()));
    let relations = Arc::new(RelationRepository::new(deps.clone()));
    let conflicts = Arc::new(ConflictRepository::new(deps.clone()));

    let engine = Arc::new(QueryEngine::new(QueryDeps {
        entries: entries.clone(),
        tags: tags.clone(),
        relations: relations.clone(),
        conflicts: conflicts.clone(),
        storage: deps.storage.clone(),
        cache: runtime.query_cache.clone(),
        cursors: CursorCodec::new(&config.cursor_secret)?,
        vectors,
        embedder,
    }));

    Ok(Arc::new(AppContext {
        config: config.clone(),
        storage: deps.storage.clone(),
        entries,
        scopes: Arc::new(ScopeRepository::new(deps.clone())),
        tags,
        relations,
        file_locks: Arc::new(FileLockRepository::new(deps.clone())),
        conflicts,
        grants,
        votes: Arc::new(VoteRepository::new(deps.clone())),
        embeddings: Arc::new(EmbeddingRepository::new(deps.clone())),
        audit_repo,
        audit,
        permissions,
        verification,
        engine,
        runtime,
        _cache_subscription: cache_subscription,
    }))
}

impl AppContext {
    /// Aggregate health for the `health` tool and HTTP endpoint.
    pub async fn health(&self) -> HealthStatus {
        let storage_ok = self.storage.health().await.is_ok();
        let cache_ok = self
            .runtime
            .stats_cache
            .set(
                "health:probe",
                b"ok".to_vec(),
                Some(std::time::Duration::from_secs(5)),
            )
            .await
            .is_ok();
        HealthStatus {
            healthy: HealthStatus::evaluate(storage_ok, cache_ok),
            storage_ok,
            cache_ok,
            embedding_enabled: self.runtime.embedding_pool.is_some(),
            embedding_queue_depth: self
                .runtime
                .embedding_pool
                .as_ref()
                .map(|p| p.depth())
                .unwrap_or(0),
            uptime_secs: self.runtime.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Spawn the periodic maintenance task: expired-lock sweep and audit
/// retention. Runs hourly; the handle is aborted at shutdown.
pub fn spawn_maintenance(ctx: &Arc<AppContext>) -> tokio::task::JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match ctx.file_locks.cleanup_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "swept expired file locks"),
                Err(e) => tracing::warn!(error = %e, "lock sweep failed"),
            }
            let removed = ctx.audit.cleanup(ctx.config.audit_retention_days).await;
            if removed > 0 {
                tracing::info!(removed, "trimmed audit history");
            }
        }
    })
}

/// Graceful shutdown: drain the embedding queue, detach listeners, stop
/// the bus, then close the pool.
pub async fn shutdown(ctx: &AppContext) {
    if let Some(pool) = &ctx.runtime.embedding_pool {
        pool.shutdown().await;
    }
    ctx.runtime.events.shutdown();
    if let Err(e) = ctx.storage.close().await {
        tracing::warn!(error = %e, "storage close failed during shutdown");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use engram_core::{
        EmbeddingConfig, QueryCacheConfig, RateClass, RateLimitConfig, TxnRetryConfig,
    };
    use std::time::Duration;

    pub(crate) fn test_config(dir: &std::path::Path) -> EngramConfig {
        EngramConfig {
            data_dir: dir.to_path_buf(),
            storage: StorageBackendConfig::Sqlite {
                path: dir.join("engram.db"),
            },
            cache: CacheBackendConfig::Memory,
            environment: "development".into(),
            cursor_secret: "test-secret".into(),
            embedding: EmbeddingConfig {
                provider: EmbeddingProviderKind::Disabled,
                model: "stub".into(),
                api_key: String::new(),
                url: String::new(),
                dimension: 8,
                timeout: Duration::from_secs(2),
                max_attempts: 2,
                queue_capacity: 16,
                workers: 1,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                read: RateClass { per_minute: 120, burst: 10 },
                write: RateClass { per_minute: 60, burst: 10 },
                query: RateClass { per_minute: 120, burst: 10 },
                admin: RateClass { per_minute: 30, burst: 10 },
            },
            txn_retry: TxnRetryConfig {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
            },
            query_cache: QueryCacheConfig {
                max_bytes: 1 << 20,
                ttl: Duration::from_secs(60),
            },
            audit_retention_days: 30,
            http_bind: "127.0.0.1:0".into(),
        }
    }

    #[tokio::test]
    async fn test_build_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = build_app_context(test_config(dir.path())).await.unwrap();
        let health = ctx.health().await;
        assert!(health.healthy);
        assert!(!health.embedding_enabled);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_embedding_enabled_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.embedding.provider = EmbeddingProviderKind::Stub;
        let ctx = build_app_context(config).await.unwrap();
        assert!(ctx.runtime.embedding_pool.is_some());
        let health = ctx.health().await;
        assert!(health.embedding_enabled);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_container_reset() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = build_app_context(test_config(dir.path())).await.unwrap();
        let container = Container::new();
        container.install(ctx.runtime.clone());
        assert!(container.runtime().is_some());
        container.reset();
        assert!(container.runtime().is_none());
    }
}
