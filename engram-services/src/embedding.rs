//! Embedding path
//!
//! Repositories enqueue a job after every successful create/update. A
//! small worker pool drains the bounded queue: extract text, call the
//! provider under a timeout, write the vector and a tracking row. Failures
//! classified as retryable back off exponentially up to a maximum attempt
//! count; stale jobs whose version is no longer the head are skipped. The
//! whole path is optional: with the null sink nothing ever runs.

use crate::vector::VectorStore;
use async_trait::async_trait;
use dashmap::DashMap;
use engram_adapters::{SqlValue, StorageAdapter};
use engram_core::{
    content_fingerprint, EmbeddingConfig, EmbeddingError, EmbeddingJob, EmbeddingRecord,
    EmbeddingRetryState, EmbeddingVector, EngramError, EngramResult, EntryId, EntryKind,
    EntryPayload, IdType, NetworkError, SystemError, VersionId,
};
use engram_repos::{EmbeddingRepository, EmbeddingSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

// ============================================================================
// PROVIDERS
// ============================================================================

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> EngramResult<EmbeddingVector>;
}

/// Deterministic provider: a normalized byte histogram. Used by tests and
/// by deployments that want semantic scoring without an external service.
#[derive(Debug, Clone)]
pub struct StubEmbeddingProvider {
    dimension: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "stub-histogram-v1"
    }

    async fn embed(&self, text: &str) -> EngramResult<EmbeddingVector> {
        let mut data = vec![0.0f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            data[i % self.dimension] += byte as f32 / 255.0;
        }
        let norm: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut data {
                *x /= norm;
            }
        }
        Ok(EmbeddingVector::new(data, self.model()))
    }
}

/// HTTP provider. Posts `{"model": ..., "input": ...}` and expects
/// `{"embedding": [...]}` back.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> EngramResult<EmbeddingVector> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| {
                EngramError::from(NetworkError::Transport {
                    reason: e.to_string(),
                })
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(EmbeddingError::RateLimited { retry_after_ms }.into());
        }
        if !status.is_success() {
            return Err(EmbeddingError::RequestFailed {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            }
            .into());
        }

        #[derive(serde::Deserialize)]
        struct EmbedResponse {
            embedding: Vec<f32>,
        }
        let body: EmbedResponse = response.json().await.map_err(|e| {
            EngramError::from(EmbeddingError::RequestFailed {
                status: status.as_u16(),
                message: format!("malformed response: {e}"),
            })
        })?;
        if body.embedding.len() != self.dimension {
            return Err(EmbeddingError::RequestFailed {
                status: status.as_u16(),
                message: format!(
                    "dimension {} does not match configured {}",
                    body.embedding.len(),
                    self.dimension
                ),
            }
            .into());
        }
        Ok(EmbeddingVector::new(body.embedding, self.model.clone()))
    }
}

// ============================================================================
// WORKER POOL
// ============================================================================

/// Transport failures, 5xx, 429, and timeouts retry; everything else is
/// terminal.
fn is_retryable(err: &EngramError) -> bool {
    match err {
        EngramError::Embedding(EmbeddingError::RequestFailed { status, .. }) => *status >= 500,
        EngramError::Embedding(EmbeddingError::RateLimited { .. }) => true,
        EngramError::Network(_) => true,
        EngramError::System(SystemError::Timeout { .. }) => true,
        _ => false,
    }
}

fn retry_delay(err: &EngramError, attempt: u32) -> Duration {
    // 429 with a provided delay wins; otherwise exponential backoff.
    if let EngramError::Embedding(EmbeddingError::RateLimited {
        retry_after_ms: Some(ms),
    }) = err
    {
        return Duration::from_millis(*ms);
    }
    let exp = Duration::from_millis(500).saturating_mul(1u32 << attempt.min(7));
    exp.min(Duration::from_secs(60))
}

/// The queue plus its workers.
pub struct EmbeddingWorkerPool {
    tx: std::sync::Mutex<Option<mpsc::Sender<EmbeddingJob>>>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    capacity: usize,
    rejected: AtomicU64,
    processed: AtomicU64,
    inner: Arc<WorkerShared>,
}

struct WorkerShared {
    config: EmbeddingConfig,
    provider: Arc<dyn EmbeddingProvider>,
    storage: Arc<dyn StorageAdapter>,
    records: EmbeddingRepository,
    vectors: Arc<dyn VectorStore>,
    retries: DashMap<EntryId, EmbeddingRetryState>,
    resubmit: std::sync::Mutex<Option<mpsc::Sender<EmbeddingJob>>>,
}

impl EmbeddingWorkerPool {
    pub fn start(
        config: EmbeddingConfig,
        provider: Arc<dyn EmbeddingProvider>,
        storage: Arc<dyn StorageAdapter>,
        records: EmbeddingRepository,
        vectors: Arc<dyn VectorStore>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<EmbeddingJob>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let inner = Arc::new(WorkerShared {
            config: config.clone(),
            provider,
            storage,
            records,
            vectors,
            retries: DashMap::new(),
            resubmit: std::sync::Mutex::new(Some(tx.clone())),
        });

        let pool = Arc::new(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(Vec::new()),
            capacity: config.queue_capacity.max(1),
            rejected: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            inner: Arc::clone(&inner),
        });

        let mut workers = pool.workers.lock().expect("workers lock");
        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let inner = Arc::clone(&inner);
            let pool_ref = Arc::downgrade(&pool);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let outcome = process_job(&inner, job).await;
                    if let Some(pool) = pool_ref.upgrade() {
                        pool.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Err(e) = outcome {
                        tracing::debug!(worker_id, error = %e, "embedding job ended with error");
                    }
                }
            }));
        }
        drop(workers);
        pool
    }

    /// Jobs currently waiting in the queue.
    pub fn depth(&self) -> usize {
        let tx = self.tx.lock().expect("tx lock");
        match tx.as_ref() {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for workers to drain. Idempotent.
    pub async fn shutdown(&self) {
        self.tx.lock().expect("tx lock").take();
        self.inner.resubmit.lock().expect("resubmit lock").take();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().expect("workers lock");
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl EmbeddingSink for EmbeddingWorkerPool {
    fn enqueue(&self, job: EmbeddingJob) {
        let tx = self.tx.lock().expect("tx lock");
        let Some(tx) = tx.as_ref() else {
            return;
        };
        // High-water mark: reject instead of blocking the mutation path.
        if tx.try_send(job).is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("embedding queue full; job deferred to the next reindex");
        }
    }
}

async fn process_job(shared: &WorkerShared, job: EmbeddingJob) -> EngramResult<()> {
    // Stale jobs: the entry is gone, the head moved on, or the text
    // changed under the same head.
    let rows = shared
        .storage
        .execute(
            "SELECT name, head_version_id, payload FROM entries WHERE entry_id = $1",
            &[SqlValue::from(job.entry_id.as_uuid())],
        )
        .await?;
    let Some(row) = rows.first() else {
        return Err(EmbeddingError::StaleVersion.into());
    };
    let head_version = VersionId::from_uuid(row.uuid("head_version_id")?);
    if head_version != job.version_id {
        return Err(EmbeddingError::StaleVersion.into());
    }
    let name = row.text("name")?;
    let payload: EntryPayload = serde_json::from_str(&row.text("payload")?).map_err(|e| {
        EngramError::internal(format!("entry payload decode: {e}"))
    })?;
    let text = payload.search_text(&name);
    if content_fingerprint(&text) != job.text_fingerprint {
        return Err(EmbeddingError::StaleVersion.into());
    }

    // The timeout wrapper drops the in-flight call with the scope, so no
    // timer or request outlives the job.
    let result = tokio::time::timeout(shared.config.timeout, shared.provider.embed(&text))
        .await
        .map_err(|_| {
            EngramError::from(SystemError::Timeout {
                operation: "embedding".into(),
            })
        })
        .and_then(|inner| inner);

    match result {
        Ok(vector) => {
            shared
                .vectors
                .upsert(job.entry_kind, job.entry_id, vector.clone())
                .await?;
            shared
                .records
                .record_stored(&EmbeddingRecord {
                    entry_kind: job.entry_kind,
                    entry_id: job.entry_id,
                    version_id: job.version_id,
                    provider: shared.provider.name().to_string(),
                    model: shared.provider.model().to_string(),
                    dimension: vector.dimension() as i32,
                    stored_at: chrono::Utc::now(),
                })
                .await?;
            shared.retries.remove(&job.entry_id);
            Ok(())
        }
        Err(err) => handle_failure(shared, job, err).await,
    }
}

async fn handle_failure(
    shared: &WorkerShared,
    job: EmbeddingJob,
    err: EngramError,
) -> EngramResult<()> {
    let attempt = shared
        .retries
        .get(&job.entry_id)
        .map(|s| s.attempt)
        .unwrap_or(0);

    let terminal = !is_retryable(&err) || attempt + 1 >= shared.config.max_attempts;
    if terminal {
        shared.retries.remove(&job.entry_id);
        tracing::warn!(
            entry_id = %job.entry_id,
            attempts = attempt + 1,
            error = %err,
            "embedding permanently failed"
        );
        shared
            .records
            .record_failed(
                job.entry_kind,
                job.entry_id,
                job.version_id,
                shared.provider.name(),
                shared.provider.model(),
            )
            .await?;
        return Err(EmbeddingError::Exhausted {
            attempts: attempt + 1,
            reason: err.to_string(),
        }
        .into());
    }

    let delay = retry_delay(&err, attempt);
    let next_attempt = attempt + 1;
    // Bounded retry book-keeping: the map never outgrows the queue.
    if shared.retries.len() < shared.config.queue_capacity {
        shared.retries.insert(
            job.entry_id,
            EmbeddingRetryState {
                entry_kind: job.entry_kind,
                entry_id: job.entry_id,
                attempt: next_attempt,
                next_attempt_at: chrono::Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_default(),
                last_error: err.to_string(),
            },
        );
    }

    let resubmit = shared
        .resubmit
        .lock()
        .expect("resubmit lock")
        .clone();
    if let Some(tx) = resubmit {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(job).await;
        });
    }
    Ok(())
}

// ============================================================================
// REINDEX
// ============================================================================

/// Options for the `reindex` CLI command.
#[derive(Debug, Clone)]
pub struct ReindexOptions {
    pub kinds: Vec<EntryKind>,
    pub batch_size: u32,
    pub delay: Duration,
    /// Re-embed even entries whose head version already has a vector.
    pub force: bool,
    /// Only reopen entries whose last attempt failed.
    pub retry_failed: bool,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            kinds: EntryKind::ALL.to_vec(),
            batch_size: 50,
            delay: Duration::from_millis(100),
            force: false,
            retry_failed: false,
        }
    }
}

/// Reindex outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexReport {
    pub scanned: u64,
    pub enqueued: u64,
    pub skipped: u64,
}

/// Walk entries in batches and enqueue embedding jobs per the options.
pub async fn reindex(
    options: &ReindexOptions,
    storage: &dyn StorageAdapter,
    records: &EmbeddingRepository,
    sink: &dyn EmbeddingSink,
) -> EngramResult<ReindexReport> {
    let mut report = ReindexReport::default();

    if options.retry_failed {
        let failed = records.list_failed(10_000).await?;
        for (kind, entry_id) in failed {
            if !options.kinds.contains(&kind) {
                continue;
            }
            if let Some(job) = job_for_head(storage, entry_id).await? {
                sink.enqueue(job);
                report.enqueued += 1;
            }
            report.scanned += 1;
        }
        return Ok(report);
    }

    for kind in &options.kinds {
        let mut offset: i64 = 0;
        loop {
            let rows = storage
                .execute(
                    "SELECT entry_id FROM entries
                     WHERE kind = $1 AND active = 1
                     ORDER BY entry_id LIMIT $2 OFFSET $3",
                    &[
                        SqlValue::from(kind.as_str()),
                        SqlValue::from(options.batch_size),
                        SqlValue::Integer(offset),
                    ],
                )
                .await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                report.scanned += 1;
                let entry_id = EntryId::from_uuid(row.uuid("entry_id")?);
                let Some(job) = job_for_head(storage, entry_id).await? else {
                    report.skipped += 1;
                    continue;
                };
                if !options.force {
                    if let Some(record) = records.get(*kind, entry_id).await? {
                        if record.version_id == job.version_id {
                            report.skipped += 1;
                            continue;
                        }
                    }
                }
                sink.enqueue(job);
                report.enqueued += 1;
            }
            offset += rows.len() as i64;
            if !options.delay.is_zero() {
                tokio::time::sleep(options.delay).await;
            }
        }
    }
    Ok(report)
}

async fn job_for_head(
    storage: &dyn StorageAdapter,
    entry_id: EntryId,
) -> EngramResult<Option<EmbeddingJob>> {
    let rows = storage
        .execute(
            "SELECT kind, name, head_version_id, payload FROM entries WHERE entry_id = $1",
            &[SqlValue::from(entry_id.as_uuid())],
        )
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let kind: EntryKind = row
        .text("kind")?
        .parse()
        .map_err(|reason: String| EngramError::internal(reason))?;
    let payload: EntryPayload = serde_json::from_str(&row.text("payload")?)
        .map_err(|e| EngramError::internal(format!("payload decode: {e}")))?;
    let text = payload.search_text(&row.text("name")?);
    Ok(Some(EmbeddingJob {
        entry_kind: kind,
        entry_id,
        version_id: VersionId::from_uuid(row.uuid("head_version_id")?),
        text_fingerprint: content_fingerprint(&text),
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryVectorStore;
    use engram_adapters::{InProcessEventBus, SqliteAdapter};
    use engram_core::{
        EmbeddingProviderKind, KnowledgePayload, ScopeRef, TxnRetryConfig,
    };
    use engram_repos::{run_migrations, DbDeps, EntryRepository, NewEntry, NullEmbeddingSink};

    fn test_config(workers: usize, capacity: usize, max_attempts: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProviderKind::Stub,
            model: "stub-histogram-v1".into(),
            api_key: String::new(),
            url: String::new(),
            dimension: 8,
            timeout: Duration::from_secs(2),
            max_attempts,
            queue_capacity: capacity,
            workers,
        }
    }

    async fn fixture() -> (DbDeps, EntryRepository) {
        let storage = Arc::new(SqliteAdapter::in_memory());
        storage.connect().await.unwrap();
        run_migrations(storage.as_ref(), None).await.unwrap();
        let deps = DbDeps::new(
            storage,
            InProcessEventBus::new(64),
            TxnRetryConfig {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
            },
        );
        let entries = EntryRepository::new(deps.clone(), Arc::new(NullEmbeddingSink));
        (deps, entries)
    }

    fn knowledge(name: &str, content: &str) -> NewEntry {
        NewEntry {
            name: name.into(),
            category: None,
            scope: ScopeRef::global(),
            payload: EntryPayload::Knowledge(KnowledgePayload {
                content: content.into(),
                source: None,
                confidence: 0.8,
                valid_from: None,
                valid_until: None,
            }),
            tags: vec![],
            created_by: engram_core::AgentId::new("tester").unwrap(),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn test_stub_provider_is_deterministic_and_normalized() {
        let provider = StubEmbeddingProvider::new(8);
        let a = provider.embed("authentication").await.unwrap();
        let b = provider.embed("authentication").await.unwrap();
        let c = provider.embed("parsing").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.data.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_job_flows_to_vector_store_and_tracking() {
        let (deps, entries) = fixture().await;
        let entry = entries
            .create(knowledge("jwt-guideline", "rotate signing keys"))
            .await
            .unwrap();

        let vectors: Arc<InMemoryVectorStore> = Arc::new(InMemoryVectorStore::new());
        let pool = EmbeddingWorkerPool::start(
            test_config(2, 16, 3),
            Arc::new(StubEmbeddingProvider::new(8)),
            deps.storage.clone(),
            EmbeddingRepository::new(deps.clone()),
            vectors.clone(),
        );

        let job = job_for_head(deps.storage.as_ref(), entry.entry_id)
            .await
            .unwrap()
            .unwrap();
        pool.enqueue(job);
        pool.shutdown().await;

        assert_eq!(vectors.len().await.unwrap(), 1);
        let record = EmbeddingRepository::new(deps.clone())
            .get(EntryKind::Knowledge, entry.entry_id)
            .await
            .unwrap()
            .expect("tracking row");
        assert_eq!(record.version_id, entry.head_version_id);
        assert_eq!(record.provider, "stub");
    }

    #[tokio::test]
    async fn test_stale_job_is_skipped() {
        let (deps, entries) = fixture().await;
        let entry = entries
            .create(knowledge("doc", "first text"))
            .await
            .unwrap();
        let stale_job = job_for_head(deps.storage.as_ref(), entry.entry_id)
            .await
            .unwrap()
            .unwrap();

        // Advance the head before the job runs.
        entries
            .update(
                entry.entry_id,
                engram_core::EntryPatch {
                    payload: Some(EntryPayload::Knowledge(KnowledgePayload {
                        content: "second text".into(),
                        source: None,
                        confidence: 0.8,
                        valid_from: None,
                        valid_until: None,
                    })),
                    ..Default::default()
                },
                "edit",
                &engram_core::AgentId::new("tester").unwrap(),
                None,
            )
            .await
            .unwrap();

        let vectors: Arc<InMemoryVectorStore> = Arc::new(InMemoryVectorStore::new());
        let pool = EmbeddingWorkerPool::start(
            test_config(1, 16, 3),
            Arc::new(StubEmbeddingProvider::new(8)),
            deps.storage.clone(),
            EmbeddingRepository::new(deps.clone()),
            vectors.clone(),
        );
        pool.enqueue(stale_job);
        pool.shutdown().await;

        assert_eq!(vectors.len().await.unwrap(), 0);
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn model(&self) -> &str {
            "failing-v1"
        }

        async fn embed(&self, _text: &str) -> EngramResult<EmbeddingVector> {
            Err(EmbeddingError::RequestFailed {
                status: 503,
                message: "unavailable".into(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_retries_then_marks_failed() {
        let (deps, entries) = fixture().await;
        let entry = entries.create(knowledge("flaky", "text")).await.unwrap();

        let mut config = test_config(1, 16, 2);
        config.timeout = Duration::from_millis(500);
        let vectors: Arc<InMemoryVectorStore> = Arc::new(InMemoryVectorStore::new());
        let pool = EmbeddingWorkerPool::start(
            config,
            Arc::new(FailingProvider),
            deps.storage.clone(),
            EmbeddingRepository::new(deps.clone()),
            vectors.clone(),
        );

        let job = job_for_head(deps.storage.as_ref(), entry.entry_id)
            .await
            .unwrap()
            .unwrap();
        pool.enqueue(job);

        // First attempt fails and schedules a retry (~500ms); the second
        // attempt exhausts max_attempts and marks the entry failed.
        let records = EmbeddingRepository::new(deps.clone());
        let mut failed = Vec::new();
        for _ in 0..80 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            failed = records.list_failed(10).await.unwrap();
            if !failed.is_empty() {
                break;
            }
        }
        pool.shutdown().await;
        assert_eq!(failed, vec![(EntryKind::Knowledge, entry.entry_id)]);
        assert_eq!(vectors.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reindex_retry_failed_reopens_only_failed() {
        let (deps, entries) = fixture().await;
        let ok_entry = entries.create(knowledge("ok", "text a")).await.unwrap();
        let bad_entry = entries.create(knowledge("bad", "text b")).await.unwrap();

        let records = EmbeddingRepository::new(deps.clone());
        records
            .record_stored(&EmbeddingRecord {
                entry_kind: EntryKind::Knowledge,
                entry_id: ok_entry.entry_id,
                version_id: ok_entry.head_version_id,
                provider: "stub".into(),
                model: "stub-histogram-v1".into(),
                dimension: 8,
                stored_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        records
            .record_failed(
                EntryKind::Knowledge,
                bad_entry.entry_id,
                bad_entry.head_version_id,
                "stub",
                "stub-histogram-v1",
            )
            .await
            .unwrap();

        struct Collector(std::sync::Mutex<Vec<EntryId>>);
        impl EmbeddingSink for Collector {
            fn enqueue(&self, job: EmbeddingJob) {
                self.0.lock().unwrap().push(job.entry_id);
            }
        }
        let sink = Collector(std::sync::Mutex::new(Vec::new()));

        let options = ReindexOptions {
            retry_failed: true,
            delay: Duration::ZERO,
            ..Default::default()
        };
        let report = reindex(&options, deps.storage.as_ref(), &records, &sink)
            .await
            .unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(*sink.0.lock().unwrap(), vec![bad_entry.entry_id]);
    }
}
