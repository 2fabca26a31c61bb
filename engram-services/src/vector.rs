//! Vector store
//!
//! Stores one vector per entry and answers cosine top-k queries. The
//! in-memory store backs tests and the disabled path; the file store
//! persists vectors as JSON under the data directory.

use async_trait::async_trait;
use dashmap::DashMap;
use engram_core::{
    EmbeddingVector, EngramResult, EntryId, EntryKind, SystemError, VectorStoreError,
};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Narrow interface over vector persistence and similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        vector: EmbeddingVector,
    ) -> EngramResult<()>;

    async fn remove(&self, kind: EntryKind, entry_id: EntryId) -> EngramResult<bool>;

    async fn get(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
    ) -> EngramResult<Option<EmbeddingVector>>;

    /// Cosine top-k across all stored vectors, best first.
    async fn search(
        &self,
        query: &EmbeddingVector,
        limit: usize,
    ) -> EngramResult<Vec<(EntryKind, EntryId, f32)>>;

    async fn len(&self) -> EngramResult<usize>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Concurrent in-memory store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: DashMap<(EntryKind, EntryId), EmbeddingVector>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_vector(vector: &EmbeddingVector) -> EngramResult<()> {
    if vector.data.is_empty() {
        return Err(VectorStoreError::InvalidVector {
            reason: "empty vector".into(),
        }
        .into());
    }
    if vector.data.iter().any(|v| !v.is_finite()) {
        return Err(VectorStoreError::InvalidVector {
            reason: "non-finite component".into(),
        }
        .into());
    }
    Ok(())
}

fn top_k(
    vectors: &DashMap<(EntryKind, EntryId), EmbeddingVector>,
    query: &EmbeddingVector,
    limit: usize,
) -> Vec<(EntryKind, EntryId, f32)> {
    let mut scored: Vec<(EntryKind, EntryId, f32)> = vectors
        .iter()
        .filter_map(|entry| {
            let ((kind, id), vector) = (entry.key(), entry.value());
            vector
                .cosine_similarity(query)
                .ok()
                .map(|sim| (*kind, *id, sim))
        })
        .collect();
    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        vector: EmbeddingVector,
    ) -> EngramResult<()> {
        validate_vector(&vector)?;
        self.vectors.insert((kind, entry_id), vector);
        Ok(())
    }

    async fn remove(&self, kind: EntryKind, entry_id: EntryId) -> EngramResult<bool> {
        Ok(self.vectors.remove(&(kind, entry_id)).is_some())
    }

    async fn get(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
    ) -> EngramResult<Option<EmbeddingVector>> {
        Ok(self.vectors.get(&(kind, entry_id)).map(|v| v.clone()))
    }

    async fn search(
        &self,
        query: &EmbeddingVector,
        limit: usize,
    ) -> EngramResult<Vec<(EntryKind, EntryId, f32)>> {
        validate_vector(query)?;
        Ok(top_k(&self.vectors, query, limit))
    }

    async fn len(&self) -> EngramResult<usize> {
        Ok(self.vectors.len())
    }
}

// ============================================================================
// FILE-BACKED STORE
// ============================================================================

/// File-backed store: in-memory index with a JSON snapshot per mutation.
/// Fine for the single-writer deployments this store serves.
pub struct FileVectorStore {
    inner: InMemoryVectorStore,
    path: PathBuf,
    flush: Mutex<()>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredVector {
    kind: EntryKind,
    entry_id: EntryId,
    vector: EmbeddingVector,
}

impl FileVectorStore {
    /// Open (or create) the store under a directory.
    pub fn open(dir: &Path) -> EngramResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| SystemError::Io {
            reason: format!("create {}: {e}", dir.display()),
        })?;
        let path = dir.join("vectors.json");
        let inner = InMemoryVectorStore::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| SystemError::Io {
                reason: format!("read {}: {e}", path.display()),
            })?;
            let stored: Vec<StoredVector> = serde_json::from_str(&raw).unwrap_or_default();
            for item in stored {
                inner.vectors.insert((item.kind, item.entry_id), item.vector);
            }
        }
        Ok(Self {
            inner,
            path,
            flush: Mutex::new(()),
        })
    }

    async fn persist(&self) -> EngramResult<()> {
        let _guard = self.flush.lock().await;
        let snapshot: Vec<StoredVector> = self
            .inner
            .vectors
            .iter()
            .map(|entry| StoredVector {
                kind: entry.key().0,
                entry_id: entry.key().1,
                vector: entry.value().clone(),
            })
            .collect();
        let serialized = serde_json::to_string(&snapshot)
            .map_err(|e| engram_core::EngramError::internal(format!("serialize vectors: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized).map_err(|e| SystemError::Io {
            reason: format!("write {}: {e}", tmp.display()),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            SystemError::Io {
                reason: format!("rename {}: {e}", self.path.display()),
            }
            .into()
        })
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn upsert(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
        vector: EmbeddingVector,
    ) -> EngramResult<()> {
        self.inner.upsert(kind, entry_id, vector).await?;
        self.persist().await
    }

    async fn remove(&self, kind: EntryKind, entry_id: EntryId) -> EngramResult<bool> {
        let removed = self.inner.remove(kind, entry_id).await?;
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn get(
        &self,
        kind: EntryKind,
        entry_id: EntryId,
    ) -> EngramResult<Option<EmbeddingVector>> {
        self.inner.get(kind, entry_id).await
    }

    async fn search(
        &self,
        query: &EmbeddingVector,
        limit: usize,
    ) -> EngramResult<Vec<(EntryKind, EntryId, f32)>> {
        self.inner.search(query, limit).await
    }

    async fn len(&self) -> EngramResult<usize> {
        self.inner.len().await
    }
}

// ============================================================================
// TESTS
// ============================================================================
