//! Embedding vectors and semantic-path tracking types

use crate::{ContentFingerprint, EntryId, EntryKind, Timestamp, VersionId};
use serde::{Deserialize, Serialize};

// ============================================================================
// VECTORS
// ============================================================================

/// A dense embedding vector with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub data: Vec<f32>,
    pub model: String,
}

impl EmbeddingVector {
    pub fn new(data: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            data,
            model: model.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Cosine similarity in [-1, 1]. Errors on dimension mismatch or a
    /// zero-magnitude operand.
    pub fn cosine_similarity(&self, other: &EmbeddingVector) -> Result<f32, String> {
        if self.data.len() != other.data.len() {
            return Err(format!(
                "dimension mismatch: {} vs {}",
                self.data.len(),
                other.data.len()
            ));
        }
        let dot: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();
        let norm_a: f32 = self.data.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = other.data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return Err("zero-magnitude vector".to_string());
        }
        Ok(dot / (norm_a * norm_b))
    }
}

// ============================================================================
// TRACKING
// ============================================================================

/// Row recording that a vector exists in the vector store for a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub version_id: VersionId,
    pub provider: String,
    pub model: String,
    pub dimension: i32,
    pub stored_at: Timestamp,
}

/// Job enqueued after every successful create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub version_id: VersionId,
    pub text_fingerprint: ContentFingerprint,
}

/// Retry-queue bookkeeping for a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRetryState {
    pub entry_kind: EntryKind,
    pub entry_id: EntryId,
    pub attempt: u32,
    pub next_attempt_at: Timestamp,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = EmbeddingVector::new(vec![1.0, 0.0, 0.0], "stub");
        let b = EmbeddingVector::new(vec![0.0, 1.0, 0.0], "stub");
        let c = EmbeddingVector::new(vec![1.0, 0.0, 0.0], "stub");

        assert!((a.cosine_similarity(&c).unwrap() - 1.0).abs() < 1e-6);
        assert!(a.cosine_similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_errors() {
        let a = EmbeddingVector::new(vec![1.0, 0.0], "stub");
        let b = EmbeddingVector::new(vec![1.0, 0.0, 0.0], "stub");
        assert!(a.cosine_similarity(&b).is_err());

        let zero = EmbeddingVector::new(vec![0.0, 0.0], "stub");
        assert!(a.cosine_similarity(&zero).is_err());
    }
}
