//! Relevance scoring and deterministic tie-breaking

use engram_core::{Entry, EntryId, Timestamp};
use std::cmp::Ordering;

/// Inputs to the final score for one entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
    /// Fraction of requested tags the entry carries, in [0, 1].
    pub tag_match: f64,
    /// Scope-specificity weight from the chain, in (0, 1].
    pub scope_specificity: f64,
    /// Guideline priority (0 for other kinds).
    pub priority: i32,
    /// Lexical match strength from the fts stage, in [0, 1].
    pub lexical: f64,
    /// Recency weight, in (0, 1].
    pub recency: f64,
    /// Cosine similarity when the semantic path contributed.
    pub semantic: Option<f64>,
}

/// Sum of the maxima of the five additive components; used to normalize
/// the lexical score into [0, 1] for the hybrid formula.
const ADDITIVE_CEILING: f64 = 5.0;

/// Final relevance score.
///
/// With a semantic similarity available:
/// `0.7 × sim + 0.3 × normalize(additive)`; otherwise the additive sum
/// `tag_match + scope_specificity + priority/100 + lexical + recency`.
pub fn final_score(inputs: &ScoreInputs) -> f64 {
    let additive = inputs.tag_match
        + inputs.scope_specificity
        + f64::from(inputs.priority) / 100.0
        + inputs.lexical
        + inputs.recency;
    match inputs.semantic {
        Some(sim) => 0.7 * sim + 0.3 * (additive / ADDITIVE_CEILING).clamp(0.0, 1.0),
        None => additive,
    }
}

/// Recency weight with a 30-day half life.
pub fn recency_weight(updated_at: Timestamp, now: Timestamp) -> f64 {
    let days = (now - updated_at).num_seconds().max(0) as f64 / 86_400.0;
    0.5f64.powf(days / 30.0)
}

/// Deterministic ranking: score descending, then scope specificity, then
/// priority, then most recent update, then stable id order.
pub fn rank_order(
    a: &Entry,
    b: &Entry,
    score_of: impl Fn(EntryId) -> f64,
    specificity_of: impl Fn(&Entry) -> f64,
) -> Ordering {
    let score_a = score_of(a.entry_id);
    let score_b = score_of(b.entry_id);
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            specificity_of(b)
                .partial_cmp(&specificity_of(a))
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.effective_priority().cmp(&a.effective_priority()))
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.entry_id.cmp(&b.entry_id))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_score_without_semantic() {
        let inputs = ScoreInputs {
            tag_match: 0.5,
            scope_specificity: 1.0,
            priority: 80,
            lexical: 1.0,
            recency: 1.0,
            semantic: None,
        };
        assert!((final_score(&inputs) - 4.3).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_weights_semantic_dominant() {
        // A strong semantic match with no lexical signal beats a strong
        // lexical match with no semantic one when
        // 0.7·sim > 0.3·normalize(lexical-side).
        let semantic_only = ScoreInputs {
            scope_specificity: 0.25,
            recency: 1.0,
            semantic: Some(0.95),
            ..Default::default()
        };
        let lexical_only = ScoreInputs {
            scope_specificity: 0.25,
            lexical: 1.0,
            recency: 1.0,
            semantic: Some(0.0),
            ..Default::default()
        };
        assert!(final_score(&semantic_only) > final_score(&lexical_only));
    }

    #[test]
    fn test_recency_decays_with_half_life() {
        let now = chrono::Utc::now();
        let fresh = recency_weight(now, now);
        let month = recency_weight(now - chrono::Duration::days(30), now);
        let old = recency_weight(now - chrono::Duration::days(300), now);
        assert!((fresh - 1.0).abs() < 1e-6);
        assert!((month - 0.5).abs() < 1e-3);
        assert!(old < 0.01);
    }
}
