//! Multi-signal re-ranking of retrieval candidates.
//!
//! When more candidates exist than the caller wants, each one is re-scored as
//!
//! ```text
//! score = 0.5 × confidence + 0.35 × keyword_overlap + 0.15 × quality
//! quality = 0.5 × min(len / 800, 1) + 0.5 × alphabetic_ratio
//! ```
//!
//! `keyword_overlap` is the fraction of distinct query tokens present in the
//! candidate. The sort is stable, so ties keep their input order. Returned
//! results carry the combined score in `confidence_score`; it is an ordering
//! signal only; use [`RetrievalResult::calibrated_confidence`] for the
//! calibrated value.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::embedding::tokenize;
use crate::models::RetrievalResult;

pub const VECTOR_WEIGHT: f64 = 0.5;
pub const KEYWORD_WEIGHT: f64 = 0.35;
pub const QUALITY_WEIGHT: f64 = 0.15;

/// Chunk length (in characters) at which the length signal saturates.
const QUALITY_LENGTH_TARGET: f64 = 800.0;

/// Fraction of distinct query tokens that appear in `content`.
pub fn keyword_overlap(query: &str, content: &str) -> f64 {
    let query_tokens: HashSet<String> = tokenize(query).collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens: HashSet<String> = tokenize(content).collect();
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Heuristic in `[0, 1]` favouring substantial, prose-like text.
pub fn content_quality(text: &str) -> f64 {
    let len = text.chars().count();
    if len == 0 {
        return 0.0;
    }
    let length_score = (len as f64 / QUALITY_LENGTH_TARGET).min(1.0);
    let alpha = text.chars().filter(|c| c.is_alphabetic()).count();
    let alpha_ratio = alpha as f64 / len as f64;
    0.5 * length_score + 0.5 * alpha_ratio
}

/// Combined re-rank score for one candidate.
pub fn combined_score(query: &str, result: &RetrievalResult) -> f64 {
    VECTOR_WEIGHT * result.confidence_score
        + KEYWORD_WEIGHT * keyword_overlap(query, &result.content)
        + QUALITY_WEIGHT * content_quality(&result.content)
}

/// Re-rank `candidates` and keep the best `final_count`.
///
/// Returns the input untouched when it already fits in `final_count`.
pub fn rerank(query: &str, candidates: Vec<RetrievalResult>, final_count: usize) -> Vec<RetrievalResult> {
    if candidates.len() <= final_count {
        return candidates;
    }

    let mut scored: Vec<(f64, RetrievalResult)> = candidates
        .into_iter()
        .map(|r| (combined_score(query, &r), r))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    scored
        .into_iter()
        .take(final_count)
        .map(|(score, mut r)| {
            r.confidence_score = score;
            r
        })
        .collect()
}
