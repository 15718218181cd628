//! Retrieval with calibrated confidence and neighbour expansion.
//!
//! The [`Retriever`] wraps a [`VectorStore`] and turns raw distances into
//! confidence scores in `[0, 1]`:
//!
//! ```text
//! confidence = clamp(exp(-distance / 2), 0, 1)
//! ```
//!
//! Distance 0 maps to confidence 1; confidence strictly decreases as
//! distance grows.
//!
//! # Neighbour expansion
//!
//! [`Retriever::retrieve_with_neighbors`] over-fetches `3 × n` candidates,
//! keeps the top `n` as primaries, then pulls in any other candidate from the
//! same source whose `chunk_index` lies within `window` of a primary. The
//! combined set is deduplicated by chunk id and returned in reading order
//! (`source`, then `chunk_index`), so the model sees contiguous passages.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::models::{Classification, RetrievalResult, SearchResult};
use crate::store::VectorStore;

/// Source label used when a record carries no `source_file` metadata.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Map a non-negative distance to a confidence in `[0, 1]`.
pub fn distance_to_confidence(distance: f64) -> f64 {
    if distance.is_nan() {
        return 0.0;
    }
    (-distance / 2.0).exp().clamp(0.0, 1.0)
}

/// Confidence-scoring front end over a [`VectorStore`].
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Top `n` results for `query`, sorted by confidence descending.
    pub async fn retrieve(
        &self,
        query: &str,
        collection: &str,
        n: usize,
        max_classification: Option<Classification>,
    ) -> Result<Vec<RetrievalResult>> {
        let hits = self
            .store
            .search(query, collection, n, max_classification)
            .await?;
        let mut results: Vec<RetrievalResult> = hits.into_iter().map(to_retrieval_result).collect();
        sort_by_confidence(&mut results);
        results.truncate(n);
        debug!(collection, n, returned = results.len(), "retrieved");
        Ok(results)
    }

    /// Top `n` results plus same-source neighbours within `window` chunks,
    /// in reading order.
    pub async fn retrieve_with_neighbors(
        &self,
        query: &str,
        collection: &str,
        n: usize,
        window: u64,
        max_classification: Option<Classification>,
    ) -> Result<Vec<RetrievalResult>> {
        let candidates = self
            .retrieve(query, collection, n.saturating_mul(3), max_classification)
            .await?;
        let primary_count = n.min(candidates.len());
        let (primaries, rest) = candidates.split_at(primary_count);

        let mut seen: HashSet<&str> = HashSet::new();
        let mut selected: Vec<RetrievalResult> = Vec::new();
        for p in primaries {
            if seen.insert(p.chunk_id.as_str()) {
                selected.push(p.clone());
            }
        }

        for candidate in rest {
            let Some(index) = candidate.chunk_index() else {
                continue;
            };
            let adjacent = primaries.iter().any(|p| {
                p.source == candidate.source
                    && p.chunk_index().is_some_and(|pi| pi.abs_diff(index) <= window)
            });
            if adjacent && seen.insert(candidate.chunk_id.as_str()) {
                selected.push(candidate.clone());
            }
        }

        selected.sort_by(|a, b| {
            a.source.cmp(&b.source).then_with(|| {
                a.chunk_index()
                    .unwrap_or(u64::MAX)
                    .cmp(&b.chunk_index().unwrap_or(u64::MAX))
            })
        });
        debug!(
            collection,
            primaries = primary_count,
            total = selected.len(),
            "retrieved with neighbours"
        );
        Ok(selected)
    }
}

fn to_retrieval_result(hit: SearchResult) -> RetrievalResult {
    let source = hit
        .metadata
        .get("source_file")
        .and_then(|v| v.as_str())
        .unwrap_or(UNKNOWN_SOURCE)
        .to_string();
    RetrievalResult {
        confidence_score: distance_to_confidence(hit.distance),
        content: hit.content,
        source,
        chunk_id: hit.document_id,
        distance: hit.distance,
        metadata: hit.metadata,
    }
}

fn sort_by_confidence(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.confidence_score
            .partial_cmp(&a.confidence_score)
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Metadata;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Store returning canned hits, recording the limits it was asked for.
    pub(crate) struct FixedStore {
        pub hits: Vec<SearchResult>,
        pub limits: Mutex<Vec<usize>>,
    }

    impl FixedStore {
        pub fn new(hits: Vec<SearchResult>) -> Self {
            Self {
                hits,
                limits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorStore for FixedStore {
        async fn store(&self, _documents: &[crate::models::Document], _collection: &str) -> Result<()> {
            Ok(())
        }

        async fn search(
            &self,
            _query: &str,
            _collection: &str,
            limit: usize,
            max_classification: Option<Classification>,
        ) -> Result<Vec<SearchResult>> {
            self.limits.lock().unwrap().push(limit);
            let mut hits: Vec<SearchResult> = self
                .hits
                .iter()
                .filter(|h| crate::store::within_ceiling(h.classification, max_classification))
                .cloned()
                .collect();
            hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
            hits.truncate(limit);
            Ok(hits)
        }

        async fn delete_collection(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn hit(id: &str, source: Option<&str>, index: u64, distance: f64, content: &str) -> SearchResult {
        let mut metadata = Metadata::new();
        if let Some(source) = source {
            metadata.insert("source_file".into(), source.into());
        }
        metadata.insert("chunk_index".into(), index.into());
        SearchResult {
            document_id: id.to_string(),
            content: content.to_string(),
            metadata,
            classification: Classification::Public,
            distance,
        }
    }

    #[test]
    fn test_confidence_calibration() {
        assert_eq!(distance_to_confidence(0.0), 1.0);
        assert!((distance_to_confidence(2.0) - (-1.0f64).exp()).abs() < 1e-12);
        let mut prev = distance_to_confidence(0.0);
        for step in 1..40 {
            let c = distance_to_confidence(step as f64 * 0.1);
            assert!(c < prev);
            assert!((0.0..=1.0).contains(&c));
            prev = c;
        }
        assert_eq!(distance_to_confidence(f64::NAN), 0.0);
    }

    #[tokio::test]
    async fn test_retrieve_sorts_and_labels_source() {
        let store = Arc::new(FixedStore::new(vec![
            hit("b", None, 0, 0.8, "b"),
            hit("a", Some("/docs/noise.md"), 3, 0.2, "a"),
        ]));
        let retriever = Retriever::new(store);
        let results = retriever.retrieve("q", "c", 5, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "a");
        assert_eq!(results[0].source, "/docs/noise.md");
        assert_eq!(results[1].source, UNKNOWN_SOURCE);
        assert!(results[0].confidence_score > results[1].confidence_score);
        assert_eq!(results[0].confidence_score, results[0].calibrated_confidence());
    }

    #[tokio::test]
    async fn test_retrieve_with_neighbors_expands_and_orders() {
        let store = Arc::new(FixedStore::new(vec![
            hit("n5", Some("noise.md"), 5, 0.1, "primary"),
            hit("n4", Some("noise.md"), 4, 0.9, "before"),
            hit("n6", Some("noise.md"), 6, 1.0, "after"),
            hit("n9", Some("noise.md"), 9, 1.1, "too far"),
            hit("p5", Some("parking.md"), 5, 1.2, "other source"),
        ]));
        let retriever = Retriever::new(store.clone());
        let results = retriever
            .retrieve_with_neighbors("q", "c", 1, 1, None)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["n4", "n5", "n6"]);
        assert_eq!(*store.limits.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_neighbors_deduplicate_primaries() {
        let store = Arc::new(FixedStore::new(vec![
            hit("a0", Some("a.md"), 0, 0.1, "x"),
            hit("a1", Some("a.md"), 1, 0.2, "y"),
            hit("b0", Some("b.md"), 0, 0.3, "z"),
        ]));
        let retriever = Retriever::new(store);
        let results = retriever
            .retrieve_with_neighbors("q", "c", 2, 1, None)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a0", "a1"]);
    }

    #[tokio::test]
    async fn test_empty_store_yields_nothing() {
        let retriever = Retriever::new(Arc::new(FixedStore::new(Vec::new())));
        assert!(retriever
            .retrieve_with_neighbors("q", "c", 5, 1, None)
            .await
            .unwrap()
            .is_empty());
    }
}
