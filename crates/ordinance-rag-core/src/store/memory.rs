//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! Uses a `BTreeMap` of collections behind `std::sync::RwLock`. Vector
//! search is brute-force squared L2 over the records that pass the
//! classification ceiling.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::embedding::{squared_l2_distance, Embedder};
use crate::models::{Classification, Document, SearchResult};

use super::{owns_collection, qualify_collection, within_ceiling, VectorStore};

struct StoredRecord {
    doc: Document,
    vector: Vec<f32>,
}

/// In-memory store keyed by (prefixed) collection name.
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    prefix: String,
    collections: RwLock<BTreeMap<String, Vec<StoredRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_prefix(embedder, "")
    }

    pub fn with_prefix(embedder: Arc<dyn Embedder>, prefix: &str) -> Self {
        Self {
            embedder,
            prefix: prefix.to_string(),
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of records held in `collection`.
    pub fn len(&self, collection: &str) -> Result<usize> {
        let name = qualify_collection(&self.prefix, collection);
        let guard = self
            .collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        Ok(guard.get(&name).map_or(0, |records| records.len()))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn store(&self, documents: &[Document], collection: &str) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != documents.len() {
            return Err(anyhow!(
                "embedder returned {} vectors for {} documents",
                vectors.len(),
                documents.len()
            ));
        }

        let name = qualify_collection(&self.prefix, collection);
        let mut guard = self
            .collections
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        let records = guard.entry(name.clone()).or_default();
        for (doc, vector) in documents.iter().zip(vectors) {
            records.retain(|r| r.doc.id != doc.id);
            records.push(StoredRecord {
                doc: doc.clone(),
                vector,
            });
        }
        debug!(collection = %name, count = documents.len(), "stored documents");
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        max_classification: Option<Classification>,
    ) -> Result<Vec<SearchResult>> {
        let name = qualify_collection(&self.prefix, collection);
        {
            let guard = self
                .collections
                .read()
                .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
            if !guard.contains_key(&name) || limit == 0 {
                return Ok(Vec::new());
            }
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedder returned no vector for query"))?;

        let guard = self
            .collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        let Some(records) = guard.get(&name) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<SearchResult> = records
            .iter()
            .filter(|r| within_ceiling(r.doc.classification, max_classification))
            .map(|r| SearchResult {
                document_id: r.doc.id.clone(),
                content: r.doc.content.clone(),
                metadata: r.doc.metadata.clone(),
                classification: r.doc.classification,
                distance: squared_l2_distance(&query_vec, &r.vector),
            })
            .collect();
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let name = qualify_collection(&self.prefix, name);
        let mut guard = self
            .collections
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        guard.remove(&name);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let guard = self
            .collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        Ok(guard
            .keys()
            .filter(|name| owns_collection(&self.prefix, name))
            .cloned()
            .collect())
    }
}
