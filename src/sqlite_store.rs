//! SQLite-backed [`VectorStore`] implementation.
//!
//! Records live in the `records` table with their classification label,
//! numeric `classification_level`, metadata JSON and an embedding BLOB
//! (little-endian `f32`). The classification ceiling is applied in SQL
//! (`classification_level <= ?`), so filtered rows never reach the ranking
//! step. Ranking itself is brute-force squared L2 over the remaining rows.
//! Rows embedded by a different model than the store's embedder are not
//! comparable and are skipped.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use ordinance_rag_core::embedding::{blob_to_vec, squared_l2_distance, vec_to_blob, Embedder};
use ordinance_rag_core::models::{Classification, Document, Metadata, SearchResult};
use ordinance_rag_core::store::{owns_collection, qualify_collection, VectorStore};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    prefix: String,
}

impl SqliteVectorStore {
    /// Wrap a migrated pool. See [`crate::migrate::run_migrations`].
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, prefix: &str) -> Self {
        Self {
            pool,
            embedder,
            prefix: prefix.to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of records held in `collection`.
    pub async fn count(&self, collection: &str) -> Result<i64> {
        let name = qualify_collection(&self.prefix, collection);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn store(&self, documents: &[Document], collection: &str) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != documents.len() {
            bail!(
                "Embedder returned {} vectors for {} documents",
                vectors.len(),
                documents.len()
            );
        }

        let name = qualify_collection(&self.prefix, collection);
        let model = self.embedder.model_name().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(&name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        for (doc, vector) in documents.iter().zip(vectors.iter()) {
            let metadata_json = serde_json::to_string(&doc.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO records (id, collection, content, metadata_json, classification,
                                     classification_level, embedding, embedding_model)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    content = excluded.content,
                    metadata_json = excluded.metadata_json,
                    classification = excluded.classification,
                    classification_level = excluded.classification_level,
                    embedding = excluded.embedding,
                    embedding_model = excluded.embedding_model
                "#,
            )
            .bind(&doc.id)
            .bind(&name)
            .bind(&doc.content)
            .bind(&metadata_json)
            .bind(doc.classification.as_str())
            .bind(doc.classification.rank())
            .bind(vec_to_blob(vector))
            .bind(&model)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
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
        if limit == 0 || !self.collection_exists(&name).await? {
            return Ok(Vec::new());
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .context("Empty embedding response")?;

        let ceiling = max_classification.map_or(i64::MAX, Classification::rank);
        let rows = sqlx::query(
            r#"
            SELECT id, content, metadata_json, classification, embedding
            FROM records
            WHERE collection = ? AND classification_level <= ? AND embedding_model = ?
            "#,
        )
        .bind(&name)
        .bind(ceiling)
        .bind(self.embedder.model_name())
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let metadata_json: String = row.get("metadata_json");
            let label: String = row.get("classification");
            let blob: Vec<u8> = row.get("embedding");

            let metadata: Metadata = serde_json::from_str(&metadata_json)
                .with_context(|| format!("Invalid metadata JSON for record {}", id))?;
            results.push(SearchResult {
                distance: squared_l2_distance(&query_vec, &blob_to_vec(&blob)),
                document_id: id,
                content: row.get("content"),
                metadata,
                classification: label.parse()?,
            });
        }

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
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names
            .into_iter()
            .filter(|name| owns_collection(&self.prefix, name))
            .collect())
    }
}
