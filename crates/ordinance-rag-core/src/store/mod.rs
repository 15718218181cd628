//! Classification-aware storage abstraction for Ordinance RAG.
//!
//! The [`VectorStore`] trait defines the operations the ingestion and answer
//! pipeline need from a vector database, enabling pluggable backends
//! (SQLite in the app crate, in-memory here).
//!
//! Every stored record carries its classification label plus a numeric
//! rank ([`Classification::rank`]). Adapters apply the rank filter *before*
//! ranking and truncation, so a restricted record can never displace a
//! permitted one from the result window, and never leaks through it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Classification, Document, SearchResult};

/// Abstract vector store with per-record classification.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`store`](VectorStore::store) | Embed and persist documents into a collection |
/// | [`search`](VectorStore::search) | Nearest-neighbour search with optional classification ceiling |
/// | [`delete_collection`](VectorStore::delete_collection) | Drop a collection and its records |
/// | [`list_collections`](VectorStore::list_collections) | Names of collections owned by this adapter |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Persist documents into `collection`, creating it when absent.
    ///
    /// Each record keeps its classification label and rank.
    async fn store(&self, documents: &[Document], collection: &str) -> Result<()>;

    /// Return up to `limit` records nearest to `query`, ascending by distance.
    ///
    /// With `max_classification` set, only records whose rank is at or below
    /// the ceiling are considered. An unknown collection yields an empty
    /// vector.
    async fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        max_classification: Option<Classification>,
    ) -> Result<Vec<SearchResult>>;

    /// Remove a collection. Deleting a missing collection is not an error.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Names of collections visible to this adapter.
    async fn list_collections(&self) -> Result<Vec<String>>;
}

/// Apply the adapter's collection prefix to `name`.
///
/// Returns `name` unchanged when the prefix is empty or `name` already
/// starts with it; otherwise `<prefix>_<name>`.
///
/// ```rust
/// use ordinance_rag_core::store::qualify_collection;
///
/// assert_eq!(qualify_collection("city", "ordinances"), "city_ordinances");
/// assert_eq!(qualify_collection("city", "city_ordinances"), "city_ordinances");
/// assert_eq!(qualify_collection("", "ordinances"), "ordinances");
/// ```
pub fn qualify_collection(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || name.starts_with(prefix) {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// Whether a collection name belongs to the adapter owning `prefix`.
pub fn owns_collection(prefix: &str, name: &str) -> bool {
    prefix.is_empty() || name.starts_with(prefix)
}

/// Whether a record with `level` passes the optional ceiling.
pub fn within_ceiling(level: Classification, max_classification: Option<Classification>) -> bool {
    max_classification.map_or(true, |max| level.rank() <= max.rank())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_ceiling() {
        assert!(within_ceiling(Classification::Restricted, None));
        assert!(within_ceiling(
            Classification::Internal,
            Some(Classification::Internal)
        ));
        assert!(!within_ceiling(
            Classification::Sensitive,
            Some(Classification::Internal)
        ));
    }

    #[test]
    fn test_owns_collection() {
        assert!(owns_collection("", "anything"));
        assert!(owns_collection("city", "city_ordinances"));
        assert!(!owns_collection("city", "county_ordinances"));
    }
}
