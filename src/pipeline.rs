//! The assembled retrieval-augmented answer pipeline.
//!
//! [`RagPipeline`] owns one vector store and exposes the two operations
//! callers need: [`ingest`](RagPipeline::ingest) a file or directory and
//! [`ask`](RagPipeline::ask) a question. Collaborators are injected through
//! [`RagPipeline::new`]; [`build_pipeline`] wires them from a [`Config`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use ordinance_rag_core::citation::{AnswerOptions, AnswerStream, CitationEngine};
use ordinance_rag_core::classify::Classifier;
use ordinance_rag_core::llm::LlmClient;
use ordinance_rag_core::models::{ChatTurn, CitedAnswer, Classification, IngestResult, RetrievalResult};
use ordinance_rag_core::rerank::rerank;
use ordinance_rag_core::retrieve::Retriever;
use ordinance_rag_core::store::memory::InMemoryVectorStore;
use ordinance_rag_core::store::VectorStore;

use crate::classification::ClassificationEngine;
use crate::config::{default_include_globs, Config};
use crate::embedding::create_embedder;
use crate::ingest::{DocumentIngester, IngestOptions, IngestReport};
use crate::llm::create_llm_client;
use crate::sqlite_store::SqliteVectorStore;
use crate::{db, migrate};

/// Tunables that are not collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_chars: usize,
    pub answer: AnswerOptions,
    /// Ceiling used by [`RagPipeline::ask`] when none is passed.
    pub default_max_classification: Classification,
    pub include_globs: Vec<String>,
    pub recursive: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_chars: ordinance_rag_core::chunk::DEFAULT_MAX_CHUNK_CHARS,
            answer: AnswerOptions::default(),
            default_max_classification: Classification::Public,
            include_globs: default_include_globs(),
            recursive: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.chunking.max_chars,
            answer: AnswerOptions {
                candidate_count: config.retrieval.candidate_count,
                final_count: config.retrieval.final_count,
                neighbor_window: config.retrieval.neighbor_window,
            },
            default_max_classification: config.retrieval.max_classification,
            include_globs: config.ingest.include_globs.clone(),
            recursive: config.ingest.recursive,
        }
    }
}

pub struct RagPipeline {
    store: Arc<dyn VectorStore>,
    ingester: DocumentIngester,
    retriever: Retriever,
    engine: CitationEngine,
    settings: PipelineSettings,
}

impl RagPipeline {
    pub fn new(
        store: Arc<dyn VectorStore>,
        classifier: Arc<dyn Classifier>,
        llm: Arc<dyn LlmClient>,
        settings: PipelineSettings,
    ) -> Self {
        let retriever = Retriever::new(store.clone());
        Self {
            ingester: DocumentIngester::new(store.clone(), classifier, settings.max_chars),
            engine: CitationEngine::with_options(llm, retriever.clone(), settings.answer),
            retriever,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Ingest a file or every matching file in a directory.
    ///
    /// Files that fail inside a directory are logged and left out of the
    /// result; a single file's error is returned.
    pub async fn ingest(&self, path: &Path, options: &IngestOptions) -> Result<Vec<IngestResult>> {
        let report = self.ingest_report(path, options).await?;
        for failure in &report.failures {
            warn!(
                path = %failure.path.display(),
                error = %format!("{:#}", failure.error),
                "file not ingested"
            );
        }
        Ok(report.results)
    }

    /// Like [`ingest`](Self::ingest) but hands back the failures too.
    pub async fn ingest_report(&self, path: &Path, options: &IngestOptions) -> Result<IngestReport> {
        if path.is_dir() {
            let report = self
                .ingester
                .ingest_directory(
                    path,
                    options,
                    &self.settings.include_globs,
                    self.settings.recursive,
                )
                .await?;
            info!(
                dir = %path.display(),
                files = report.results.len(),
                failed = report.failures.len(),
                chunks = report.total_chunks(),
                "directory ingested"
            );
            Ok(report)
        } else {
            let result = self.ingester.ingest_file(path, options).await?;
            Ok(IngestReport {
                results: vec![result],
                failures: Vec::new(),
            })
        }
    }

    /// Answer `question` from `collection`.
    ///
    /// `max_classification` defaults to the configured ceiling.
    pub async fn ask(
        &self,
        question: &str,
        collection: &str,
        max_classification: Option<Classification>,
        history: &[ChatTurn],
    ) -> Result<CitedAnswer> {
        let ceiling = max_classification.unwrap_or(self.settings.default_max_classification);
        self.engine
            .answer(question, collection, Some(ceiling), history)
            .await
    }

    /// Streaming form of [`ask`](Self::ask).
    pub async fn ask_stream(
        &self,
        question: &str,
        collection: &str,
        max_classification: Option<Classification>,
        history: &[ChatTurn],
    ) -> Result<AnswerStream> {
        let ceiling = max_classification.unwrap_or(self.settings.default_max_classification);
        self.engine
            .answer_stream(question, collection, Some(ceiling), history)
            .await
    }

    /// Plain retrieval, optionally widened with neighbours and re-ranked.
    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        max_classification: Option<Classification>,
        neighbors: bool,
        reranked: bool,
    ) -> Result<Vec<RetrievalResult>> {
        let ceiling = max_classification.unwrap_or(self.settings.default_max_classification);
        let results = if neighbors {
            self.retriever
                .retrieve_with_neighbors(
                    query,
                    collection,
                    limit,
                    self.settings.answer.neighbor_window,
                    Some(ceiling),
                )
                .await?
        } else {
            self.retriever
                .retrieve(query, collection, limit, Some(ceiling))
                .await?
        };
        Ok(if reranked {
            rerank(query, results, limit)
        } else {
            results
        })
    }
}

/// Open the configured store and build a pipeline around it.
pub async fn build_pipeline(config: &Config) -> Result<RagPipeline> {
    let embedder = create_embedder(&config.embedding).await?;
    let store: Arc<dyn VectorStore> = match config.store.backend.as_str() {
        "memory" => Arc::new(InMemoryVectorStore::with_prefix(
            embedder,
            &config.store.collection_prefix,
        )),
        _ => {
            let pool = db::connect(config).await?;
            migrate::run_migrations(&pool).await?;
            Arc::new(SqliteVectorStore::new(
                pool,
                embedder,
                &config.store.collection_prefix,
            ))
        }
    };

    let classifier = ClassificationEngine::from_config(config.classification.rules_path.as_deref())
        .context("Failed to load classification rules")?;
    let llm = create_llm_client(&config.llm)?;

    Ok(RagPipeline::new(
        store,
        Arc::new(classifier),
        llm,
        PipelineSettings::from_config(config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ordinance_rag_core::classify::FixedClassifier;
    use ordinance_rag_core::embedding::HashEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingLlm {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingLlm {
        async fn generate(&self, _: &str, _: Option<&str>, _: f32) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn pipeline(level: Classification, reply: &str) -> (RagPipeline, Arc<CountingLlm>) {
        let llm = Arc::new(CountingLlm {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbedder::default())));
        let pipeline = RagPipeline::new(
            store,
            Arc::new(FixedClassifier(level)),
            llm.clone(),
            PipelineSettings::default(),
        );
        (pipeline, llm)
    }

    #[tokio::test]
    async fn test_ask_uses_default_ceiling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sop.md");
        std::fs::write(&path, "Staff must log every noise complaint in the tracker.").unwrap();

        let (pipeline, llm) = pipeline(Classification::Internal, "Log it. [Source: sop.md]");
        pipeline.ingest(&path, &IngestOptions::default()).await.unwrap();

        let public = pipeline
            .ask("noise complaint", "ordinances", None, &[])
            .await
            .unwrap();
        assert!(public.low_confidence);
        assert_eq!(public.sources_used, 0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

        let internal = pipeline
            .ask("noise complaint", "ordinances", Some(Classification::Internal), &[])
            .await
            .unwrap();
        assert_eq!(internal.citations.len(), 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_modes() {
        let dir = TempDir::new().unwrap();
        let paragraphs: Vec<String> = (0..6)
            .map(|i| format!("Section {} text on sidewalk snow removal within 24 hours.", i))
            .collect();
        std::fs::write(dir.path().join("snow.md"), paragraphs.join("\n\n")).unwrap();

        let store = Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbedder::default())));
        let llm = Arc::new(CountingLlm {
            reply: String::new(),
            calls: AtomicUsize::new(0),
        });
        let settings = PipelineSettings {
            max_chars: 60,
            ..PipelineSettings::default()
        };
        let pipeline = RagPipeline::new(
            store,
            Arc::new(FixedClassifier(Classification::Public)),
            llm,
            settings,
        );
        let results = pipeline
            .ingest(dir.path(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].num_chunks > 2);

        let plain = pipeline
            .search("snow removal", "ordinances", 2, None, false, false)
            .await
            .unwrap();
        assert_eq!(plain.len(), 2);

        let widened = pipeline
            .search("snow removal", "ordinances", 2, None, true, false)
            .await
            .unwrap();
        assert!(widened.len() >= 2);

        let reranked = pipeline
            .search("snow removal", "ordinances", 2, None, true, true)
            .await
            .unwrap();
        assert_eq!(reranked.len(), 2);
    }

    #[tokio::test]
    async fn test_build_pipeline_with_memory_store() {
        let config: Config = toml::from_str(
            "[store]\nbackend = \"memory\"\n[embedding]\nproviders = [\"hash\"]\n",
        )
        .unwrap();
        let pipeline = build_pipeline(&config).await.unwrap();
        assert!(pipeline.store().list_collections().await.unwrap().is_empty());
        assert_eq!(pipeline.settings().answer.final_count, 5);
    }
}
