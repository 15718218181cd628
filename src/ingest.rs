//! File and directory ingestion.
//!
//! Each file is read as UTF-8, classified once, split by the core chunker
//! and handed to the [`VectorStore`] as one batch of [`Document`]s:
//!
//! ```text
//! file ──▶ classify(resource_type) ──▶ chunk_text ──▶ Document{uuid, metadata} ──▶ store
//! ```
//!
//! Every chunk carries `source_file`, `chunk_index`, `section_header` (when
//! a heading precedes it), `content_hash` (SHA-256 of the chunk text) and
//! `ingested_at`, plus any caller metadata. Directory ingest walks the
//! files matching the include globs in path order; a failing file is
//! recorded in [`IngestReport::failures`] and the walk continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use ordinance_rag_core::chunk::chunk_text;
use ordinance_rag_core::classify::Classifier;
use ordinance_rag_core::models::{ClassifyContext, Document, IngestResult, Metadata};
use ordinance_rag_core::store::VectorStore;

use crate::config::{default_collection, default_include_globs, default_resource_type};

/// Per-call ingest settings.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub collection: String,
    /// Looked up in the classification rules.
    pub resource_type: String,
    pub context: ClassifyContext,
    /// Extra keys merged into every chunk's metadata. Reserved keys win.
    pub metadata: Metadata,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            resource_type: default_resource_type(),
            context: ClassifyContext::default(),
            metadata: Metadata::new(),
        }
    }
}

/// A file that could not be ingested.
#[derive(Debug)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub error: anyhow::Error,
}

/// Outcome of a directory walk.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub results: Vec<IngestResult>,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn total_chunks(&self) -> usize {
        self.results.iter().map(|r| r.num_chunks).sum()
    }
}

/// Chunks, classifies and stores source files.
pub struct DocumentIngester {
    store: Arc<dyn VectorStore>,
    classifier: Arc<dyn Classifier>,
    max_chars: usize,
}

impl DocumentIngester {
    pub fn new(store: Arc<dyn VectorStore>, classifier: Arc<dyn Classifier>, max_chars: usize) -> Self {
        Self {
            store,
            classifier,
            max_chars,
        }
    }

    pub async fn ingest_file(&self, path: &Path, options: &IngestOptions) -> Result<IngestResult> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let source = path.display().to_string();
        let classification = self
            .classifier
            .classify(&options.resource_type, &options.context);

        let chunks = chunk_text(&text, self.max_chars);
        if chunks.is_empty() {
            debug!(source = %source, "empty file, nothing to store");
            return Ok(IngestResult {
                source_path: source,
                num_chunks: 0,
                collection: options.collection.clone(),
                classification,
                chunk_ids: Vec::new(),
            });
        }

        let ingested_at = chrono::Utc::now().to_rfc3339();
        let documents: Vec<Document> = chunks
            .into_iter()
            .map(|chunk| {
                let mut metadata = options.metadata.clone();
                metadata.insert("source_file".into(), source.clone().into());
                metadata.insert("chunk_index".into(), chunk.chunk_index.into());
                if let Some(header) = &chunk.section_header {
                    metadata.insert("section_header".into(), header.clone().into());
                }
                metadata.insert("content_hash".into(), content_hash(&chunk.text).into());
                metadata.insert("ingested_at".into(), ingested_at.clone().into());
                Document {
                    id: Uuid::new_v4().to_string(),
                    content: chunk.text,
                    metadata,
                    classification,
                }
            })
            .collect();

        self.store
            .store(&documents, &options.collection)
            .await
            .with_context(|| format!("Failed to store chunks of {}", source))?;

        info!(
            source = %source,
            collection = %options.collection,
            chunks = documents.len(),
            %classification,
            "ingested"
        );
        Ok(IngestResult {
            source_path: source,
            num_chunks: documents.len(),
            collection: options.collection.clone(),
            classification,
            chunk_ids: documents.into_iter().map(|d| d.id).collect(),
        })
    }

    /// Ingest every file under `dir` matching `include_globs`.
    pub async fn ingest_directory(
        &self,
        dir: &Path,
        options: &IngestOptions,
        include_globs: &[String],
        recursive: bool,
    ) -> Result<IngestReport> {
        let files = scan_directory(dir, include_globs, recursive)?;
        let mut report = IngestReport::default();
        for path in files {
            match self.ingest_file(&path, options).await {
                Ok(result) => report.results.push(result),
                Err(error) => {
                    warn!(path = %path.display(), error = %format!("{:#}", error), "skipping file");
                    report.failures.push(IngestFailure { path, error });
                }
            }
        }
        Ok(report)
    }
}

/// Files under `dir` whose path relative to `dir` matches `include_globs`,
/// sorted by path. Patterns without a `/` match on the file name as well.
pub fn scan_directory(dir: &Path, include_globs: &[String], recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }
    let globs = if include_globs.is_empty() {
        default_include_globs()
    } else {
        include_globs.to_vec()
    };
    let include_set = build_globset(&globs)?;

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let name_matches = path
            .file_name()
            .is_some_and(|name| include_set.is_match(Path::new(name)));
        if include_set.is_match(relative) || name_matches {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
