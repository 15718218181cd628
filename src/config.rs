//! Configuration parsing and validation.
//!
//! Ordinance RAG is configured via a TOML file (default:
//! `config/ordrag.toml`). Every section is optional; missing keys fall back
//! to the defaults below, and [`load_config`] rejects values the pipeline
//! cannot work with.
//!
//! ```toml
//! [store]
//! path = "./data/ordrag.sqlite"
//! collection_prefix = "municipal"
//!
//! [chunking]
//! max_chars = 500
//!
//! [retrieval]
//! candidate_count = 10
//! final_count = 5
//! neighbor_window = 1
//! max_classification = "public"
//!
//! [embedding]
//! providers = ["ollama", "hash"]
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [llm]
//! provider = "ollama"
//! model = "llama3.1:8b"
//!
//! [ingest]
//! collection = "ordinances"
//! resource_type = "ordinance"
//! include_globs = ["*.md", "*.txt"]
//!
//! [classification]
//! rules_path = "config/data_classification.toml"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use ordinance_rag_core::chunk::DEFAULT_MAX_CHUNK_CHARS;
use ordinance_rag_core::models::Classification;

use crate::llm::LLM_PROVIDERS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"sqlite"` (persistent) or `"memory"` (per-process).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/ordrag.sqlite")
}
fn default_collection_prefix() -> String {
    "municipal".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHUNK_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,
    #[serde(default = "default_final_count")]
    pub final_count: usize,
    #[serde(default = "default_neighbor_window")]
    pub neighbor_window: u64,
    /// Ceiling applied to `ask` when the caller does not pass one.
    #[serde(default = "default_max_classification")]
    pub max_classification: Classification,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_count: default_candidate_count(),
            final_count: default_final_count(),
            neighbor_window: default_neighbor_window(),
            max_classification: default_max_classification(),
        }
    }
}

fn default_candidate_count() -> usize {
    10
}
fn default_final_count() -> usize {
    5
}
fn default_neighbor_window() -> u64 {
    1
}
fn default_max_classification() -> Classification {
    Classification::Public
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Ordered fallback list; the first provider that can be built wins.
    #[serde(default = "default_embedding_providers")]
    pub providers: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: default_embedding_providers(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_providers() -> Vec<String> {
    vec!["ollama".to_string(), "hash".to_string()]
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"ollama"` or `"openai"` (any OpenAI-compatible server, e.g. vLLM).
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_llm_max_retries() -> u32 {
    2
}
fn default_max_tokens() -> u32 {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            resource_type: default_resource_type(),
            include_globs: default_include_globs(),
            recursive: default_recursive(),
        }
    }
}

pub fn default_collection() -> String {
    "ordinances".to_string()
}
pub fn default_resource_type() -> String {
    "ordinance".to_string()
}
pub fn default_include_globs() -> Vec<String> {
    vec!["*.md".to_string(), "*.txt".to_string()]
}
fn default_recursive() -> bool {
    false
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClassificationConfig {
    /// Rules file; the built-in municipal rules apply when unset.
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

const EMBEDDING_PROVIDERS: &[&str] = &["openai", "ollama", "local", "hash"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Relative rule paths resolve against the config file's directory.
    if let Some(rules) = &config.classification.rules_path {
        if rules.is_relative() {
            if let Some(parent) = path.parent() {
                config.classification.rules_path = Some(parent.join(rules));
            }
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown store backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    if config.retrieval.candidate_count == 0 {
        bail!("retrieval.candidate_count must be >= 1");
    }
    if config.retrieval.final_count == 0 {
        bail!("retrieval.final_count must be >= 1");
    }

    if config.embedding.providers.is_empty() {
        bail!("embedding.providers must list at least one provider");
    }
    for provider in &config.embedding.providers {
        if !EMBEDDING_PROVIDERS.contains(&provider.as_str()) {
            bail!(
                "Unknown embedding provider: '{}'. Available: {}",
                provider,
                EMBEDDING_PROVIDERS.join(", ")
            );
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    if !LLM_PROVIDERS.contains(&config.llm.provider.as_str()) {
        bail!(
            "Unknown LLM provider: '{}'. Available: {}",
            config.llm.provider,
            LLM_PROVIDERS.join(", ")
        );
    }

    if config.ingest.include_globs.is_empty() {
        bail!("ingest.include_globs must not be empty");
    }

    Ok(())
}
