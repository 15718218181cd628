//! End-to-end tests for the assembled pipeline.
//!
//! Each test runs against a real SQLite store in a temporary directory,
//! the deterministic hash embedder and a scripted language model, so no
//! network access is needed.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use ordinance_rag::classification::ClassificationEngine;
use ordinance_rag::ingest::IngestOptions;
use ordinance_rag::pipeline::{PipelineSettings, RagPipeline};
use ordinance_rag::sqlite_store::SqliteVectorStore;
use ordinance_rag::{db, migrate};
use ordinance_rag_core::citation::REFUSAL;
use ordinance_rag_core::embedding::HashEmbedder;
use ordinance_rag_core::llm::LlmClient;
use ordinance_rag_core::models::{AnswerEvent, AnswerOutcome, ChatTurn, Classification};
use ordinance_rag_core::store::VectorStore;

// ─── Scripted model ─────────────────────────────────────────────────

/// Replies with a fixed answer and records every prompt it receives.
struct ScriptedLlm {
    reply: String,
    calls: AtomicUsize,
    system_prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            system_prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(
        &self,
        _prompt: &str,
        system_prompt: Option<&str>,
        _temperature: f32,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(system) = system_prompt {
            self.system_prompts.lock().unwrap().push(system.to_string());
        }
        Ok(self.reply.clone())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn generate(&self, _: &str, _: Option<&str>, _: f32) -> Result<String> {
        anyhow::bail!("model backend unavailable")
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn sqlite_store(dir: &TempDir) -> Arc<dyn VectorStore> {
    let pool = db::connect_path(&dir.path().join("data").join("ordrag.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteVectorStore::new(
        pool,
        Arc::new(HashEmbedder::default()),
        "municipal",
    ))
}

async fn pipeline_with(dir: &TempDir, llm: Arc<dyn LlmClient>) -> RagPipeline {
    RagPipeline::new(
        sqlite_store(dir).await,
        Arc::new(ClassificationEngine::builtin().unwrap()),
        llm,
        PipelineSettings::default(),
    )
}

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn options(resource_type: &str) -> IngestOptions {
    IngestOptions {
        resource_type: resource_type.to_string(),
        ..IngestOptions::default()
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_quiet_hours_end_to_end() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(
        docs.path(),
        "noise.md",
        "# Quiet Hours\n\nQuiet hours are 10 PM to 7 AM on weekdays.",
    );

    let llm = ScriptedLlm::new("Quiet hours are 10 PM to 7 AM on weekdays. [Source: noise.md]");
    let pipeline = pipeline_with(&dir, llm.clone()).await;

    let ingested = pipeline.ingest(&path, &options("ordinance")).await.unwrap();
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].collection, "ordinances");
    assert_eq!(ingested[0].classification, Classification::Public);

    let retrieved = pipeline
        .search("What are quiet hours?", "ordinances", 10, Some(Classification::Public), true, false)
        .await
        .unwrap();
    let body = retrieved
        .iter()
        .find(|r| r.content.starts_with("Quiet hours are"))
        .expect("body chunk retrieved");
    assert_eq!(body.section_header(), Some("Quiet Hours"));

    let answer = pipeline
        .ask("What are quiet hours?", "ordinances", Some(Classification::Public), &[])
        .await
        .unwrap();
    assert_eq!(llm.calls(), 1);
    assert_eq!(answer.citations.len(), 1);
    let citation = &answer.citations[0];
    assert_eq!(citation.source, "noise.md");
    assert_eq!(citation.section.as_deref(), Some("Quiet Hours"));
    assert!(!citation.quote.is_empty());

    let cited: Vec<f64> = retrieved
        .iter()
        .filter(|r| r.source.ends_with("noise.md"))
        .map(|r| r.calibrated_confidence())
        .collect();
    let expected = cited.iter().sum::<f64>() / cited.len() as f64;
    assert!((answer.confidence - expected).abs() < 1e-9);
    assert_eq!(answer.low_confidence, answer.confidence < 0.5);
    assert_eq!(answer.sources_used, 1);
    assert_ne!(answer.outcome, AnswerOutcome::Refused);

    let prompts = llm.system_prompts.lock().unwrap();
    assert!(prompts[0].contains("Source: noise.md (Section: Quiet Hours)"));
}

#[tokio::test]
async fn test_classification_filtering() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let llm = ScriptedLlm::new("unused");
    let pipeline = pipeline_with(&dir, llm).await;

    let shared = "Snow must be cleared from sidewalks within 24 hours.";
    for (name, resource_type) in [
        ("public.md", "ordinance"),
        ("internal.md", "staff_sop"),
        ("sensitive.md", "resident_pii"),
    ] {
        let path = write(docs.path(), name, shared);
        pipeline.ingest(&path, &options(resource_type)).await.unwrap();
    }

    let results = pipeline
        .search(shared, "ordinances", 10, Some(Classification::Internal), false, false)
        .await
        .unwrap();
    let mut sources: Vec<String> = results
        .iter()
        .map(|r| Path::new(&r.source).file_name().unwrap().to_string_lossy().to_string())
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["internal.md", "public.md"]);

    let public = pipeline
        .search(shared, "ordinances", 10, Some(Classification::Public), false, false)
        .await
        .unwrap();
    assert_eq!(public.len(), 1);
    assert!(public[0].source.ends_with("public.md"));

    let everything = pipeline
        .search(shared, "ordinances", 10, Some(Classification::Restricted), false, false)
        .await
        .unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn test_unknown_collection_refuses_without_model_call() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new("should not be called");
    let pipeline = pipeline_with(&dir, llm.clone()).await;

    let answer = pipeline
        .ask("Can I keep chickens?", "no_such_collection", None, &[])
        .await
        .unwrap();
    assert_eq!(answer.answer, REFUSAL);
    assert_eq!(answer.confidence, 0.0);
    assert!(answer.low_confidence);
    assert_eq!(answer.sources_used, 0);
    assert!(answer.citations.is_empty());
    assert_eq!(answer.outcome, AnswerOutcome::Refused);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_unmatched_citation_scores_against_all_evidence() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "parking.md", "Overnight street parking requires a permit.");

    let llm = ScriptedLlm::new("Parking is free everywhere. [Source: made_up.md]");
    let pipeline = pipeline_with(&dir, llm).await;
    pipeline.ingest(&path, &options("ordinance")).await.unwrap();

    let answer = pipeline
        .ask("Do I need a parking permit overnight?", "ordinances", None, &[])
        .await
        .unwrap();
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].relevance_score, 0.0);
    assert!(answer.citations[0].quote.is_empty());

    let evidence = pipeline
        .search("Do I need a parking permit overnight?", "ordinances", 5, None, true, true)
        .await
        .unwrap();
    let mean = evidence.iter().map(|r| r.calibrated_confidence()).sum::<f64>() / evidence.len() as f64;
    assert!(answer.confidence > 0.0);
    assert!((answer.confidence - mean).abs() < 1e-9);
    assert_eq!(answer.low_confidence, answer.confidence < 0.5);
    let expected = if answer.low_confidence {
        AnswerOutcome::Flagged
    } else {
        AnswerOutcome::Trusted
    };
    assert_eq!(answer.outcome, expected);
}

#[tokio::test]
async fn test_streamed_answer_matches_blocking_answer() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "noise.md", "Quiet hours are 10 PM to 7 AM on weekdays.");

    let llm = ScriptedLlm::new("Quiet hours start at 10 PM. [Source: noise.md]");
    let pipeline = pipeline_with(&dir, llm.clone()).await;
    pipeline.ingest(&path, &options("ordinance")).await.unwrap();

    let blocking = pipeline
        .ask("When are quiet hours?", "ordinances", None, &[])
        .await
        .unwrap();
    let events: Vec<AnswerEvent> = pipeline
        .ask_stream("When are quiet hours?", "ordinances", None, &[])
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            AnswerEvent::Token {
                text: blocking.answer.clone()
            },
            AnswerEvent::Citations {
                citations: blocking.citations.clone()
            },
            AnswerEvent::Metadata {
                confidence: blocking.confidence,
                low_confidence: blocking.low_confidence,
                sources_used: blocking.sources_used,
                outcome: blocking.outcome,
            },
            AnswerEvent::Done,
        ]
    );
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_streamed_refusal_for_unknown_collection() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new("unused");
    let pipeline = pipeline_with(&dir, llm.clone()).await;

    let events: Vec<AnswerEvent> = pipeline
        .ask_stream("Anything?", "nonexistent", None, &[])
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        AnswerEvent::Token {
            text: REFUSAL.to_string()
        }
    );
    assert!(matches!(
        events[1],
        AnswerEvent::Metadata {
            outcome: AnswerOutcome::Refused,
            ..
        }
    ));
    assert_eq!(events[2], AnswerEvent::Done);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_history_reaches_the_prompt() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "trash.md", "Trash pickup is every Tuesday morning.");

    let llm = ScriptedLlm::new("Tuesday. [Source: trash.md]");
    let pipeline = pipeline_with(&dir, llm.clone()).await;
    pipeline.ingest(&path, &options("ordinance")).await.unwrap();

    let history = vec![
        ChatTurn::user("I just moved to Elm Street."),
        ChatTurn::assistant("Welcome to the neighbourhood!"),
    ];
    pipeline
        .ask("When is trash pickup?", "ordinances", None, &history)
        .await
        .unwrap();
    let prompts = llm.system_prompts.lock().unwrap();
    assert!(prompts[0].contains("Conversation History:"));
    assert!(prompts[0].contains("I just moved to Elm Street."));
}

#[tokio::test]
async fn test_model_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "dogs.md", "Dogs must be leashed in all parks.");

    let pipeline = pipeline_with(&dir, Arc::new(FailingLlm)).await;
    pipeline.ingest(&path, &options("ordinance")).await.unwrap();

    let err = pipeline
        .ask("Do dogs need a leash?", "ordinances", None, &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("model backend unavailable"));
}

#[tokio::test]
async fn test_directory_ingest_isolates_failures() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    write(docs.path(), "a_fees.md", "Building permit fees are listed in Schedule A.");
    write(docs.path(), "b_hours.txt", "City Hall is open 8 AM to 5 PM.");
    std::fs::write(docs.path().join("c_scan.md"), [0xc3, 0x28, 0xa0, 0xa1]).unwrap();

    let pipeline = pipeline_with(&dir, ScriptedLlm::new("unused")).await;

    let report = pipeline
        .ingest_report(docs.path(), &options("faq"))
        .await
        .unwrap();
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("c_scan.md"));

    let results = pipeline.ingest(docs.path(), &options("faq")).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.classification == Classification::Public));

    let err = pipeline
        .ingest(&docs.path().join("c_scan.md"), &options("faq"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to read"));
}

#[tokio::test]
async fn test_external_source_raises_level() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "county.md", "County burn bans apply during drought.");
    let pipeline = pipeline_with(&dir, ScriptedLlm::new("unused")).await;

    let mut opts = options("ordinance");
    opts.context.external_source = true;
    let result = &pipeline.ingest(&path, &opts).await.unwrap()[0];
    assert_eq!(result.classification, Classification::Internal);

    let public = pipeline
        .search("burn ban", "ordinances", 5, Some(Classification::Public), false, false)
        .await
        .unwrap();
    assert!(public.is_empty());
}

#[tokio::test]
async fn test_collections_are_prefixed() {
    let dir = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let path = write(docs.path(), "zoning.md", "Fences may not exceed six feet.");
    let pipeline = pipeline_with(&dir, ScriptedLlm::new("unused")).await;
    pipeline.ingest(&path, &options("ordinance")).await.unwrap();

    let store = pipeline.store();
    assert_eq!(
        store.list_collections().await.unwrap(),
        vec!["municipal_ordinances".to_string()]
    );
    store.delete_collection("ordinances").await.unwrap();
    assert!(store.list_collections().await.unwrap().is_empty());
}
