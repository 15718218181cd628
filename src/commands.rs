//! Implementations behind the `ordrag` subcommands.
//!
//! Each `run_*` function loads what it needs from the [`Config`], does its
//! work and prints either a human-readable report or, with `--json`, one
//! pretty-printed JSON value on stdout. Logging goes to stderr.

use std::path::Path;

use std::io::Write;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Serialize;

use ordinance_rag_core::classify::Classifier;
use ordinance_rag_core::models::{
    AnswerEvent, AnswerOutcome, ChatTurn, Citation, CitedAnswer, Classification, ClassifyContext,
    RetrievalResult,
};

use crate::classification::ClassificationEngine;
use crate::config::Config;
use crate::ingest::IngestOptions;
use crate::pipeline::build_pipeline;
use crate::{db, migrate};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_init(config: &Config) -> Result<()> {
    if config.store.backend == "memory" {
        println!("Memory store configured; nothing to initialize.");
        return Ok(());
    }
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized at {}", config.store.path.display());
    Ok(())
}

pub async fn run_ingest(config: &Config, path: &Path, options: IngestOptions, json: bool) -> Result<()> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }
    let pipeline = build_pipeline(config).await?;
    let report = pipeline.ingest_report(path, &options).await?;

    if json {
        #[derive(Serialize)]
        struct Failure {
            path: String,
            error: String,
        }
        #[derive(Serialize)]
        struct Report<'a> {
            results: &'a [ordinance_rag_core::models::IngestResult],
            failures: Vec<Failure>,
        }
        return print_json(&Report {
            results: &report.results,
            failures: report
                .failures
                .iter()
                .map(|f| Failure {
                    path: f.path.display().to_string(),
                    error: format!("{:#}", f.error),
                })
                .collect(),
        });
    }

    for result in &report.results {
        println!(
            "{} -> {} ({} chunks, {})",
            result.source_path, result.collection, result.num_chunks, result.classification
        );
    }
    for failure in &report.failures {
        println!("FAILED {}: {:#}", failure.path.display(), failure.error);
    }
    println!(
        "ingested {} file(s), {} chunk(s), {} failure(s)",
        report.results.len(),
        report.total_chunks(),
        report.failures.len()
    );
    Ok(())
}

/// Load prior turns from a JSON array of `{ "role", "content" }` objects.
pub fn load_history(path: &Path) -> Result<Vec<ChatTurn>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid history file: {}", path.display()))
}

pub async fn run_ask(
    config: &Config,
    question: &str,
    collection: &str,
    max_classification: Option<Classification>,
    history: &[ChatTurn],
    json: bool,
) -> Result<()> {
    if question.trim().is_empty() {
        bail!("Question must not be empty");
    }
    let pipeline = build_pipeline(config).await?;
    let answer = pipeline
        .ask(question, collection, max_classification, history)
        .await?;
    if json {
        print_json(&answer)
    } else {
        print!("{}", render_answer(&answer));
        Ok(())
    }
}

/// Print the answer as the model produces it.
///
/// With `json`, every event is one JSON line.
pub async fn run_ask_stream(
    config: &Config,
    question: &str,
    collection: &str,
    max_classification: Option<Classification>,
    history: &[ChatTurn],
    json: bool,
) -> Result<()> {
    if question.trim().is_empty() {
        bail!("Question must not be empty");
    }
    let pipeline = build_pipeline(config).await?;
    let mut events = pipeline
        .ask_stream(question, collection, max_classification, history)
        .await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        let event = event?;
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        } else {
            write!(stdout, "{}", render_event(&event))?;
        }
        stdout.flush()?;
    }
    Ok(())
}

pub fn render_answer(answer: &CitedAnswer) -> String {
    let mut out = String::new();
    if answer.outcome == AnswerOutcome::Flagged {
        out.push_str("[LOW CONFIDENCE: verify with staff]\n");
    }
    out.push_str(answer.answer.trim());
    out.push_str("\n\n");
    out.push_str(&render_sources(&answer.citations));
    out.push_str(&render_footer(answer.confidence, answer.sources_used));
    out
}

/// Text for one streamed event. Tokens print as-is; the verdict follows.
pub fn render_event(event: &AnswerEvent) -> String {
    match event {
        AnswerEvent::Token { text } => text.clone(),
        AnswerEvent::Citations { citations } if citations.is_empty() => String::new(),
        AnswerEvent::Citations { citations } => format!("\n\n{}", render_sources(citations)),
        AnswerEvent::Metadata {
            confidence,
            sources_used,
            outcome,
            ..
        } => {
            let mut out = String::from("\n");
            if *outcome == AnswerOutcome::Flagged {
                out.push_str("[LOW CONFIDENCE: verify with staff]\n");
            }
            out.push_str(&render_footer(*confidence, *sources_used));
            out
        }
        AnswerEvent::Done => String::new(),
    }
}

fn render_sources(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }
    let mut out = String::from("Sources:\n");
    for citation in citations {
        let section = citation
            .section
            .as_deref()
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        out.push_str(&format!(
            "  - {}{} [{:.2}]\n",
            citation.source, section, citation.relevance_score
        ));
    }
    out
}

fn render_footer(confidence: f64, sources_used: usize) -> String {
    format!("confidence: {:.2}  sources used: {}\n", confidence, sources_used)
}

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    config: &Config,
    query: &str,
    collection: &str,
    limit: Option<usize>,
    max_classification: Option<Classification>,
    neighbors: bool,
    reranked: bool,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let pipeline = build_pipeline(config).await?;
    let limit = limit.unwrap_or(config.retrieval.final_count);
    let results = pipeline
        .search(query, collection, limit, max_classification, neighbors, reranked)
        .await?;
    if json {
        print_json(&results)
    } else {
        print!("{}", render_results(&results));
        Ok(())
    }
}

pub fn render_results(results: &[RetrievalResult]) -> String {
    if results.is_empty() {
        return "No results.\n".to_string();
    }
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{:.2}] {}\n",
            i + 1,
            result.confidence_score,
            result.source
        ));
        if let Some(section) = result.section_header() {
            out.push_str(&format!("    section: {}\n", section));
        }
        let excerpt: String = result.content.chars().take(160).collect();
        out.push_str(&format!("    excerpt: \"{}\"\n", excerpt.replace('\n', " ").trim()));
        out.push_str(&format!("    id: {}\n\n", result.chunk_id));
    }
    out
}

pub async fn run_collections_list(config: &Config, json: bool) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let names = pipeline.store().list_collections().await?;
    if json {
        return print_json(&names);
    }
    if names.is_empty() {
        println!("No collections.");
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

pub async fn run_collections_delete(config: &Config, name: &str) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    pipeline.store().delete_collection(name).await?;
    println!("Deleted collection {}", name);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClassifyReport<'a> {
    resource_type: &'a str,
    classification: Classification,
    rule: Option<&'a str>,
    residency: Option<&'a str>,
    cache: Option<&'a str>,
    logging: Option<&'a str>,
}

pub fn run_classify(
    config: &Config,
    resource_type: &str,
    context: ClassifyContext,
    json: bool,
) -> Result<()> {
    let engine = ClassificationEngine::from_config(config.classification.rules_path.as_deref())?;
    let classification = engine.classify(resource_type, &context);
    let rule = engine.get_rule(resource_type);
    let report = ClassifyReport {
        resource_type,
        classification,
        rule: rule.map(|r| r.name.as_str()),
        residency: rule.map(|r| r.residency.as_str()),
        cache: rule.map(|r| r.cache.as_str()),
        logging: rule.map(|r| r.logging.as_str()),
    };
    if json {
        return print_json(&report);
    }
    println!("{}: {}", resource_type, classification);
    match rule {
        Some(r) => println!(
            "  rule: {} (residency {}, cache {}, logging {})",
            r.name, r.residency, r.cache, r.logging
        ),
        None => println!("  rule: none (default {})", engine.default_classification()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinance_rag_core::models::Metadata;
    use tempfile::TempDir;

    #[test]
    fn test_render_flagged_answer() {
        let answer = CitedAnswer {
            answer: "Quiet hours start at 10 PM. [Source: noise.md]".to_string(),
            citations: vec![Citation {
                source: "noise.md".to_string(),
                section: Some("Quiet Hours".to_string()),
                quote: "Quiet hours".to_string(),
                relevance_score: 0.42,
            }],
            confidence: 0.42,
            sources_used: 1,
            low_confidence: true,
            outcome: AnswerOutcome::Flagged,
        };
        let text = render_answer(&answer);
        assert!(text.starts_with("[LOW CONFIDENCE"));
        assert!(text.contains("  - noise.md (Quiet Hours) [0.42]"));
        assert!(text.contains("sources used: 1"));
    }

    #[test]
    fn test_render_streamed_events() {
        let events = [
            AnswerEvent::Token {
                text: "Quiet hours ".to_string(),
            },
            AnswerEvent::Token {
                text: "start at 10 PM.".to_string(),
            },
            AnswerEvent::Citations {
                citations: vec![Citation {
                    source: "noise.md".to_string(),
                    section: None,
                    quote: "Quiet hours".to_string(),
                    relevance_score: 0.95,
                }],
            },
            AnswerEvent::Metadata {
                confidence: 0.95,
                low_confidence: false,
                sources_used: 1,
                outcome: AnswerOutcome::Trusted,
            },
            AnswerEvent::Done,
        ];
        let text: String = events.iter().map(render_event).collect();
        assert_eq!(
            text,
            "Quiet hours start at 10 PM.\n\nSources:\n  - noise.md [0.95]\n\nconfidence: 0.95  sources used: 1\n"
        );

        let refused = AnswerEvent::Metadata {
            confidence: 0.0,
            low_confidence: true,
            sources_used: 0,
            outcome: AnswerOutcome::Refused,
        };
        assert!(!render_event(&refused).contains("LOW CONFIDENCE"));
        assert_eq!(render_event(&AnswerEvent::Citations { citations: Vec::new() }), "");
    }

    #[test]
    fn test_render_results() {
        assert_eq!(render_results(&[]), "No results.\n");
        let mut metadata = Metadata::new();
        metadata.insert("section_header".into(), "Parking".into());
        let text = render_results(&[RetrievalResult {
            content: "Park on\nodd days.".to_string(),
            source: "parking.md".to_string(),
            chunk_id: "c1".to_string(),
            distance: 0.2,
            confidence_score: 0.9,
            metadata,
        }]);
        assert!(text.starts_with("1. [0.90] parking.md"));
        assert!(text.contains("section: Parking"));
        assert!(text.contains("\"Park on odd days.\""));
    }

    #[test]
    fn test_load_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"role":"user","content":"Hi"},{"role":"assistant","content":"Hello"}]"#,
        )
        .unwrap();
        let turns = load_history(&path).unwrap();
        assert_eq!(turns, vec![ChatTurn::user("Hi"), ChatTurn::assistant("Hello")]);

        std::fs::write(&path, "not json").unwrap();
        assert!(load_history(&path).is_err());
    }
}
