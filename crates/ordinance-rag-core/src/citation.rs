//! Cited answer generation with a hallucination kill-switch.
//!
//! [`CitationEngine::answer`] drives one question through the pipeline:
//!
//! ```text
//! retrieve_with_neighbors ──► rerank ──► (empty?) ──► REFUSED
//!                                           │
//!                                           ▼
//!                         build prompt ──► LlmClient::generate
//!                                           │
//!                                           ▼
//!                 strip <think> ──► parse [Source: …] ──► match to evidence
//!                                           │
//!                                           ▼
//!                    aggregate confidence ──► TRUSTED | FLAGGED
//! ```
//!
//! [`CitationEngine::answer_stream`] runs the same steps but forwards model
//! output as [`AnswerEvent::Token`]s while it arrives, then reports the
//! verdict as `Citations`, `Metadata` and `Done` events.
//!
//! Flagged answers are still returned; `low_confidence` tells the caller to
//! escalate instead of showing the text as-is.
//!
//! # Aggregate confidence
//!
//! | Citations in the answer | Aggregate |
//! |-------------------------|-----------|
//! | none parsed | mean calibrated confidence of all results |
//! | some match retrieved sources | mean calibrated confidence of the cited results |
//! | all unmatched | mean calibrated confidence of all results |
//!
//! Unmatched citations still carry a relevance of `0` and an empty quote.
//!
//! # Matching a cited name
//!
//! A cited name matches a result whose full path or file name equals it,
//! ignoring case. Only when no result matches that way does the file stem
//! count, so `[Source: noise]` finds `noise.md` but `[Source: noise.md]`
//! never picks up `noise.md.txt`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::llm::{LlmClient, TextStream};
use crate::models::{
    AnswerEvent, AnswerOutcome, ChatTurn, Citation, CitedAnswer, Classification, RetrievalResult,
};
use crate::rerank::rerank;
use crate::retrieve::Retriever;

/// Aggregate confidence below which an answer is flagged.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Fixed answer returned when nothing relevant was retrieved.
pub const REFUSAL: &str =
    "I cannot find the specific policy. Let me connect you with a staff member.";

/// Sampling temperature for answer generation.
pub const ANSWER_TEMPERATURE: f32 = 0.1;

/// Characters of matched chunk text kept as a citation quote.
const QUOTE_CHARS: usize = 200;

/// Conversation turns (user + assistant pairs) included in the prompt.
const MAX_HISTORY_TURNS: usize = 5;

static CITATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[source:\s*([^\]]+)\]").expect("citation regex"));

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex"));

/// Events of one streamed answer.
pub type AnswerStream = BoxStream<'static, Result<AnswerEvent>>;

/// Retrieval sizing for [`CitationEngine::answer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerOptions {
    /// Primaries fetched before re-ranking.
    pub candidate_count: usize,
    /// Results kept after re-ranking and shown to the model.
    pub final_count: usize,
    /// Neighbouring chunks pulled in around each primary.
    pub neighbor_window: u64,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            candidate_count: 10,
            final_count: 5,
            neighbor_window: 1,
        }
    }
}

/// Combines retrieval and generation into a [`CitedAnswer`].
pub struct CitationEngine {
    llm: Arc<dyn LlmClient>,
    retriever: Retriever,
    options: AnswerOptions,
}

impl CitationEngine {
    pub fn new(llm: Arc<dyn LlmClient>, retriever: Retriever) -> Self {
        Self::with_options(llm, retriever, AnswerOptions::default())
    }

    pub fn with_options(llm: Arc<dyn LlmClient>, retriever: Retriever, options: AnswerOptions) -> Self {
        Self {
            llm,
            retriever,
            options,
        }
    }

    /// Answer `question` from `collection`, citing retrieved evidence.
    ///
    /// Model errors propagate. An empty retrieval returns [`REFUSAL`]
    /// without calling the model.
    pub async fn answer(
        &self,
        question: &str,
        collection: &str,
        max_classification: Option<Classification>,
        history: &[ChatTurn],
    ) -> Result<CitedAnswer> {
        let results = self.evidence(question, collection, max_classification).await?;
        if results.is_empty() {
            info!(collection, outcome = "refused", "no evidence retrieved");
            return Ok(refusal());
        }

        let system_prompt = self.prompt_for(&results, history);
        let raw = self
            .llm
            .generate(question, Some(&system_prompt), ANSWER_TEMPERATURE)
            .await?;
        Ok(assess(&raw, &results, collection))
    }

    /// Streaming form of [`answer`](Self::answer).
    ///
    /// Retrieval and model connection errors are returned before any event.
    /// A failure while the model is producing text ends the stream with
    /// that error and no verdict.
    pub async fn answer_stream(
        &self,
        question: &str,
        collection: &str,
        max_classification: Option<Classification>,
        history: &[ChatTurn],
    ) -> Result<AnswerStream> {
        let results = self.evidence(question, collection, max_classification).await?;
        if results.is_empty() {
            info!(collection, outcome = "refused", "no evidence retrieved");
            let refused = refusal();
            let events = vec![
                Ok(AnswerEvent::Token {
                    text: refused.answer.clone(),
                }),
                Ok(metadata_event(&refused)),
                Ok(AnswerEvent::Done),
            ];
            return Ok(stream::iter(events).boxed());
        }

        let system_prompt = self.prompt_for(&results, history);
        let tokens = self
            .llm
            .generate_stream(question, Some(&system_prompt), ANSWER_TEMPERATURE)
            .await?;

        let state = Streaming {
            tokens,
            raw: String::new(),
            results,
            collection: collection.to_string(),
            pending: VecDeque::new(),
            finished: false,
        };
        Ok(stream::unfold(state, Streaming::advance).boxed())
    }

    async fn evidence(
        &self,
        question: &str,
        collection: &str,
        max_classification: Option<Classification>,
    ) -> Result<Vec<RetrievalResult>> {
        let candidates = self
            .retriever
            .retrieve_with_neighbors(
                question,
                collection,
                self.options.candidate_count,
                self.options.neighbor_window,
                max_classification,
            )
            .await?;
        Ok(rerank(question, candidates, self.options.final_count))
    }

    fn prompt_for(&self, results: &[RetrievalResult], history: &[ChatTurn]) -> String {
        let system_prompt = build_system_prompt(&format_history(history), &build_context_block(results));
        debug!(
            results = results.len(),
            prompt_chars = system_prompt.len(),
            model = self.llm.model_name(),
            "calling model"
        );
        system_prompt
    }
}

struct Streaming {
    tokens: TextStream,
    raw: String,
    results: Vec<RetrievalResult>,
    collection: String,
    pending: VecDeque<AnswerEvent>,
    finished: bool,
}

impl Streaming {
    async fn advance(mut self) -> Option<(Result<AnswerEvent>, Self)> {
        if let Some(event) = self.pending.pop_front() {
            return Some((Ok(event), self));
        }
        if self.finished {
            return None;
        }
        match self.tokens.next().await {
            Some(Ok(text)) => {
                self.raw.push_str(&text);
                Some((Ok(AnswerEvent::Token { text }), self))
            }
            Some(Err(e)) => {
                self.finished = true;
                Some((Err(e), self))
            }
            None => {
                self.finished = true;
                let verdict = assess(&self.raw, &self.results, &self.collection);
                self.pending.push_back(metadata_event(&verdict));
                self.pending.push_back(AnswerEvent::Done);
                Some((
                    Ok(AnswerEvent::Citations {
                        citations: verdict.citations,
                    }),
                    self,
                ))
            }
        }
    }
}

fn refusal() -> CitedAnswer {
    CitedAnswer {
        answer: REFUSAL.to_string(),
        citations: Vec::new(),
        confidence: 0.0,
        sources_used: 0,
        low_confidence: true,
        outcome: AnswerOutcome::Refused,
    }
}

fn metadata_event(answer: &CitedAnswer) -> AnswerEvent {
    AnswerEvent::Metadata {
        confidence: answer.confidence,
        low_confidence: answer.low_confidence,
        sources_used: answer.sources_used,
        outcome: answer.outcome,
    }
}

/// Turn raw model output into a verified answer.
fn assess(raw: &str, results: &[RetrievalResult], collection: &str) -> CitedAnswer {
    let answer = strip_think_tokens(raw);
    let citations = parse_citations(&answer, results);
    let confidence = aggregate_confidence(&citations, results);
    let low_confidence = confidence < LOW_CONFIDENCE_THRESHOLD;
    let sources_used = if citations.is_empty() {
        results.len()
    } else {
        citations.len()
    };

    let unmatched = citations.iter().filter(|c| c.quote.is_empty()).count();
    if unmatched > 0 {
        warn!(unmatched, "answer cites sources that were not retrieved");
    }
    let outcome = if low_confidence {
        AnswerOutcome::Flagged
    } else {
        AnswerOutcome::Trusted
    };
    info!(
        collection,
        confidence,
        citations = citations.len(),
        sources_used,
        ?outcome,
        "answer ready"
    );

    CitedAnswer {
        answer,
        citations,
        confidence,
        sources_used,
        low_confidence,
        outcome,
    }
}

/// Render the system prompt around a history block and a context block.
pub fn build_system_prompt(history_block: &str, context: &str) -> String {
    format!(
        "You are a helpful municipal government assistant. Answer the resident's \
question using ONLY the context provided below. Do not use outside knowledge.\n\
\n\
For every claim you make, cite the source using the format [Source: <filename>].\n\
\n\
If you cannot find the answer in the provided context, say: \"{REFUSAL}\"\n\
\n\
Do NOT include any <think> or reasoning tags in your answer.\n\
\n\
{history_block}Context:\n\
{context}\n\
\n\
/no_think\n"
    )
}

/// Enumerate results as `[i] Source: <file> (Section: <header>)` blocks.
pub fn build_context_block(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let section = match r.section_header() {
                Some(s) if !s.is_empty() => format!(" (Section: {})", s),
                _ => String::new(),
            };
            format!(
                "[{}] Source: {}{}\n{}",
                i + 1,
                display_name(&r.source),
                section,
                r.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Format the most recent conversation turns for the prompt.
///
/// Returns an empty string when there is nothing to show.
pub fn format_history(history: &[ChatTurn]) -> String {
    let start = history.len().saturating_sub(MAX_HISTORY_TURNS * 2);
    let lines: Vec<String> = history[start..]
        .iter()
        .filter(|turn| !turn.content.is_empty())
        .map(|turn| format!("{}: {}", capitalize(&turn.role), turn.content))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    format!("Conversation History:\n{}\n\n", lines.join("\n"))
}

/// Remove `<think>…</think>` blocks emitted by reasoning models.
pub fn strip_think_tokens(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

/// Extract `[Source: …]` citations, one per distinct source in first-seen
/// order, and match each against the retrieved evidence.
pub fn parse_citations(answer: &str, results: &[RetrievalResult]) -> Vec<Citation> {
    let mut seen: Vec<String> = Vec::new();
    let mut citations = Vec::new();

    for caps in CITATION.captures_iter(answer) {
        let name = caps[1].trim();
        if name.is_empty() {
            continue;
        }
        let key = name.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let best = matching_results(name, results)
            .into_iter()
            .map(|i| &results[i])
            .max_by(|a, b| {
                a.calibrated_confidence()
                    .partial_cmp(&b.calibrated_confidence())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        citations.push(match best {
            Some(r) => Citation {
                source: name.to_string(),
                section: r.section_header().map(str::to_string),
                quote: r.content.chars().take(QUOTE_CHARS).collect(),
                relevance_score: r.calibrated_confidence(),
            },
            None => Citation {
                source: name.to_string(),
                section: None,
                quote: String::new(),
                relevance_score: 0.0,
            },
        });
    }

    citations
}

/// Aggregate trust score for an answer, clamped to `[0, 1]`.
///
/// Averages the cited results; when the answer cites nothing that was
/// retrieved, averages every result instead.
pub fn aggregate_confidence(citations: &[Citation], results: &[RetrievalResult]) -> f64 {
    let mut cited: Vec<usize> = citations
        .iter()
        .flat_map(|c| matching_results(&c.source, results))
        .collect();
    cited.sort_unstable();
    cited.dedup();

    let scores: Vec<f64> = if cited.is_empty() {
        results.iter().map(|r| r.calibrated_confidence()).collect()
    } else {
        cited.iter().map(|&i| results[i].calibrated_confidence()).collect()
    };
    if scores.is_empty() {
        return 0.0;
    }
    (scores.iter().sum::<f64>() / scores.len() as f64).clamp(0.0, 1.0)
}

/// Indices of the results a cited name refers to.
///
/// Full path or file name matches win; the file stem is tried only when
/// neither matches anything. Comparisons ignore case.
fn matching_results(cited: &str, results: &[RetrievalResult]) -> Vec<usize> {
    let cited = cited.trim().to_lowercase();
    let name_matches = |source: &str, part: fn(&Path) -> Option<&std::ffi::OsStr>| {
        part(Path::new(source))
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_lowercase() == cited)
    };

    let exact: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.source.to_lowercase() == cited || name_matches(&r.source, Path::file_name))
        .map(|(i, _)| i)
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| name_matches(&r.source, Path::file_stem))
        .map(|(i, _)| i)
        .collect()
}

fn display_name(source: &str) -> &str {
    Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(source)
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => "User".to_string(),
    }
}
