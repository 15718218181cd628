//! Core data models used throughout Ordinance RAG.
//!
//! These types represent the documents, chunks, search hits, and cited
//! answers that flow through the ingestion and answer pipeline.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Ordered key → value metadata attached to every stored document.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Access-control level attached to stored content.
///
/// Variants are declared in increasing order of restriction, so the derived
/// `Ord` gives `Public < Internal < Sensitive < Restricted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Internal,
    Sensitive,
    Restricted,
}

impl Classification {
    pub const ALL: [Classification; 4] = [
        Classification::Public,
        Classification::Internal,
        Classification::Sensitive,
        Classification::Restricted,
    ];

    /// Numeric rank used by store adapters for filtering.
    ///
    /// Never surfaced in search results or metadata.
    pub fn rank(self) -> i64 {
        match self {
            Classification::Public => 1,
            Classification::Internal => 2,
            Classification::Sensitive => 3,
            Classification::Restricted => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Public => "public",
            Classification::Internal => "internal",
            Classification::Sensitive => "sensitive",
            Classification::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Classification::Public),
            "internal" => Ok(Classification::Internal),
            "sensitive" => Ok(Classification::Sensitive),
            "restricted" => Ok(Classification::Restricted),
            other => bail!(
                "Unknown classification: '{}'. Must be public, internal, sensitive, or restricted.",
                other
            ),
        }
    }
}

/// Contextual hints consulted by a [`Classifier`](crate::classify::Classifier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyContext {
    /// The caller is unsure what the resource contains.
    #[serde(default)]
    pub uncertain: bool,
    /// The resource came from outside the municipality.
    #[serde(default)]
    pub external_source: bool,
}

/// A chunk-sized document handed to a vector store. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub classification: Classification,
}

/// A bounded span of a source document's text, produced at ingest time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Most recent markdown heading at or above this chunk.
    pub section_header: Option<String>,
    /// Sequential across the whole source document.
    pub chunk_index: usize,
}

/// Raw output of a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub classification: Classification,
    /// Non-negative distance; smaller is closer.
    pub distance: f64,
}

/// A [`SearchResult`] enriched with a calibrated confidence score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub content: String,
    /// Source file the chunk came from (`"unknown"` when not recorded).
    pub source: String,
    pub chunk_id: String,
    pub distance: f64,
    /// Calibrated confidence in `[0, 1]`, or the combined re-rank score
    /// after [`rerank`](crate::rerank::rerank) has run.
    pub confidence_score: f64,
    pub metadata: Metadata,
}

impl RetrievalResult {
    /// Calibrated confidence derived from `distance`, independent of any
    /// re-ranking that may have overwritten `confidence_score`.
    pub fn calibrated_confidence(&self) -> f64 {
        crate::retrieve::distance_to_confidence(self.distance)
    }

    pub fn section_header(&self) -> Option<&str> {
        self.metadata.get("section_header").and_then(|v| v.as_str())
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata.get("chunk_index").and_then(|v| v.as_u64())
    }
}

/// A model-asserted reference to a source, cross-checked against retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub section: Option<String>,
    /// First 200 characters of the matched chunk; empty when unmatched.
    pub quote: String,
    pub relevance_score: f64,
}

/// Terminal state of a single answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    /// Nothing was retrieved; the fixed refusal was returned without a model call.
    Refused,
    /// Aggregate confidence met the threshold.
    Trusted,
    /// Aggregate confidence fell below the threshold; the caller decides what to do.
    Flagged,
}

/// The sole artifact exposed to the calling chat service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: f64,
    pub sources_used: usize,
    pub low_confidence: bool,
    pub outcome: AnswerOutcome,
}

/// One event of a streamed answer.
///
/// A stream is `Token*`, then `Citations` (omitted on refusal), then
/// `Metadata`, then `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Token {
        text: String,
    },
    Citations {
        citations: Vec<Citation>,
    },
    Metadata {
        confidence: f64,
        low_confidence: bool,
        sources_used: usize,
        outcome: AnswerOutcome,
    },
    Done,
}

/// One prior message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Summary of ingesting a single file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    pub source_path: String,
    pub num_chunks: usize,
    pub collection: String,
    pub classification: Classification,
    pub chunk_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_total_order() {
        assert!(Classification::Public < Classification::Internal);
        assert!(Classification::Internal < Classification::Sensitive);
        assert!(Classification::Sensitive < Classification::Restricted);
        let ranks: Vec<i64> = Classification::ALL.iter().map(|c| c.rank()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_classification_parse_and_display() {
        for c in Classification::ALL {
            assert_eq!(c.to_string().parse::<Classification>().unwrap(), c);
        }
        assert_eq!(
            " Internal ".parse::<Classification>().unwrap(),
            Classification::Internal
        );
        assert!("secret".parse::<Classification>().is_err());
    }

    #[test]
    fn test_classification_serde_lowercase() {
        let json = serde_json::to_string(&Classification::Sensitive).unwrap();
        assert_eq!(json, "\"sensitive\"");
        let back: Classification = serde_json::from_str("\"restricted\"").unwrap();
        assert_eq!(back, Classification::Restricted);
    }

    #[test]
    fn test_answer_events_are_type_tagged() {
        let token = serde_json::to_value(AnswerEvent::Token {
            text: "Quiet".to_string(),
        })
        .unwrap();
        assert_eq!(token, serde_json::json!({ "type": "token", "text": "Quiet" }));
        let done = serde_json::to_value(AnswerEvent::Done).unwrap();
        assert_eq!(done, serde_json::json!({ "type": "done" }));
    }
}
