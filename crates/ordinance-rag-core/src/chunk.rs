//! Heading-aware paragraph chunker.
//!
//! Splits document text into [`Chunk`]s bounded by a configurable
//! `max_chars` limit. Splitting happens on blank-line paragraph boundaries
//! first, then on sentence boundaries, and only as a last resort on a raw
//! character count.
//!
//! # Algorithm
//!
//! 1. Split text on blank lines into paragraphs; skip empty ones.
//! 2. A paragraph starting with a markdown heading (`#` .. `######`) sets the
//!    current section header. The heading paragraph is itself a chunk and
//!    carries its own text as header.
//! 3. A paragraph longer than `max_chars` is split on `.`, `!` or `?`
//!    followed by whitespace. Without any sentence boundary (or for a single
//!    sentence that is itself too long) it is hard-split at `max_chars`,
//!    snapped back to the last whitespace in the window when there is one.
//! 4. Adjacent sub-chunks of one paragraph are merged while the merge still
//!    fits in `max_chars`, so long paragraphs do not shatter into tiny
//!    fragments.
//! 5. `chunk_index` runs sequentially across the whole document.
//!
//! # Example
//!
//! ```rust
//! use ordinance_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("# Quiet Hours\n\nQuiet hours are 10 PM to 7 AM.", 500);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].section_header.as_deref(), Some("Quiet Hours"));
//! assert_eq!(chunks[1].chunk_index, 1);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Chunk;

/// Default chunk size threshold, in characters.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 500;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").expect("paragraph regex"));

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#{1,6}[ \t]+([^\r\n]+)").expect("heading regex"));

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence regex"));

/// Split text into heading-aware chunks of at most `max_chars` characters.
///
/// # Guarantees
///
/// - Empty or whitespace-only input yields an empty vector.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - No chunk exceeds `max_chars` characters (a zero limit is treated as 1).
/// - Splits never land inside a UTF-8 code point.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current_header: Option<String> = None;

    for para in PARAGRAPH_BREAK.split(text) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if let Some(header) = detect_section_header(para) {
            current_header = Some(header);
        }

        let pieces = if char_len(para) > max_chars {
            split_paragraph(para, max_chars)
        } else {
            vec![para.to_string()]
        };

        for piece in pieces {
            let chunk_index = chunks.len();
            chunks.push(Chunk {
                text: piece,
                section_header: current_header.clone(),
                chunk_index,
            });
        }
    }

    chunks
}

/// Return the heading text if `paragraph` starts with a markdown heading.
pub fn detect_section_header(paragraph: &str) -> Option<String> {
    let caps = HEADING.captures(paragraph)?;
    let raw = caps.get(1)?.as_str().trim();
    // Optional closing sequence: "## Title ##".
    let without_closing = raw.trim_end_matches('#');
    let header = if without_closing.ends_with(char::is_whitespace) {
        without_closing.trim_end()
    } else {
        raw
    };
    if header.is_empty() {
        None
    } else {
        Some(header.to_string())
    }
}

/// Split an oversized paragraph on sentence boundaries, then merge the
/// pieces back up to `max_chars`.
fn split_paragraph(para: &str, max_chars: usize) -> Vec<String> {
    let sentences = split_sentences(para);
    if sentences.len() <= 1 {
        return hard_split(para, max_chars);
    }

    let mut pieces = Vec::with_capacity(sentences.len());
    for sentence in sentences {
        if char_len(sentence) > max_chars {
            pieces.extend(hard_split(sentence, max_chars));
        } else {
            pieces.push(sentence.to_string());
        }
    }

    merge_adjacent(pieces, max_chars)
}

/// Split on `[.!?]` followed by whitespace, keeping the punctuation.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        sentences.push(text[start..m.end()].trim());
        start = m.end();
    }
    if start < text.len() {
        sentences.push(text[start..].trim());
    }
    sentences.retain(|s| !s.is_empty());
    sentences
}

/// Split on a character count, preferring the last whitespace in each window.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = text.trim();

    while !remaining.is_empty() {
        if char_len(remaining) <= max_chars {
            pieces.push(remaining.to_string());
            break;
        }

        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let split_at = match remaining[..limit].rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };

        let piece = remaining[..split_at].trim_end();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    pieces
}

fn merge_adjacent(pieces: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let Some(last) = merged.last_mut() {
            if char_len(last) + 1 + char_len(&piece) <= max_chars {
                last.push(' ');
                last.push_str(&piece);
                continue;
            }
        }
        merged.push(piece);
    }
    merged
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
