//! # Ordinance RAG
//!
//! Cited answers to residents' questions about municipal rules.
//!
//! Ordinance text is chunked, tagged with a data classification and stored
//! in a vector store. Questions retrieve the closest chunks the caller is
//! cleared to see, a language model answers from them, and the answer's
//! `[Source: …]` citations are checked against what was retrieved before
//! the answer is trusted.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌───────────────┐
//! │  Ingester │──▶│ Chunk + Classify │──▶│ Vector store  │
//! │ file/dir  │   │                  │   │ SQLite/memory │
//! └───────────┘   └──────────────────┘   └──────┬────────┘
//!                                               │
//!         ┌──────────┐   ┌──────────┐   ┌───────▼───────┐
//!         │ Citation │◀──│ Reranker │◀──│   Retriever   │
//!         │  engine  │   └──────────┘   └───────────────┘
//!         └────┬─────┘
//!              ▼
//!         CitedAnswer (trusted / flagged / refused)
//! ```
//!
//! The store-independent pieces (models, chunker, retriever, reranker,
//! citation engine and the collaborator traits) live in
//! `ordinance-rag-core`. This crate adds configuration, persistence, HTTP
//! providers, the classification rules and the `ordrag` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! ordrag init
//! ordrag ingest ./ordinances
//! ordrag ask "When are quiet hours?"
//! ordrag search "parking permit" --neighbors --rerank
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`embedding`] | Embedding providers and fallback order |
//! | [`llm`] | Language-model providers |
//! | [`classification`] | Rule-based data classification |
//! | [`ingest`] | File and directory ingestion |
//! | [`pipeline`] | Assembled ingest/ask facade |
//! | [`commands`] | CLI command implementations |

pub mod classification;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod pipeline;
pub mod sqlite_store;
