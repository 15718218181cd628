//! # Ordinance RAG Core
//!
//! I/O-free logic for Ordinance RAG: data models, chunking, the
//! classification-aware store abstraction, retrieval with calibrated
//! confidence, re-ranking, and citation verification.
//!
//! This crate contains no sqlx, HTTP clients, or filesystem I/O. Concrete
//! stores, embedders and model clients are injected through the
//! [`store::VectorStore`], [`embedding::Embedder`] and [`llm::LlmClient`]
//! traits.

pub mod chunk;
pub mod citation;
pub mod classify;
pub mod embedding;
pub mod llm;
pub mod models;
pub mod rerank;
pub mod retrieve;
pub mod store;
