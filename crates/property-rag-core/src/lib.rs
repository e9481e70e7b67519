//! # PropertyRAG Core
//!
//! Runtime-agnostic logic for PropertyRAG: the document model, per-type
//! field schemas, value normalization, token-window chunking, the store
//! abstraction, similarity ranking, and citation parsing.
//!
//! This crate contains no tokio, sqlx, network, or filesystem code. The
//! `property-rag` app crate supplies PDF extraction, provider clients,
//! SQLite persistence, and the ingestion orchestrator.

pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieval;
pub mod schema;
pub mod store;
pub mod value;

pub use error::{PipelineError, PipelineResult};
