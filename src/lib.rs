//! # PropertyRAG
//!
//! Document intelligence for real-estate PDFs: leases, appraisals, land
//! registry extracts, and utility statements.
//!
//! Uploaded PDFs are parsed into pages, classified, cut into token windows,
//! mined for typed fields, and embedded. Questions are answered from the
//! most similar chunks, with inline citations back to file and page.
//!
//! ## Architecture
//!
//! ```text
//!            ┌─────────────┐
//!  PDF ────▶ │  Extractor  │
//!            └──────┬──────┘
//!          ┌────────┴────────┐
//!          ▼                 ▼
//!   ┌────────────┐    ┌───────────┐
//!   │ Classifier │    │  Chunker  │
//!   └─────┬──────┘    └─────┬─────┘
//!         ▼                 ▼
//!   ┌────────────┐    ┌───────────┐       ┌──────────┐
//!   │   Fields   │    │ Embedder  │ ────▶ │  SQLite  │
//!   └────────────┘    └───────────┘       └────┬─────┘
//!                                              ▼
//!                          question ──▶ Retriever ──▶ Synthesizer ──▶ answer
//! ```
//!
//! Pure logic (models, schemas, chunking, ranking, citations) lives in
//! `property-rag-core`; this crate adds I/O, providers, and orchestration.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and pipeline settings |
//! | [`engine`] | `PropertyRag` library facade |
//! | [`ingest`] | Stage orchestration, retry, reingest |
//! | [`extract`] | PDF text extraction |
//! | [`classify`] | Document type classification |
//! | [`fields`] | Structured field extraction |
//! | [`tokenizer`] | `cl100k_base` tokenizer for chunking |
//! | [`embedding`] | Embedding providers and batching |
//! | [`llm`] | Completion providers |
//! | [`retry`] | Transient-error retry with backoff |
//! | [`retrieve`] | Vector retrieval |
//! | [`rag`] | Grounded answer synthesis |
//! | [`sqlite_store`] | SQLite persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`progress`] | Stage progress reporting |
//! | [`mock`] | Deterministic providers for tests |
//! | [`commands`] | CLI command implementations |

pub mod classify;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod fields;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod mock;
pub mod progress;
pub mod rag;
pub mod retrieve;
pub mod retry;
pub mod sqlite_store;
pub mod tokenizer;

pub use engine::{Components, DocumentStatus, PropertyRag};
pub use ingest::IngestRequest;
