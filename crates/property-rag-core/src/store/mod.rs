//! Storage abstraction for PropertyRAG.
//!
//! The [`Store`] trait covers everything the orchestrator and retriever
//! persist: documents with their stage maps, raw PDF bytes, pages, chunks,
//! embeddings, extracted records, and the stage transition log.
//!
//! Backends: [`memory::InMemoryStore`] here, and the SQLite store in the
//! app crate. Implementations must be `Send + Sync`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Chunk, Document, Embedding, ExtractedRecord, Page, QueryFilter, StageTransition,
};
use crate::retrieval::VectorCandidate;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save_document`](Store::save_document) | Insert or update a document and its stage map |
/// | [`save_source`](Store::save_source) | Keep the raw PDF bytes for re-runs |
/// | [`replace_pages`](Store::replace_pages) | Replace the extracted pages of a document |
/// | [`replace_chunks`](Store::replace_chunks) | Replace a document's chunks (drops its embeddings) |
/// | [`replace_embeddings`](Store::replace_embeddings) | Replace a document's embeddings |
/// | [`save_record`](Store::save_record) | Upsert the extracted field record |
/// | [`append_transition`](Store::append_transition) | Log a stage state change |
/// | [`vector_candidates`](Store::vector_candidates) | Embedded chunks eligible for a query |
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documents ordered by creation time, optionally limited to one project.
    async fn list_documents(&self, project_id: Option<&str>) -> Result<Vec<Document>>;

    async fn save_source(&self, document_id: &str, bytes: &[u8]) -> Result<()>;

    async fn get_source(&self, document_id: &str) -> Result<Option<Vec<u8>>>;

    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()>;

    /// Pages in page-number order.
    async fn get_pages(&self, document_id: &str) -> Result<Vec<Page>>;

    /// Replace all chunks of a document. Embeddings of the old chunks are removed.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks in `chunk_index` order.
    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn replace_embeddings(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()>;

    async fn count_embeddings(&self, document_id: &str) -> Result<usize>;

    async fn save_record(&self, record: &ExtractedRecord) -> Result<()>;

    async fn get_record(&self, document_id: &str) -> Result<Option<ExtractedRecord>>;

    /// Remove pages, chunks, embeddings, and the record of a document.
    async fn clear_derived(&self, document_id: &str) -> Result<()>;

    async fn append_transition(&self, transition: &StageTransition) -> Result<()>;

    /// Transitions of a document in the order they were appended.
    async fn transitions(&self, document_id: &str) -> Result<Vec<StageTransition>>;

    /// Every embedded chunk whose document passes `filter`.
    async fn vector_candidates(&self, filter: &QueryFilter) -> Result<Vec<VectorCandidate>>;
}
