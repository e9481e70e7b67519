//! In-memory [`Store`] implementation for tests and embedding in other hosts.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Chunks receive a monotonic
//! ordinal when stored, mirroring the SQLite `seq` column, so retrieval
//! tie-breaking behaves the same on both backends.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    Chunk, Document, Embedding, ExtractedRecord, Page, QueryFilter, StageTransition,
};
use crate::retrieval::VectorCandidate;

use super::Store;

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    sources: HashMap<String, Vec<u8>>,
    pages: HashMap<String, Vec<Page>>,
    /// Per document: `(ordinal, chunk)` in chunk order.
    chunks: HashMap<String, Vec<(i64, Chunk)>>,
    /// Per document: chunk id → embedding.
    embeddings: HashMap<String, HashMap<String, Embedding>>,
    records: HashMap<String, ExtractedRecord>,
    transitions: Vec<StageTransition>,
    next_ordinal: i64,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_document(&self, doc: &Document) -> Result<()> {
        self.write()?.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(id).cloned())
    }

    async fn list_documents(&self, project_id: Option<&str>) -> Result<Vec<Document>> {
        let tables = self.read()?;
        let mut docs: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| project_id.is_none() || d.project_id.as_deref() == project_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn save_source(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        self.write()?
            .sources
            .insert(document_id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_source(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.sources.get(document_id).cloned())
    }

    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()> {
        self.write()?
            .pages
            .insert(document_id.to_string(), pages.to_vec());
        Ok(())
    }

    async fn get_pages(&self, document_id: &str) -> Result<Vec<Page>> {
        let mut pages = self
            .read()?
            .pages
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        pages.sort_by_key(|p| p.number);
        Ok(pages)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tables = self.write()?;
        tables.embeddings.remove(document_id);
        let mut stored = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            tables.next_ordinal += 1;
            stored.push((tables.next_ordinal, chunk.clone()));
        }
        tables.chunks.insert(document_id.to_string(), stored);
        Ok(())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let tables = self.read()?;
        let mut chunks: Vec<Chunk> = tables
            .chunks
            .get(document_id)
            .map(|cs| cs.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn replace_embeddings(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()> {
        let mut tables = self.write()?;
        let known: Vec<String> = tables
            .chunks
            .get(document_id)
            .map(|cs| cs.iter().map(|(_, c)| c.id.clone()).collect())
            .unwrap_or_default();
        let mut by_chunk = HashMap::with_capacity(embeddings.len());
        for e in embeddings {
            if !known.contains(&e.chunk_id) {
                return Err(anyhow!(
                    "embedding references unknown chunk {} of document {}",
                    e.chunk_id,
                    document_id
                ));
            }
            by_chunk.insert(e.chunk_id.clone(), e.clone());
        }
        tables.embeddings.insert(document_id.to_string(), by_chunk);
        Ok(())
    }

    async fn count_embeddings(&self, document_id: &str) -> Result<usize> {
        Ok(self
            .read()?
            .embeddings
            .get(document_id)
            .map(HashMap::len)
            .unwrap_or(0))
    }

    async fn save_record(&self, record: &ExtractedRecord) -> Result<()> {
        self.write()?
            .records
            .insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, document_id: &str) -> Result<Option<ExtractedRecord>> {
        Ok(self.read()?.records.get(document_id).cloned())
    }

    async fn clear_derived(&self, document_id: &str) -> Result<()> {
        let mut tables = self.write()?;
        tables.pages.remove(document_id);
        tables.chunks.remove(document_id);
        tables.embeddings.remove(document_id);
        tables.records.remove(document_id);
        Ok(())
    }

    async fn append_transition(&self, transition: &StageTransition) -> Result<()> {
        self.write()?.transitions.push(transition.clone());
        Ok(())
    }

    async fn transitions(&self, document_id: &str) -> Result<Vec<StageTransition>> {
        Ok(self
            .read()?
            .transitions
            .iter()
            .filter(|t| t.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn vector_candidates(&self, filter: &QueryFilter) -> Result<Vec<VectorCandidate>> {
        let tables = self.read()?;
        let mut out = Vec::new();
        for doc in tables.documents.values().filter(|d| filter.matches(d)) {
            let (Some(chunks), Some(vectors)) =
                (tables.chunks.get(&doc.id), tables.embeddings.get(&doc.id))
            else {
                continue;
            };
            for (ordinal, chunk) in chunks {
                if let Some(e) = vectors.get(&chunk.id) {
                    out.push(VectorCandidate {
                        chunk: chunk.clone(),
                        filename: doc.filename.clone(),
                        vector: e.vector.clone(),
                        ordinal: *ordinal,
                    });
                }
            }
        }
        out.sort_by_key(|c| c.ordinal);
        Ok(out)
    }
}
