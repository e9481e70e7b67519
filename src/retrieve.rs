//! Semantic retrieval over stored chunk embeddings.
//!
//! Candidates come from the [`Store`] already restricted by the query
//! filter; scoring and top-k selection happen in Rust via
//! [`rank_candidates`]. Queries over a partially ingested corpus see
//! whatever chunks have been embedded so far.
//!
//! [`Retriever::retrieve_with_context`] additionally pulls in the chunks
//! next to each hit, looked up by `chunk_index` in the hit's document.

use std::collections::HashMap;
use std::sync::Arc;

use property_rag_core::models::QueryFilter;
use property_rag_core::retrieval::{
    expand_with_neighbors, rank_candidates, RetrievalParams, ScoredChunk,
};
use property_rag_core::store::Store;
use property_rag_core::PipelineResult;

use crate::embedding::Embedder;

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Embedder,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, embedder: Embedder, params: RetrievalParams) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    /// Embed `query` and return its nearest chunks.
    ///
    /// `top_k` overrides the configured default when given.
    pub async fn retrieve(
        &self,
        query: &str,
        filter: &QueryFilter,
        top_k: Option<usize>,
    ) -> PipelineResult<Vec<ScoredChunk>> {
        let vector = self.embedder.embed_query(query).await?;
        self.search_vector(&vector, filter, top_k).await
    }

    /// Like [`Retriever::retrieve`], plus `context_chunks` neighbors on
    /// each side of every hit, in reading order.
    pub async fn retrieve_with_context(
        &self,
        query: &str,
        filter: &QueryFilter,
        top_k: Option<usize>,
    ) -> PipelineResult<Vec<ScoredChunk>> {
        let hits = self.retrieve(query, filter, top_k).await?;
        if self.params.context_chunks == 0 || hits.is_empty() {
            return Ok(hits);
        }

        let mut document_chunks = HashMap::new();
        for hit in &hits {
            let document_id = &hit.chunk.document_id;
            if !document_chunks.contains_key(document_id) {
                let chunks = self.store.get_chunks(document_id).await?;
                document_chunks.insert(document_id.clone(), chunks);
            }
        }

        let primary = hits.len();
        let expanded = expand_with_neighbors(hits, &document_chunks, self.params.context_chunks);
        tracing::debug!(primary, total = expanded.len(), "added neighbor context");
        Ok(expanded)
    }

    /// Rank stored chunks against an already embedded query.
    pub async fn search_vector(
        &self,
        vector: &[f32],
        filter: &QueryFilter,
        top_k: Option<usize>,
    ) -> PipelineResult<Vec<ScoredChunk>> {
        let params = RetrievalParams {
            top_k: top_k.unwrap_or(self.params.top_k),
            ..self.params
        };
        let candidates = self.store.vector_candidates(filter).await?;
        let total = candidates.len();
        let results = rank_candidates(vector, candidates, params)?;
        tracing::debug!(
            candidates = total,
            returned = results.len(),
            top_k = params.top_k,
            "retrieval complete"
        );
        Ok(results)
    }
}
