//! Vector similarity ranking.
//!
//! Stores hand back every embedded chunk that passes the query filter as a
//! [`VectorCandidate`]; [`rank_candidates`] scores them against the query
//! vector and keeps the best `top_k`.
//!
//! # Ordering
//!
//! Results are sorted by descending cosine similarity. Equal scores keep
//! chunk creation order (`ordinal`), so ranking is deterministic across
//! runs and stores.
//!
//! # Neighbor context
//!
//! [`expand_with_neighbors`] adds the chunks around each hit so the answer
//! model sees the surrounding text. Neighbors score
//! [`NEIGHBOR_SCORE_FACTOR`] times the hit that pulled them in, and the
//! expanded set is returned in reading order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::embedding::{check_dims, cosine_similarity};
use crate::error::{PipelineError, PipelineResult};
use crate::models::Chunk;

/// An embedded chunk eligible for retrieval.
#[derive(Debug, Clone)]
pub struct VectorCandidate {
    pub chunk: Chunk,
    pub filename: String,
    pub vector: Vec<f32>,
    /// Monotonic creation order of the chunk across the corpus.
    pub ordinal: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub filename: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    /// Candidates scoring below this are dropped before truncation.
    pub min_score: f32,
    /// Chunks before and after each hit added as context. `0` disables it.
    pub context_chunks: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
            context_chunks: 1,
        }
    }
}

pub const NEIGHBOR_SCORE_FACTOR: f32 = 0.9;

/// Rank `candidates` against `query`.
///
/// # Errors
///
/// - [`PipelineError::Config`] if `top_k` is zero.
/// - [`PipelineError::DimensionMismatch`] if the candidates do not share one
///   dimensionality, or the query's differs from theirs.
pub fn rank_candidates(
    query: &[f32],
    candidates: Vec<VectorCandidate>,
    params: RetrievalParams,
) -> PipelineResult<Vec<ScoredChunk>> {
    if params.top_k == 0 {
        return Err(PipelineError::Config("top_k must be >= 1".to_string()));
    }
    let Some(first) = candidates.first() else {
        return Ok(Vec::new());
    };
    let corpus_dims = first.vector.len();
    for c in &candidates {
        check_dims(corpus_dims, &c.vector)?;
    }
    check_dims(corpus_dims, query)?;

    let mut scored: Vec<(i64, ScoredChunk)> = candidates
        .into_iter()
        .filter_map(|c| {
            let score = cosine_similarity(query, &c.vector);
            (score >= params.min_score).then(|| {
                (
                    c.ordinal,
                    ScoredChunk {
                        chunk: c.chunk,
                        filename: c.filename,
                        score,
                    },
                )
            })
        })
        .collect();

    scored.sort_by(|(ord_a, a), (ord_b, b)| match b.score.total_cmp(&a.score) {
        Ordering::Equal => ord_a.cmp(ord_b),
        other => other,
    });
    scored.truncate(params.top_k);
    Ok(scored.into_iter().map(|(_, s)| s).collect())
}

/// Add the chunks within `window` positions of each hit.
///
/// `hits` must be in descending score order. `document_chunks` maps a
/// document id to its chunks. A chunk is included once: hits keep their own
/// score, and a neighbor takes its score from the best hit next to it.
/// Documents appear in the order of their best hit, and chunks within a
/// document by `chunk_index`.
pub fn expand_with_neighbors(
    hits: Vec<ScoredChunk>,
    document_chunks: &HashMap<String, Vec<Chunk>>,
    window: usize,
) -> Vec<ScoredChunk> {
    if window == 0 || hits.is_empty() {
        return hits;
    }

    let mut document_order: Vec<&str> = Vec::new();
    for hit in &hits {
        if !document_order.contains(&hit.chunk.document_id.as_str()) {
            document_order.push(&hit.chunk.document_id);
        }
    }

    let mut selected: HashMap<&str, ScoredChunk> = hits
        .iter()
        .map(|hit| (hit.chunk.id.as_str(), hit.clone()))
        .collect();
    let reach = window as i64;
    for hit in &hits {
        let Some(chunks) = document_chunks.get(&hit.chunk.document_id) else {
            continue;
        };
        let around = (hit.chunk.chunk_index - reach)..=(hit.chunk.chunk_index + reach);
        for neighbor in chunks.iter().filter(|c| around.contains(&c.chunk_index)) {
            selected
                .entry(neighbor.id.as_str())
                .or_insert_with(|| ScoredChunk {
                    chunk: neighbor.clone(),
                    filename: hit.filename.clone(),
                    score: hit.score * NEIGHBOR_SCORE_FACTOR,
                });
        }
    }

    let mut out: Vec<ScoredChunk> = selected.into_values().collect();
    out.sort_by_key(|s| {
        let doc = document_order
            .iter()
            .position(|d| *d == s.chunk.document_id)
            .unwrap_or(usize::MAX);
        (doc, s.chunk.chunk_index)
    });
    out
}
