//! Vector utilities shared by the stores and the retriever.
//!
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB codec for SQLite
//! - [`cosine_similarity`]: similarity score used for ranking
//! - [`check_dims`]: enforce the corpus-wide dimensionality
//!
//! Provider clients live in the `property-rag` app crate.

use crate::error::{PipelineError, PipelineResult};

/// Encode a float vector as a BLOB of `vec.len() × 4` little-endian bytes.
///
/// ```rust
/// use property_rag_core::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![0.25f32, -1.0, 8.5];
/// assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths. Callers that must reject mismatched lengths use [`check_dims`]
/// first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Fail with [`PipelineError::DimensionMismatch`] unless `vector` has `expected` entries.
pub fn check_dims(expected: usize, vector: &[f32]) -> PipelineResult<()> {
    if vector.len() != expected {
        return Err(PipelineError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
