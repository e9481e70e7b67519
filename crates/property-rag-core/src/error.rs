//! Error taxonomy shared by every pipeline component.

use thiserror::Error;

use crate::models::Stage;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The bytes are not a parseable PDF, or the PDF has no extractable text.
    #[error("unreadable PDF: {0}")]
    UnreadablePdf(String),

    #[error("invalid chunk config: chunk_size={chunk_size}, overlap={overlap} (overlap must be < chunk_size and chunk_size > 0)")]
    InvalidChunkConfig { chunk_size: usize, overlap: usize },

    #[error("embedding provider failed after {attempts} attempt(s): {message}")]
    EmbeddingProvider { attempts: u32, message: String },

    #[error("completion provider failed after {attempts} attempt(s): {message}")]
    CompletionProvider { attempts: u32, message: String },

    #[error("extraction response did not match the {document_type} schema after {attempts} attempt(s): {message}")]
    ExtractionSchema {
        document_type: String,
        attempts: u32,
        message: String,
    },

    /// A vector's length differs from the configured corpus dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("cannot retry stage {stage} of document {document_id}: {reason}")]
    InvalidRetry {
        document_id: String,
        stage: Stage,
        reason: String,
    },

    #[error("ingestion cancelled before stage {0}")]
    Cancelled(Stage),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a caller may reasonably retry the same call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingProvider { .. } | PipelineError::CompletionProvider { .. }
        )
    }
}
