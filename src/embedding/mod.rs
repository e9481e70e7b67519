//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Providers make one HTTP attempt per call. [`Embedder`] adds what the
//! pipeline needs on top: batching, bounded exponential backoff for
//! transient failures, and the corpus-wide dimensionality check.
//!
//! # Provider Selection
//!
//! ```rust
//! # use property_rag::config::EmbeddingConfig;
//! # use property_rag::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Dimension mismatch → fail immediately
//! - Backoff: `backoff_ms`, then doubling (capped at 2^5 × base)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use property_rag_core::embedding::check_dims;
use property_rag_core::models::{Chunk, Embedding};
use property_rag_core::{PipelineError, PipelineResult};

use crate::config::{EmbeddingConfig, PipelineSettings};
use crate::retry::{retry_transient, ProviderError, RetryPolicy};

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed `texts` in one request. Vectors come back in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Instantiate the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Reject a provider whose vectors would not match the configured
/// dimensionality. A disabled provider reports `0` and always passes.
pub fn check_provider_dims(provider: &dyn EmbeddingProvider, configured: usize) -> Result<()> {
    let dims = provider.dims();
    if dims != 0 && dims != configured {
        bail!(
            "embedding provider {} produces {}-dimensional vectors but embedding.dims is {}",
            provider.model_name(),
            dims,
            configured
        );
    }
    Ok(())
}

// ============ Embedder ============

/// Batching, retrying front end over an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    dims: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, settings: &PipelineSettings) -> Self {
        Self {
            provider,
            dims: settings.embedding_dims,
            batch_size: settings.embedding_batch_size.max(1),
            retry: settings.embedding_retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed `texts`, one vector per input in input order.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::EmbeddingProvider`] once retries are exhausted or on a
    ///   permanent provider failure.
    /// - [`PipelineError::DimensionMismatch`] if any vector has the wrong length.
    pub async fn embed_texts(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let vectors = retry_transient("embedding", self.retry, || self.provider.embed(batch))
                .await
                .map_err(|e| PipelineError::EmbeddingProvider {
                    attempts: e.attempts,
                    message: e.last.to_string(),
                })?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::EmbeddingProvider {
                    attempts: 1,
                    message: format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    ),
                });
            }
            for v in &vectors {
                check_dims(self.dims, v)?;
            }
            tracing::debug!(batch = batch_no, size = batch.len(), "embedded batch");
            out.extend(vectors);
        }
        Ok(out)
    }

    pub async fn embed_query(&self, text: &str) -> PipelineResult<Vec<f32>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::EmbeddingProvider {
                attempts: 1,
                message: "empty embedding response".to_string(),
            })
    }

    /// Embed every chunk, preserving chunk order.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> PipelineResult<Vec<Embedding>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_texts(&texts).await?;
        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                model: self.model_name().to_string(),
                vector,
            })
            .collect())
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Permanent(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            model,
            dims,
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json).map_err(|e| ProviderError::Permanent(e.to_string()))
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays, ordered by their `index` field.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        indexed.push((index, to_f32_vec(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn to_f32_vec(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding value: {}", v))
        })
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured Ollama URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("Ollama", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_response(&json).map_err(|e| ProviderError::Permanent(e.to_string()))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding.as_array().ok_or_else(|| {
                anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
            })?;
            to_f32_vec(values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FlakyEmbedder, HashEmbedder};
    use serde_json::json;

    fn settings(dims: usize, batch: usize) -> PipelineSettings {
        let mut s = PipelineSettings::with_dims(dims).unwrap();
        s.embedding_batch_size = batch;
        s.embedding_retry = RetryPolicy::immediate(3);
        s
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_openai_response(&json!({"error": "x"})).is_err());
        assert!(parse_openai_response(&json!({"data": [{"embedding": ["a"]}]})).is_err());
        assert!(parse_ollama_response(&json!({"embeddings": [1.0]})).is_err());
        let ok = parse_ollama_response(&json!({"embeddings": [[0.25, 1.0]]})).unwrap();
        assert_eq!(ok, vec![vec![0.25, 1.0]]);
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = Arc::new(HashEmbedder::new(16));
        let embedder = Embedder::new(provider.clone(), &settings(16, 2));
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let batched = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(batched.len(), 5);
        for (text, v) in texts.iter().zip(&batched) {
            assert_eq!(*v, provider.vector_for(text));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(FlakyEmbedder::new(HashEmbedder::new(8), 2));
        let embedder = Embedder::new(provider.clone(), &settings(8, 64));
        let out = embedder.embed_texts(&["a".to_string()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_provider_error() {
        let provider = Arc::new(FlakyEmbedder::new(HashEmbedder::new(8), 10));
        let embedder = Embedder::new(provider, &settings(8, 64));
        let err = embedder.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmbeddingProvider { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let provider = Arc::new(HashEmbedder::new(4));
        let embedder = Embedder::new(provider, &settings(8, 64));
        let err = embedder.embed_query("hello").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_provider_dims_checked_against_config() {
        assert!(check_provider_dims(&HashEmbedder::new(8), 8).is_ok());
        assert!(check_provider_dims(&DisabledProvider, 1536).is_ok());
        let err = check_provider_dims(&HashEmbedder::new(4), 8).unwrap_err();
        assert!(err.to_string().contains("embedding.dims is 8"));
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_without_retry() {
        let embedder = Embedder::new(Arc::new(DisabledProvider), &settings(8, 64));
        let err = embedder.embed_query("hello").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmbeddingProvider { attempts: 1, .. }
        ));
    }
}
