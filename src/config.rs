//! Configuration parsing and validation.
//!
//! PropertyRAG is configured with a TOML file (default `./config/prag.toml`).
//! Every section except `[db]` may be omitted and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/prag.sqlite"
//!
//! [chunking]
//! chunk_size = 512
//! overlap = 50
//!
//! [retrieval]
//! top_k = 5
//! min_score = 0.3
//! context_chunks = 1
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o"
//! ```
//!
//! API keys are never read from the file. The OpenAI providers take
//! `OPENAI_API_KEY` from the environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use property_rag_core::chunk::ChunkConfig;
use property_rag_core::retrieval::RetrievalParams;
use property_rag_core::value::DEFAULT_CURRENCY;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Token window settings. Both values are in tokenizer tokens.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Neighboring chunks added on each side of a hit when answering.
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            context_chunks: default_context_chunks(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.3
}
fn default_context_chunks() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_embedding_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_llm_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_llm_timeout_secs(),
            url: None,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_llm_timeout_secs() -> u64 {
    60
}

/// Stage limits and retry counts for the ingestion pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Characters of leading text shown to the classifier.
    #[serde(default = "default_classify_chars")]
    pub classify_chars: usize,
    /// Extra classification attempts after the first.
    #[serde(default = "default_stage_retries")]
    pub classify_retries: u32,
    /// Corrective re-prompts after an unparseable extraction response.
    #[serde(default = "default_stage_retries")]
    pub extract_retries: u32,
    #[serde(default = "default_max_extraction_chars")]
    pub max_extraction_chars: usize,
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    /// Currency assumed for amounts that name none.
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classify_chars: default_classify_chars(),
            classify_retries: default_stage_retries(),
            extract_retries: default_stage_retries(),
            max_extraction_chars: default_max_extraction_chars(),
            max_concurrent_documents: default_max_concurrent_documents(),
            default_currency: default_currency(),
        }
    }
}

fn default_classify_chars() -> usize {
    3000
}
fn default_stage_retries() -> u32 {
    2
}
fn default_max_extraction_chars() -> usize {
    60_000
}
fn default_max_concurrent_documents() -> usize {
    4
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

/// Immutable settings handed to pipeline components at construction.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalParams,
    /// Corpus-wide embedding dimensionality.
    pub embedding_dims: usize,
    pub embedding_batch_size: usize,
    pub embedding_retry: RetryPolicy,
    pub classify_chars: usize,
    pub classify_retries: u32,
    pub extract_retries: u32,
    pub max_extraction_chars: usize,
    pub max_concurrent_documents: usize,
    pub default_currency: String,
}

impl PipelineSettings {
    /// Settings with every default and the given embedding dimensionality.
    pub fn with_dims(embedding_dims: usize) -> Result<Self> {
        let pipeline = PipelineConfig::default();
        let chunking = ChunkingConfig::default();
        Ok(Self {
            chunking: ChunkConfig::new(chunking.chunk_size, chunking.overlap)?,
            retrieval: RetrievalParams::default(),
            embedding_dims,
            embedding_batch_size: default_batch_size(),
            embedding_retry: EmbeddingConfig::default().retry_policy(),
            classify_chars: pipeline.classify_chars,
            classify_retries: pipeline.classify_retries,
            extract_retries: pipeline.extract_retries,
            max_extraction_chars: pipeline.max_extraction_chars,
            max_concurrent_documents: pipeline.max_concurrent_documents,
            default_currency: pipeline.default_currency,
        })
    }
}

impl Config {
    /// Build the [`PipelineSettings`] for this configuration.
    ///
    /// With embeddings disabled the dimensionality is reported as `0`;
    /// ingestion then fails at the embedding stage.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            chunking: ChunkConfig::new(self.chunking.chunk_size, self.chunking.overlap)?,
            retrieval: RetrievalParams {
                top_k: self.retrieval.top_k,
                min_score: self.retrieval.min_score,
                context_chunks: self.retrieval.context_chunks,
            },
            embedding_dims: self.embedding.dims.unwrap_or(0),
            embedding_batch_size: self.embedding.batch_size,
            embedding_retry: self.embedding.retry_policy(),
            classify_chars: self.pipeline.classify_chars,
            classify_retries: self.pipeline.classify_retries,
            extract_retries: self.pipeline.extract_retries,
            max_extraction_chars: self.pipeline.max_extraction_chars,
            max_concurrent_documents: self.pipeline.max_concurrent_documents,
            default_currency: self.pipeline.default_currency.clone(),
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    ChunkConfig::new(config.chunking.chunk_size, config.chunking.overlap)
        .with_context(|| "Invalid [chunking] section")?;

    // Retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_attempts == 0 {
        anyhow::bail!("embedding.max_attempts must be >= 1");
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.llm.max_attempts == 0 {
        anyhow::bail!("llm.max_attempts must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.llm.is_enabled() && config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0 when provider is '{}'", config.llm.provider);
    }

    // Pipeline
    if config.pipeline.classify_chars == 0 {
        anyhow::bail!("pipeline.classify_chars must be > 0");
    }
    if config.pipeline.max_extraction_chars == 0 {
        anyhow::bail!("pipeline.max_extraction_chars must be > 0");
    }
    if config.pipeline.max_concurrent_documents == 0 {
        anyhow::bail!("pipeline.max_concurrent_documents must be >= 1");
    }

    Ok(())
}
