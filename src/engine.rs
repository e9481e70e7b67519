//! The `PropertyRag` library facade.
//!
//! Wires the store, providers, and pipeline components together and exposes
//! the upward API: ingestion, record lookup, status, and question answering.
//!
//! ```rust,no_run
//! use property_rag::config::load_config;
//! use property_rag::engine::PropertyRag;
//! use property_rag::ingest::IngestRequest;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config("config/prag.toml".as_ref())?;
//! let rag = PropertyRag::open(&config).await?;
//!
//! let bytes = std::fs::read("mietvertrag.pdf")?;
//! let doc = rag.ingest(bytes, IngestRequest::new("mietvertrag.pdf")).await?;
//! println!("{} is {}", doc.id, doc.lifecycle());
//!
//! let result = rag.query("Wie hoch ist die Kaltmiete?", None).await?;
//! println!("{}", result.answer);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use property_rag_core::chunk::Tokenizer;
use property_rag_core::models::{
    Document, ExtractedRecord, QueryFilter, QueryResult, Stage, StageTransition,
};
use property_rag_core::store::Store;
use property_rag_core::{PipelineError, PipelineResult};

use crate::classify::Classifier;
use crate::config::{Config, LlmConfig, PipelineSettings};
use crate::db;
use crate::embedding::{check_provider_dims, create_provider, Embedder, EmbeddingProvider};
use crate::fields::FieldExtractor;
use crate::ingest::{IngestPipeline, IngestRequest};
use crate::llm::{create_completion_provider, Completer, CompletionProvider};
use crate::progress::ProgressReporter;
use crate::rag::AnswerSynthesizer;
use crate::retrieve::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::tokenizer::TiktokenTokenizer;

/// Everything [`PropertyRag`] is built from.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub completion: Arc<dyn CompletionProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub settings: PipelineSettings,
    pub llm: LlmConfig,
}

/// A document together with its full transition log.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    pub document: Document,
    pub transitions: Vec<StageTransition>,
}

pub struct PropertyRag {
    store: Arc<dyn Store>,
    pipeline: IngestPipeline,
    synthesizer: AnswerSynthesizer,
}

impl PropertyRag {
    pub fn from_components(components: Components) -> Self {
        let Components {
            store,
            completion,
            embedding,
            tokenizer,
            settings,
            llm,
        } = components;

        let completer = Completer::new(completion, &llm);
        let embedder = Embedder::new(embedding, &settings);
        tracing::debug!(
            llm = completer.provider_name(),
            embedding = embedder.model_name(),
            dims = embedder.dims(),
            "pipeline assembled"
        );
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            Classifier::new(completer.clone(), &settings),
            FieldExtractor::new(completer.clone(), &settings),
            embedder.clone(),
            tokenizer,
            &settings,
        );
        let retriever = Retriever::new(Arc::clone(&store), embedder, settings.retrieval);
        let synthesizer = AnswerSynthesizer::new(retriever, completer);

        Self {
            store,
            pipeline,
            synthesizer,
        }
    }

    /// Open the SQLite store and providers named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = SqliteStore::open(pool).await?;
        let embedding = create_provider(&config.embedding)?;
        let settings = config.pipeline_settings()?;
        check_provider_dims(embedding.as_ref(), settings.embedding_dims)?;
        Ok(Self::from_components(Components {
            store: Arc::new(store),
            completion: create_completion_provider(&config.llm)?,
            embedding,
            tokenizer: Arc::new(TiktokenTokenizer::cl100k()?),
            settings,
            llm: config.llm.clone(),
        }))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.pipeline = self.pipeline.with_progress(progress);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn ingest(&self, bytes: Vec<u8>, request: IngestRequest) -> PipelineResult<Document> {
        self.pipeline
            .ingest(bytes, request, &CancellationToken::new())
            .await
    }

    pub async fn ingest_with_cancel(
        &self,
        bytes: Vec<u8>,
        request: IngestRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<Document> {
        self.pipeline.ingest(bytes, request, cancel).await
    }

    pub async fn ingest_many(
        &self,
        uploads: Vec<(Vec<u8>, IngestRequest)>,
    ) -> Vec<PipelineResult<Document>> {
        self.pipeline
            .ingest_many(uploads, &CancellationToken::new())
            .await
    }

    /// The extracted record, or `None` while field extraction has not
    /// succeeded.
    pub async fn get_extracted_record(
        &self,
        document_id: &str,
    ) -> PipelineResult<Option<ExtractedRecord>> {
        self.require_document(document_id).await?;
        Ok(self.store.get_record(document_id).await?)
    }

    /// Answer `question` over the documents matching `filter`.
    pub async fn query(
        &self,
        question: &str,
        filter: Option<QueryFilter>,
    ) -> PipelineResult<QueryResult> {
        self.query_top_k(question, filter, None).await
    }

    /// Like [`query`](Self::query) with an explicit `top_k`.
    pub async fn query_top_k(
        &self,
        question: &str,
        filter: Option<QueryFilter>,
        top_k: Option<usize>,
    ) -> PipelineResult<QueryResult> {
        let filter = filter.unwrap_or_default();
        let result = self.synthesizer.answer(question, &filter, top_k).await?;
        tracing::info!(
            question = %question,
            citations = result.citations.len(),
            "query answered"
        );
        Ok(result)
    }

    pub async fn document_status(&self, document_id: &str) -> PipelineResult<DocumentStatus> {
        let document = self.require_document(document_id).await?;
        let transitions = self.store.transitions(document_id).await?;
        Ok(DocumentStatus {
            document,
            transitions,
        })
    }

    pub async fn list_documents(&self, project_id: Option<&str>) -> PipelineResult<Vec<Document>> {
        Ok(self.store.list_documents(project_id).await?)
    }

    pub async fn retry_stage(&self, document_id: &str, stage: Stage) -> PipelineResult<Document> {
        self.pipeline
            .retry_stage(document_id, stage, &CancellationToken::new())
            .await
    }

    pub async fn reingest(&self, document_id: &str, bytes: Vec<u8>) -> PipelineResult<Document> {
        self.pipeline
            .reingest(document_id, bytes, &CancellationToken::new())
            .await
    }

    async fn require_document(&self, document_id: &str) -> PipelineResult<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))
    }
}
