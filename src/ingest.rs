//! Ingestion orchestration.
//!
//! Runs one document through the stage graph:
//!
//! ```text
//! extraction ──┬──▶ classification ──▶ field_extraction
//!              └──▶ chunking ─────────▶ embedding
//! ```
//!
//! Classification and chunking run concurrently, then field extraction and
//! embedding. The concurrent halves only compute; their outcomes are applied
//! to the [`Document`] one at a time afterwards, each as a persisted stage
//! transition. A failed stage never rolls back stages that already
//! succeeded, and stages that depend on it stay `pending`.
//!
//! Cancellation is checked between phases. Stages that had not started
//! become `cancelled`; finished stages keep their results.
//!
//! `failed` and `cancelled` are left only through [`IngestPipeline::retry_stage`],
//! which re-runs the stage from persisted inputs plus every dependent that
//! has not succeeded, or [`IngestPipeline::reingest`], which starts over
//! with new bytes.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use property_rag_core::chunk::{chunk_pages, ChunkConfig, Tokenizer};
use property_rag_core::models::{
    join_pages, sha256_hex, Chunk, Document, DocumentType, Page, Stage, StageState,
    StageTransition,
};
use property_rag_core::store::Store;
use property_rag_core::{PipelineError, PipelineResult};

use crate::classify::Classifier;
use crate::config::PipelineSettings;
use crate::embedding::Embedder;
use crate::extract::extract_pages;
use crate::fields::FieldExtractor;
use crate::progress::{NoProgress, ProgressReporter, StageEvent};

/// Upload metadata accompanying the PDF bytes.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub filename: String,
    pub declared_type: Option<DocumentType>,
    pub project_id: Option<String>,
}

impl IngestRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn declared(mut self, document_type: DocumentType) -> Self {
        self.declared_type = Some(document_type);
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

pub struct IngestPipeline {
    store: Arc<dyn Store>,
    classifier: Classifier,
    fields: FieldExtractor,
    embedder: Embedder,
    tokenizer: Arc<dyn Tokenizer>,
    chunking: ChunkConfig,
    max_concurrent_documents: usize,
    progress: Arc<dyn ProgressReporter>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Classifier,
        fields: FieldExtractor,
        embedder: Embedder,
        tokenizer: Arc<dyn Tokenizer>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            store,
            classifier,
            fields,
            embedder,
            tokenizer,
            chunking: settings.chunking,
            max_concurrent_documents: settings.max_concurrent_documents.max(1),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Store `bytes` as a new document and run every stage.
    ///
    /// Stage failures are recorded on the returned document, not returned
    /// as errors. `Err` means the store itself failed.
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        request: IngestRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<Document> {
        let mut doc = Document::new(
            &request.filename,
            &bytes,
            request.project_id,
            request.declared_type,
            Utc::now().timestamp(),
        );
        self.store.save_document(&doc).await?;
        self.store.save_source(&doc.id, &bytes).await?;
        tracing::info!(
            document_id = %doc.id,
            filename = %doc.filename,
            bytes = bytes.len(),
            "document uploaded"
        );

        let all: BTreeSet<Stage> = Stage::ALL.into_iter().collect();
        self.run(&mut doc, &all, cancel).await?;
        tracing::info!(document_id = %doc.id, lifecycle = %doc.lifecycle(), "ingestion finished");
        Ok(doc)
    }

    /// Ingest independent documents, at most `max_concurrent_documents` at
    /// a time. Results are in input order.
    pub async fn ingest_many(
        &self,
        uploads: Vec<(Vec<u8>, IngestRequest)>,
        cancel: &CancellationToken,
    ) -> Vec<PipelineResult<Document>> {
        stream::iter(uploads)
            .map(|(bytes, request)| self.ingest(bytes, request, cancel))
            .buffered(self.max_concurrent_documents)
            .collect::<Vec<_>>()
            .await
    }

    /// Re-run a failed or cancelled `stage`, then its dependents that have
    /// not succeeded.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::DocumentNotFound`] for an unknown id.
    /// - [`PipelineError::InvalidRetry`] when the stage is not failed or
    ///   cancelled, a prerequisite has not succeeded, or the stored inputs
    ///   are missing.
    pub async fn retry_stage(
        &self,
        document_id: &str,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> PipelineResult<Document> {
        let mut doc = self.load(document_id).await?;
        let invalid = |reason: String| PipelineError::InvalidRetry {
            document_id: document_id.to_string(),
            stage,
            reason,
        };

        let current = doc.stages.get(stage);
        if !current.is_terminal_failure() {
            return Err(invalid(format!(
                "stage is {current}; only failed or cancelled stages can be retried"
            )));
        }
        if let Some(p) = stage
            .prerequisites()
            .iter()
            .find(|p| *doc.stages.get(**p) != StageState::Succeeded)
        {
            return Err(invalid(format!("prerequisite {p} has not succeeded")));
        }
        if stage == Stage::Extraction && self.store.get_source(document_id).await?.is_none() {
            return Err(invalid("source bytes are missing".to_string()));
        }

        let todo: BTreeSet<Stage> = stage
            .with_dependents()
            .into_iter()
            .filter(|s| *doc.stages.get(*s) != StageState::Succeeded)
            .collect();
        tracing::info!(document_id, %stage, stages = todo.len(), "retrying stage");

        self.run(&mut doc, &todo, cancel).await?;
        Ok(doc)
    }

    /// Replace the document's bytes and run every stage again.
    ///
    /// Derived data is dropped first. The previous classification is kept
    /// as the reuse candidate, so identical text is not re-classified.
    pub async fn reingest(
        &self,
        document_id: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Document> {
        let mut doc = self.load(document_id).await?;
        self.store.clear_derived(document_id).await?;
        self.store.save_source(document_id, &bytes).await?;
        doc.content_hash = sha256_hex(&bytes);
        doc.page_count = 0;
        tracing::info!(document_id, bytes = bytes.len(), "reingesting document");

        for stage in Stage::ALL {
            if *doc.stages.get(stage) != StageState::Pending {
                self.transition(&mut doc, stage, StageState::Pending).await?;
            }
        }

        let all: BTreeSet<Stage> = Stage::ALL.into_iter().collect();
        self.run(&mut doc, &all, cancel).await?;
        Ok(doc)
    }

    async fn load(&self, document_id: &str) -> PipelineResult<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))
    }

    async fn run(
        &self,
        doc: &mut Document,
        todo: &BTreeSet<Stage>,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        match self.run_phases(doc, todo, cancel).await {
            Err(PipelineError::Cancelled(next)) => {
                tracing::warn!(document_id = %doc.id, stage = %next, "ingestion cancelled");
                for stage in todo {
                    let open = matches!(
                        doc.stages.get(*stage),
                        StageState::Pending | StageState::Running
                    );
                    if open {
                        self.transition(doc, *stage, StageState::Cancelled).await?;
                    }
                }
                Ok(())
            }
            other => other,
        }
    }

    async fn run_phases(
        &self,
        doc: &mut Document,
        todo: &BTreeSet<Stage>,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let succeeded = |doc: &Document, stage| *doc.stages.get(stage) == StageState::Succeeded;

        // Phase 1: extraction.
        let mut pages: Option<Vec<Page>> = None;
        if todo.contains(&Stage::Extraction) {
            checkpoint(cancel, Stage::Extraction)?;
            match self.extract(doc).await? {
                Some(extracted) => pages = Some(extracted),
                None => return Ok(()),
            }
        }

        // Phase 2: classification ∥ chunking.
        let run_classification =
            todo.contains(&Stage::Classification) && succeeded(doc, Stage::Extraction);
        let run_chunking = todo.contains(&Stage::Chunking) && succeeded(doc, Stage::Extraction);
        let needs_text = run_classification
            || run_chunking
            || todo.contains(&Stage::FieldExtraction);
        if pages.is_none() && needs_text {
            pages = Some(self.store.get_pages(&doc.id).await?);
        }
        let pages = pages.unwrap_or_default();
        let text = join_pages(&pages);

        let mut chunks: Option<Vec<Chunk>> = None;
        if run_classification || run_chunking {
            let first = if run_classification {
                Stage::Classification
            } else {
                Stage::Chunking
            };
            checkpoint(cancel, first)?;
            chunks = self
                .classify_and_chunk(doc, &pages, &text, run_classification, run_chunking)
                .await?;
        }

        // Phase 3: field extraction ∥ embedding.
        let run_fields =
            todo.contains(&Stage::FieldExtraction) && succeeded(doc, Stage::Classification);
        let run_embedding = todo.contains(&Stage::Embedding) && succeeded(doc, Stage::Chunking);
        if run_fields || run_embedding {
            let first = if run_fields {
                Stage::FieldExtraction
            } else {
                Stage::Embedding
            };
            checkpoint(cancel, first)?;
            if run_embedding && chunks.is_none() {
                chunks = Some(self.store.get_chunks(&doc.id).await?);
            }
            let chunks = chunks.unwrap_or_default();
            self.extract_fields_and_embed(doc, &text, &chunks, run_fields, run_embedding)
                .await?;
        }
        Ok(())
    }

    /// Returns the pages, or `None` when extraction failed.
    async fn extract(&self, doc: &mut Document) -> PipelineResult<Option<Vec<Page>>> {
        self.transition(doc, Stage::Extraction, StageState::Running)
            .await?;
        let bytes = self.store.get_source(&doc.id).await?.unwrap_or_default();

        match extract_pages(bytes).await {
            Ok(pages) => {
                self.store.replace_pages(&doc.id, &pages).await?;
                doc.page_count = pages.len();
                self.transition(doc, Stage::Extraction, StageState::Succeeded)
                    .await?;
                tracing::info!(document_id = %doc.id, pages = pages.len(), "text extracted");
                Ok(Some(pages))
            }
            Err(e) => {
                tracing::error!(document_id = %doc.id, error = %e, "extraction failed");
                self.transition(doc, Stage::Extraction, StageState::Failed(e.to_string()))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Returns the new chunk set when chunking ran and succeeded.
    async fn classify_and_chunk(
        &self,
        doc: &mut Document,
        pages: &[Page],
        text: &str,
        run_classification: bool,
        run_chunking: bool,
    ) -> PipelineResult<Option<Vec<Chunk>>> {
        if run_classification {
            self.transition(doc, Stage::Classification, StageState::Running)
                .await?;
        }
        if run_chunking {
            self.transition(doc, Stage::Chunking, StageState::Running)
                .await?;
        }

        let declared = doc.declared_type;
        let previous = doc.classification.clone();
        let classify_task = async {
            if run_classification {
                Some(
                    self.classifier
                        .classify(text, declared, previous.as_ref())
                        .await,
                )
            } else {
                None
            }
        };

        let chunk_task = {
            let pages = pages.to_vec();
            let tokenizer = Arc::clone(&self.tokenizer);
            let config = self.chunking;
            let document_id = doc.id.clone();
            async move {
                if !run_chunking {
                    return None;
                }
                let task = tokio::task::spawn_blocking(move || {
                    chunk_pages(&document_id, &pages, &config, tokenizer.as_ref())
                });
                Some(task.await.map_err(|e| format!("chunking task failed: {e}")))
            }
        };

        let (classification, chunked) = tokio::join!(classify_task, chunk_task);

        if let Some(classification) = classification {
            doc.classification = Some(classification);
            self.transition(doc, Stage::Classification, StageState::Succeeded)
                .await?;
        }

        match chunked {
            Some(Ok(chunks)) => {
                self.store.replace_chunks(&doc.id, &chunks).await?;
                self.transition(doc, Stage::Chunking, StageState::Succeeded)
                    .await?;
                tracing::info!(document_id = %doc.id, chunks = chunks.len(), "text chunked");
                Ok(Some(chunks))
            }
            Some(Err(reason)) => {
                tracing::error!(document_id = %doc.id, error = %reason, "chunking failed");
                self.transition(doc, Stage::Chunking, StageState::Failed(reason))
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn extract_fields_and_embed(
        &self,
        doc: &mut Document,
        text: &str,
        chunks: &[Chunk],
        run_fields: bool,
        run_embedding: bool,
    ) -> PipelineResult<()> {
        if run_fields {
            self.transition(doc, Stage::FieldExtraction, StageState::Running)
                .await?;
        }
        if run_embedding {
            self.transition(doc, Stage::Embedding, StageState::Running)
                .await?;
        }

        let document_id = doc.id.clone();
        let document_type = doc.document_type();
        let fields_task = async {
            if run_fields {
                Some(self.fields.extract(&document_id, text, document_type).await)
            } else {
                None
            }
        };
        let embed_task = async {
            if run_embedding {
                Some(self.embedder.embed_chunks(chunks).await)
            } else {
                None
            }
        };

        let (record, embeddings) = tokio::join!(fields_task, embed_task);

        match record {
            Some(Ok(record)) => {
                self.store.save_record(&record).await?;
                self.transition(doc, Stage::FieldExtraction, StageState::Succeeded)
                    .await?;
            }
            Some(Err(e)) => {
                tracing::error!(document_id = %doc.id, error = %e, "field extraction failed");
                self.transition(doc, Stage::FieldExtraction, StageState::Failed(e.to_string()))
                    .await?;
            }
            None => {}
        }

        match embeddings {
            Some(Ok(embeddings)) => {
                self.store.replace_embeddings(&doc.id, &embeddings).await?;
                self.transition(doc, Stage::Embedding, StageState::Succeeded)
                    .await?;
                tracing::info!(
                    document_id = %doc.id,
                    embeddings = embeddings.len(),
                    model = %self.embedder.model_name(),
                    "chunks embedded"
                );
            }
            Some(Err(e)) => {
                tracing::error!(document_id = %doc.id, error = %e, "embedding failed");
                self.transition(doc, Stage::Embedding, StageState::Failed(e.to_string()))
                    .await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Apply one stage state change: update the document, persist it, and
    /// append to the transition log.
    async fn transition(
        &self,
        doc: &mut Document,
        stage: Stage,
        to: StageState,
    ) -> PipelineResult<()> {
        let from = doc.stages.get(stage).clone();
        let at = Utc::now().timestamp();
        doc.stages.set(stage, to.clone());
        doc.updated_at = at;
        self.store.save_document(doc).await?;
        self.store
            .append_transition(&StageTransition {
                document_id: doc.id.clone(),
                stage,
                from,
                to: to.clone(),
                at,
            })
            .await?;
        tracing::debug!(document_id = %doc.id, %stage, state = %to, "stage transition");
        self.progress.report(&StageEvent {
            document_id: doc.id.clone(),
            filename: doc.filename.clone(),
            stage,
            state: to,
        });
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken, next: Stage) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled(next))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use property_rag_core::chunk::WordTokenizer;
    use property_rag_core::store::memory::InMemoryStore;

    use crate::config::LlmConfig;
    use crate::llm::Completer;
    use crate::mock::{HashEmbedder, ScriptedCompletion};

    fn pipeline(store: Arc<InMemoryStore>) -> IngestPipeline {
        let settings = PipelineSettings::with_dims(16).unwrap();
        let completer = Completer::new(
            Arc::new(ScriptedCompletion::default()),
            &LlmConfig::default(),
        );
        IngestPipeline::new(
            store,
            Classifier::new(completer.clone(), &settings),
            FieldExtractor::new(completer, &settings),
            Embedder::new(Arc::new(HashEmbedder::new(16)), &settings),
            Arc::new(WordTokenizer),
            &settings,
        )
    }

    #[tokio::test]
    async fn test_retry_unknown_document() {
        let p = pipeline(Arc::new(InMemoryStore::new()));
        let err = p
            .retry_stage("missing", Stage::Embedding, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_rejects_stage_that_has_not_failed() {
        let store = Arc::new(InMemoryStore::new());
        let mut doc = Document::new("a.pdf", b"%PDF", None, None, 0);
        doc.stages.set(Stage::Extraction, StageState::Succeeded);
        doc.stages.set(Stage::Classification, StageState::Succeeded);
        store.save_document(&doc).await.unwrap();

        let p = pipeline(store);
        let err = p
            .retry_stage(&doc.id, Stage::Classification, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRetry { .. }));
    }

    #[tokio::test]
    async fn test_retry_requires_prerequisites() {
        let store = Arc::new(InMemoryStore::new());
        let mut doc = Document::new("a.pdf", b"%PDF", None, None, 0);
        doc.stages
            .set(Stage::Extraction, StageState::Failed("bad".into()));
        doc.stages.set(Stage::Embedding, StageState::Cancelled);
        store.save_document(&doc).await.unwrap();

        let p = pipeline(store);
        let err = p
            .retry_stage(&doc.id, Stage::Embedding, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::InvalidRetry { reason, .. } => assert!(reason.contains("chunking")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_pdf_fails_extraction_only() {
        let store = Arc::new(InMemoryStore::new());
        let p = pipeline(store.clone());
        let doc = p
            .ingest(
                b"definitely not a pdf".to_vec(),
                IngestRequest::new("broken.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(doc.stages.extraction, StageState::Failed(_)));
        assert_eq!(doc.stages.chunking, StageState::Pending);
        assert_eq!(doc.lifecycle().as_str(), "failed");

        let log = store.transitions(&doc.id).await.unwrap();
        let states: Vec<String> = log.iter().map(|t| t.to.to_string()).collect();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0], "running");
        assert!(states[1].starts_with("failed("));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(InMemoryStore::new());
        let p = pipeline(store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let doc = p
            .ingest(b"%PDF-1.4".to_vec(), IngestRequest::new("a.pdf"), &cancel)
            .await
            .unwrap();
        assert!(doc.stages.iter().all(|(_, s)| *s == StageState::Cancelled));
    }
}
