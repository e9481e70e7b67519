//! End-to-end pipeline tests over the in-memory store with scripted
//! providers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use property_rag::embedding::EmbeddingProvider;
use property_rag::mock::{FlakyEmbedder, HashEmbedder, ScriptedCompletion};
use property_rag::retry::ProviderError;
use property_rag::progress::{ProgressReporter, StageEvent};
use property_rag::rag::INSUFFICIENT_INFORMATION;
use property_rag::IngestRequest;
use property_rag_core::models::{
    ClassificationSource, DocumentType, Lifecycle, QueryFilter, Stage, StageState,
};
use property_rag_core::store::Store;
use property_rag_core::value::FieldValue;
use property_rag_core::PipelineError;

use common::{
    lease_pdf, memory_store, pdf_with_pages, rag_with, rag_with_settings, test_settings,
    utility_pdf, DIMS,
};

const CLASSIFY: &str = "Klassifizierung";
const EXTRACT: &str = "JSON-Format";
const ANSWER: &str = "Dokumentausschnitten";

/// Shares three words with the lease fixture and none with the utility one.
const RENT_QUESTION: &str = "Kaltmiete 1200 monatlich?";

const LEASE_JSON: &str = r#"{
    "parties": [{"name": "Hans Vermieter", "role": "Vermieter"}, {"name": "Erika Mieterin", "role": "Mieter"}],
    "monthly_rent": "1200 EUR",
    "deposit": null
}"#;

fn lease_script() -> ScriptedCompletion {
    ScriptedCompletion::default()
        .route(CLASSIFY, "lease")
        .route(EXTRACT, LEASE_JSON)
        .route(ANSWER, "Die Kaltmiete beträgt 1200 EUR monatlich [C1].")
}

fn classify_calls(script: &ScriptedCompletion) -> usize {
    script
        .prompts()
        .iter()
        .filter(|p| p.system.contains(CLASSIFY))
        .count()
}

#[tokio::test]
async fn test_lease_ingest_then_query_with_citation() {
    let store = memory_store();
    let script = Arc::new(lease_script());
    let rag = rag_with(store.clone(), script.clone(), Arc::new(HashEmbedder::new(DIMS)));

    let doc = rag
        .ingest(
            lease_pdf(),
            IngestRequest::new("mietvertrag.pdf").project("musterstrasse-1"),
        )
        .await
        .unwrap();

    assert_eq!(doc.lifecycle(), Lifecycle::Ready);
    assert_eq!(doc.document_type(), DocumentType::Lease);
    assert_eq!(doc.page_count, 1);
    let classification = doc.classification.as_ref().unwrap();
    assert_eq!(classification.source, ClassificationSource::Model);
    assert_eq!(classification.confidence, 1.0);

    let record = rag.get_extracted_record(&doc.id).await.unwrap().unwrap();
    assert_eq!(record.document_type, DocumentType::Lease);
    assert_eq!(
        record.get("monthly_rent"),
        Some(&FieldValue::money(120_000, "EUR"))
    );
    assert!(record.get("deposit").is_none());
    assert!(record.confidence > 0.0 && record.confidence < 1.0);

    let chunks = store.get_chunks(&doc.id).await.unwrap();
    assert!(!chunks.is_empty());
    assert_eq!(store.count_embeddings(&doc.id).await.unwrap(), chunks.len());

    let result = rag
        .query(
            RENT_QUESTION,
            Some(QueryFilter::for_project("musterstrasse-1")),
        )
        .await
        .unwrap();
    assert_eq!(result.answer, "Die Kaltmiete beträgt 1200 EUR monatlich [C1].");
    assert_eq!(result.citations.len(), 1);
    let citation = &result.citations[0];
    assert_eq!(citation.document_id, doc.id);
    assert_eq!(citation.filename, "mietvertrag.pdf");
    assert_eq!(citation.page, 1);
    assert!(citation.score >= 0.3);
}

#[tokio::test]
async fn test_status_records_every_transition() {
    let store = memory_store();
    let rag = rag_with(
        store,
        Arc::new(lease_script()),
        Arc::new(HashEmbedder::new(DIMS)),
    );
    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    let status = rag.document_status(&doc.id).await.unwrap();
    assert_eq!(status.document, doc);
    // running + succeeded for each of the five stages
    assert_eq!(status.transitions.len(), 10);
    for stage in Stage::ALL {
        let to: Vec<&StageState> = status
            .transitions
            .iter()
            .filter(|t| t.stage == stage)
            .map(|t| &t.to)
            .collect();
        assert_eq!(to, vec![&StageState::Running, &StageState::Succeeded]);
    }
    let extraction_done = status
        .transitions
        .iter()
        .position(|t| t.stage == Stage::Extraction && t.to == StageState::Succeeded)
        .unwrap();
    let chunking_started = status
        .transitions
        .iter()
        .position(|t| t.stage == Stage::Chunking && t.to == StageState::Running)
        .unwrap();
    assert!(extraction_done < chunking_started);
}

#[tokio::test]
async fn test_unrelated_question_is_insufficient_without_model_call() {
    let store = memory_store();
    let script = Arc::new(
        ScriptedCompletion::default()
            .route(CLASSIFY, "utility_statement")
            .route(EXTRACT, r#"{"total_costs": "1060,00 EUR"}"#)
            .with_default("INSUFFICIENT_INFORMATION"),
    );
    let rag = rag_with(store, script.clone(), Arc::new(HashEmbedder::new(DIMS)));

    let doc = rag
        .ingest(utility_pdf(), IngestRequest::new("nk-2023.pdf"))
        .await
        .unwrap();
    assert_eq!(doc.lifecycle(), Lifecycle::Ready);
    assert_eq!(doc.document_type(), DocumentType::UtilityStatement);

    let calls_before = script.calls();
    let result = rag.query("Wie hoch ist die Miete?", None).await.unwrap();
    assert_eq!(result.answer, INSUFFICIENT_INFORMATION);
    assert!(result.citations.is_empty());
    assert_eq!(script.calls(), calls_before);
}

#[tokio::test]
async fn test_transient_embedding_failures_are_retried() {
    let store = memory_store();
    let embedder = Arc::new(FlakyEmbedder::new(HashEmbedder::new(DIMS), 2));
    let rag = rag_with(store.clone(), Arc::new(lease_script()), embedder.clone());

    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    assert_eq!(doc.stages.embedding, StageState::Succeeded);
    assert_eq!(doc.lifecycle(), Lifecycle::Ready);
    assert_eq!(embedder.calls(), 3);
    assert!(store.count_embeddings(&doc.id).await.unwrap() > 0);
}

#[tokio::test]
async fn test_embedding_gives_up_after_retry_budget() {
    let store = memory_store();
    let embedder = Arc::new(FlakyEmbedder::new(HashEmbedder::new(DIMS), 10));
    let rag = rag_with(store.clone(), Arc::new(lease_script()), embedder.clone());

    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    assert!(matches!(doc.stages.embedding, StageState::Failed(_)));
    assert_eq!(doc.stages.field_extraction, StageState::Succeeded);
    assert_eq!(doc.lifecycle(), Lifecycle::Failed);
    assert_eq!(embedder.calls(), 3);
    assert_eq!(store.count_embeddings(&doc.id).await.unwrap(), 0);
    assert!(!store.get_chunks(&doc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_field_extraction_failure_keeps_other_stages_and_retries() {
    let store = memory_store();
    let broken = Arc::new(
        ScriptedCompletion::default()
            .route(CLASSIFY, "lease")
            .route(EXTRACT, "Leider kann ich das nicht als JSON liefern."),
    );
    let rag = rag_with(store.clone(), broken.clone(), Arc::new(HashEmbedder::new(DIMS)));

    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    match &doc.stages.field_extraction {
        StageState::Failed(reason) => assert!(reason.contains('3'), "{reason}"),
        other => panic!("unexpected state: {other}"),
    }
    assert_eq!(doc.stages.embedding, StageState::Succeeded);
    assert_eq!(doc.stages.chunking, StageState::Succeeded);
    assert_eq!(doc.lifecycle(), Lifecycle::Failed);
    assert!(rag.get_extracted_record(&doc.id).await.unwrap().is_none());
    let extraction_calls = broken
        .prompts()
        .iter()
        .filter(|p| p.system.contains(EXTRACT))
        .count();
    assert_eq!(extraction_calls, 3);
    let chunk_ids: Vec<String> = store
        .get_chunks(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();

    // The provider recovers; retry only the failed stage.
    let fixed = Arc::new(lease_script());
    let rag = rag_with(store.clone(), fixed.clone(), Arc::new(HashEmbedder::new(DIMS)));
    let doc = rag
        .retry_stage(&doc.id, Stage::FieldExtraction)
        .await
        .unwrap();

    assert_eq!(doc.lifecycle(), Lifecycle::Ready);
    assert_eq!(classify_calls(&fixed), 0);
    let record = rag.get_extracted_record(&doc.id).await.unwrap().unwrap();
    assert_eq!(
        record.get("monthly_rent"),
        Some(&FieldValue::money(120_000, "EUR"))
    );
    let after: Vec<String> = store
        .get_chunks(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(chunk_ids, after);
}

#[tokio::test]
async fn test_retry_of_ready_stage_is_rejected() {
    let rag = rag_with(
        memory_store(),
        Arc::new(lease_script()),
        Arc::new(HashEmbedder::new(DIMS)),
    );
    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    let err = rag.retry_stage(&doc.id, Stage::Embedding).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRetry { .. }));
}

/// Cancels the token once a given stage reports success.
struct CancelAfter {
    stage: Stage,
    token: CancellationToken,
}

impl ProgressReporter for CancelAfter {
    fn report(&self, event: &StageEvent) {
        if event.stage == self.stage && event.state == StageState::Succeeded {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_after_extraction_keeps_pages() {
    let store = memory_store();
    let token = CancellationToken::new();
    let script = Arc::new(lease_script());
    let rag = rag_with(store.clone(), script.clone(), Arc::new(HashEmbedder::new(DIMS)))
        .with_progress(Arc::new(CancelAfter {
            stage: Stage::Extraction,
            token: token.clone(),
        }));

    let doc = rag
        .ingest_with_cancel(lease_pdf(), IngestRequest::new("mietvertrag.pdf"), &token)
        .await
        .unwrap();

    assert_eq!(doc.stages.extraction, StageState::Succeeded);
    for stage in [
        Stage::Classification,
        Stage::Chunking,
        Stage::FieldExtraction,
        Stage::Embedding,
    ] {
        assert_eq!(doc.stages.get(stage), &StageState::Cancelled, "{stage}");
    }
    assert_eq!(doc.lifecycle(), Lifecycle::Cancelled);
    assert_eq!(store.get_pages(&doc.id).await.unwrap().len(), 1);
    assert!(store.get_chunks(&doc.id).await.unwrap().is_empty());
    assert_eq!(script.calls(), 0);

    // A cancelled stage can be resumed.
    let rag = rag_with(
        store.clone(),
        Arc::new(lease_script()),
        Arc::new(HashEmbedder::new(DIMS)),
    );
    let doc = rag
        .retry_stage(&doc.id, Stage::Classification)
        .await
        .unwrap();
    assert_eq!(doc.stages.classification, StageState::Succeeded);
    assert_eq!(doc.stages.field_extraction, StageState::Succeeded);
    assert_eq!(doc.stages.chunking, StageState::Cancelled);
    assert_eq!(doc.stages.embedding, StageState::Cancelled);

    let doc = rag.retry_stage(&doc.id, Stage::Chunking).await.unwrap();
    assert_eq!(doc.lifecycle(), Lifecycle::Ready);
}

#[tokio::test]
async fn test_invented_citation_labels_are_dropped() {
    let script = Arc::new(
        ScriptedCompletion::default()
            .route(CLASSIFY, "lease")
            .route(EXTRACT, LEASE_JSON)
            .route(
                ANSWER,
                "Die Kaltmiete beträgt 1200 EUR [C1, C4]. Die Kaution beträgt drei Monatsmieten [C9].",
            ),
    );
    let rag = rag_with(memory_store(), script, Arc::new(HashEmbedder::new(DIMS)));
    rag.ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();

    let result = rag
        .query(RENT_QUESTION, None)
        .await
        .unwrap();
    assert_eq!(
        result.answer,
        "Die Kaltmiete beträgt 1200 EUR [C1]. Die Kaution beträgt drei Monatsmieten."
    );
    let labels: Vec<&str> = result.citations.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["C1"]);
}

#[tokio::test]
async fn test_reingest_same_text_reuses_classification() {
    let store = memory_store();
    let script = Arc::new(lease_script());
    let rag = rag_with(store.clone(), script.clone(), Arc::new(HashEmbedder::new(DIMS)));

    let doc = rag
        .ingest(lease_pdf(), IngestRequest::new("mietvertrag.pdf"))
        .await
        .unwrap();
    assert_eq!(classify_calls(&script), 1);
    let old_chunks = store.get_chunks(&doc.id).await.unwrap();

    let again = rag.reingest(&doc.id, lease_pdf()).await.unwrap();
    assert_eq!(again.id, doc.id);
    assert_eq!(again.lifecycle(), Lifecycle::Ready);
    assert_eq!(again.classification, doc.classification);
    assert_eq!(classify_calls(&script), 1);

    let new_chunks = store.get_chunks(&doc.id).await.unwrap();
    assert_eq!(new_chunks.len(), old_chunks.len());
    assert!(new_chunks.iter().all(|c| !old_chunks.iter().any(|o| o.id == c.id)));

    // Different text is classified again.
    let changed = rag.reingest(&doc.id, utility_pdf()).await.unwrap();
    assert_ne!(changed.content_hash, doc.content_hash);
    assert_eq!(classify_calls(&script), 2);
}

#[tokio::test]
async fn test_top_k_larger_than_corpus_returns_every_chunk() {
    let line = "Kaltmiete monatlich EUR Kaltmiete monatlich EUR";
    let page = vec![line; 9].join("\n");
    let script = Arc::new(
        ScriptedCompletion::default()
            .route(CLASSIFY, "lease")
            .route(EXTRACT, "{}")
            .route(ANSWER, "Siehe [C1][C2][C3][C4][C5]."),
    );
    let store = memory_store();
    let rag = rag_with(store.clone(), script, Arc::new(HashEmbedder::new(DIMS)));
    let doc = rag
        .ingest(pdf_with_pages(&[&page]), IngestRequest::new("lang.pdf"))
        .await
        .unwrap();
    let chunks = store.get_chunks(&doc.id).await.unwrap();
    assert!(chunks.len() >= 2 && chunks.len() < 5, "{} chunks", chunks.len());

    let result = rag
        .query_top_k(RENT_QUESTION, None, Some(5))
        .await
        .unwrap();
    assert_eq!(result.citations.len(), chunks.len());
    // Every chunk is a hit, so the context adds no neighbors and is shown
    // in reading order.
    let cited: Vec<&str> = result.citations.iter().map(|c| c.chunk_id.as_str()).collect();
    let expected: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(cited, expected);
}

#[tokio::test]
async fn test_filter_by_type_and_document() {
    let store = memory_store();
    let script = Arc::new(
        ScriptedCompletion::default()
            .route(EXTRACT, "{}")
            .route(ANSWER, "Gefunden [C1].")
            .route("Nebenkostenabrechnung 2023", "utility_statement")
            .route(CLASSIFY, "lease"),
    );
    let rag = rag_with(store, script, Arc::new(HashEmbedder::new(DIMS)));

    let results = rag
        .ingest_many(vec![
            (lease_pdf(), IngestRequest::new("mietvertrag.pdf")),
            (utility_pdf(), IngestRequest::new("nk-2023.pdf")),
        ])
        .await;
    let docs: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(docs[0].filename, "mietvertrag.pdf");
    assert_eq!(docs[0].document_type(), DocumentType::Lease);
    assert_eq!(docs[1].document_type(), DocumentType::UtilityStatement);
    assert!(docs.iter().all(|d| d.lifecycle() == Lifecycle::Ready));

    let utility_only = QueryFilter {
        document_types: vec![DocumentType::UtilityStatement],
        ..QueryFilter::default()
    };
    let result = rag
        .query(RENT_QUESTION, Some(utility_only))
        .await
        .unwrap();
    assert_eq!(result.answer, INSUFFICIENT_INFORMATION);

    let lease_only = QueryFilter {
        document_ids: vec![docs[0].id.clone()],
        ..QueryFilter::default()
    };
    let result = rag
        .query(RENT_QUESTION, Some(lease_only))
        .await
        .unwrap();
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].document_id, docs[0].id);

    assert_eq!(rag.list_documents(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_declared_type_used_when_model_is_unsure() {
    let script = Arc::new(
        ScriptedCompletion::default()
            .route(CLASSIFY, "unknown")
            .route(EXTRACT, "{}"),
    );
    let rag = rag_with(memory_store(), script, Arc::new(HashEmbedder::new(DIMS)));
    let doc = rag
        .ingest(
            utility_pdf(),
            IngestRequest::new("scan.pdf").declared(DocumentType::UtilityStatement),
        )
        .await
        .unwrap();

    let c = doc.classification.unwrap();
    assert_eq!(c.document_type, DocumentType::UtilityStatement);
    assert_eq!(c.source, ClassificationSource::Declared);
    assert_eq!(c.confidence, 0.5);
}

#[tokio::test]
async fn test_unknown_document_errors() {
    let rag = rag_with(
        memory_store(),
        Arc::new(lease_script()),
        Arc::new(HashEmbedder::new(DIMS)),
    );
    assert!(matches!(
        rag.get_extracted_record("nope").await,
        Err(PipelineError::DocumentNotFound(_))
    ));
    assert!(matches!(
        rag.document_status("nope").await,
        Err(PipelineError::DocumentNotFound(_))
    ));
    assert!(matches!(
        rag.reingest("nope", lease_pdf()).await,
        Err(PipelineError::DocumentNotFound(_))
    ));
}

/// Holds every embedding call until `release_at` calls are in flight or
/// `patience` has passed, and records the highest number in flight.
struct GatedEmbedder {
    inner: HashEmbedder,
    in_flight: watch::Sender<usize>,
    peak: AtomicUsize,
    release_at: usize,
    patience: Duration,
}

impl GatedEmbedder {
    fn new(dims: usize, release_at: usize, patience: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(dims),
            in_flight: watch::channel(0).0,
            peak: AtomicUsize::new(0),
            release_at,
            patience,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        "gated"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut now = 0;
        self.in_flight.send_modify(|n| {
            *n += 1;
            now = *n;
        });
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut rx = self.in_flight.subscribe();
        let _ = tokio::time::timeout(self.patience, rx.wait_for(|n| *n >= self.release_at)).await;

        self.in_flight.send_modify(|n| *n -= 1);
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_ingest_many_respects_document_concurrency_limit() {
    const LIMIT: usize = 2;
    // Calls are only released early if the limit is overrun.
    let embedder = Arc::new(GatedEmbedder::new(
        DIMS,
        LIMIT + 1,
        Duration::from_millis(250),
    ));
    let mut settings = test_settings();
    settings.max_concurrent_documents = LIMIT;
    let rag = rag_with_settings(
        memory_store(),
        Arc::new(lease_script()),
        embedder.clone(),
        settings,
    );

    let uploads = (0..5)
        .map(|i| (lease_pdf(), IngestRequest::new(format!("mietvertrag-{i}.pdf"))))
        .collect();
    let results = rag.ingest_many(uploads).await;

    assert_eq!(results.len(), 5);
    for (i, result) in results.iter().enumerate() {
        let doc = result.as_ref().unwrap();
        assert_eq!(doc.filename, format!("mietvertrag-{i}.pdf"));
        assert_eq!(doc.lifecycle(), Lifecycle::Ready);
    }
    assert_eq!(embedder.peak(), LIMIT);
}

