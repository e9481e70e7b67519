//! Grounded question answering.
//!
//! The synthesizer retrieves chunks for a question, shows them to the model
//! labeled `[C1]…[Cn]` with filename and page, and asks for an answer built
//! only from that context with inline label citations. Cited labels are
//! parsed back into [`Citation`]s; labels the model invents are dropped
//! from both the citation list and the answer text.
//!
//! No retrieved chunks, or the model replying
//! [`INSUFFICIENT_INFORMATION_SENTINEL`], yields [`INSUFFICIENT_INFORMATION`]
//! with no citations. The first case never calls the model.

use property_rag_core::citation::{label_for, resolve_citations};
use property_rag_core::models::{Citation, QueryFilter, QueryResult};
use property_rag_core::retrieval::ScoredChunk;
use property_rag_core::PipelineResult;

use crate::llm::{Completer, Prompt};
use crate::retrieve::Retriever;

pub const INSUFFICIENT_INFORMATION: &str =
    "Ich konnte keine relevanten Informationen in den Dokumenten finden.";

pub const INSUFFICIENT_INFORMATION_SENTINEL: &str = "INSUFFICIENT_INFORMATION";

const SYSTEM_PROMPT: &str = "Du bist ein Experte für Immobiliendokumente und beantwortest Fragen \
basierend auf den bereitgestellten Dokumentausschnitten.

Regeln:
1. Antworte NUR basierend auf den bereitgestellten Ausschnitten.
2. Belege jede Aussage mit dem Label des Ausschnitts in eckigen Klammern, z.B. [C1] oder [C1, C3].
3. Verwende ausschließlich Labels, die in den Ausschnitten vorkommen.
4. Wenn die Ausschnitte keine Antwort enthalten, antworte exakt mit INSUFFICIENT_INFORMATION.
5. Antworte in der Sprache der Frage.
6. Gib Zahlen und Daten exakt wie in den Quellen an.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

pub struct AnswerSynthesizer {
    retriever: Retriever,
    completer: Completer,
}

impl AnswerSynthesizer {
    pub fn new(retriever: Retriever, completer: Completer) -> Self {
        Self {
            retriever,
            completer,
        }
    }

    /// Retrieve context for `question` and answer it.
    ///
    /// The context holds the `top_k` hits plus their neighboring chunks;
    /// every chunk shown to the model is labeled and citable.
    pub async fn answer(
        &self,
        question: &str,
        filter: &QueryFilter,
        top_k: Option<usize>,
    ) -> PipelineResult<QueryResult> {
        let chunks = self
            .retriever
            .retrieve_with_context(question, filter, top_k)
            .await?;
        self.synthesize(question, &chunks).await
    }

    /// Answer `question` from `chunks` only.
    pub async fn synthesize(
        &self,
        question: &str,
        chunks: &[ScoredChunk],
    ) -> PipelineResult<QueryResult> {
        if chunks.is_empty() {
            tracing::info!("no chunks retrieved, answering without model call");
            return Ok(insufficient(question));
        }

        let prompt = build_prompt(question, chunks);
        let raw = self.completer.complete(&prompt, false).await?;

        if raw.trim().trim_end_matches('.') == INSUFFICIENT_INFORMATION_SENTINEL {
            tracing::info!(chunks = chunks.len(), "model found no answer in context");
            return Ok(insufficient(question));
        }

        let labels: Vec<String> = (0..chunks.len()).map(label_for).collect();
        let known: Vec<&str> = labels.iter().map(String::as_str).collect();
        let resolved = resolve_citations(&raw, &known);

        let citations: Vec<Citation> = resolved
            .labels
            .iter()
            .filter_map(|label| {
                let idx = labels.iter().position(|l| l == label)?;
                let hit = &chunks[idx];
                Some(Citation {
                    label: label.clone(),
                    chunk_id: hit.chunk.id.clone(),
                    document_id: hit.chunk.document_id.clone(),
                    filename: hit.filename.clone(),
                    page: hit.chunk.page_start,
                    score: hit.score,
                })
            })
            .collect();

        tracing::info!(
            chunks = chunks.len(),
            citations = citations.len(),
            "answer synthesized"
        );

        Ok(QueryResult {
            question: question.to_string(),
            answer: resolved.answer.trim().to_string(),
            citations,
        })
    }
}

fn insufficient(question: &str) -> QueryResult {
    QueryResult {
        question: question.to_string(),
        answer: INSUFFICIENT_INFORMATION.to_string(),
        citations: Vec::new(),
    }
}

fn build_prompt(question: &str, chunks: &[ScoredChunk]) -> Prompt {
    let context = chunks
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let pages = if hit.chunk.page_start == hit.chunk.page_end {
                format!("Seite {}", hit.chunk.page_start)
            } else {
                format!("Seiten {}-{}", hit.chunk.page_start, hit.chunk.page_end)
            };
            format!(
                "[{}] (Quelle: {}, {})\n{}",
                label_for(i),
                hit.filename,
                pages,
                hit.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);

    Prompt::new(
        SYSTEM_PROMPT,
        format!(
            "Beantworte die folgende Frage basierend auf den Dokumentausschnitten.\n\n\
             FRAGE: {question}\n\n\
             DOKUMENTAUSSCHNITTE:\n{context}\n\n\
             Antworte präzise und zitiere die Labels der verwendeten Ausschnitte."
        ),
    )
}
