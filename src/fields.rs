//! Structured field extraction.
//!
//! [`FieldExtractor`] asks the model for one JSON object shaped by the
//! document type's schema, then validates every field through the schema's
//! typed parsers. Model output is never trusted: missing, empty, or
//! ill-typed values become "not found".
//!
//! A response that is not a JSON object at all triggers a corrective
//! re-prompt quoting the parse error, up to `extract_retries` times. After
//! that the stage fails with [`PipelineError::ExtractionSchema`].

use chrono::Utc;

use property_rag_core::models::{DocumentType, ExtractedRecord};
use property_rag_core::schema::{fill_ratio, parse_response_object, schema_for};
use property_rag_core::{PipelineError, PipelineResult};

use crate::classify::leading_chars;
use crate::config::PipelineSettings;
use crate::llm::{Completer, Prompt};

const SYSTEM_PROMPT: &str = "Du bist ein Experte für die Analyse von Immobiliendokumenten. \
Extrahiere die angeforderten Informationen präzise und vollständig. \
Antworte ausschließlich im JSON-Format.";

pub struct FieldExtractor {
    completer: Completer,
    max_chars: usize,
    retries: u32,
    currency: String,
}

impl FieldExtractor {
    pub fn new(completer: Completer, settings: &PipelineSettings) -> Self {
        Self {
            completer,
            max_chars: settings.max_extraction_chars,
            retries: settings.extract_retries,
            currency: settings.default_currency.clone(),
        }
    }

    /// Extract the schema fields of `document_type` from `text`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::CompletionProvider`] when the model cannot be reached.
    /// - [`PipelineError::ExtractionSchema`] when no attempt produced a JSON object.
    pub async fn extract(
        &self,
        document_id: &str,
        text: &str,
        document_type: DocumentType,
    ) -> PipelineResult<ExtractedRecord> {
        let schema = schema_for(document_type);
        let excerpt = leading_chars(text, self.max_chars);
        if excerpt.len() < text.len() {
            tracing::debug!(
                document_id,
                kept = self.max_chars,
                "document text truncated for extraction"
            );
        }

        let base = build_prompt(excerpt, document_type, &schema.prompt_listing());
        let attempts = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let prompt = if attempt == 1 {
                base.clone()
            } else {
                corrective_prompt(&base, &last_error)
            };
            let raw = self.completer.complete(&prompt, true).await?;

            match parse_response_object(&raw) {
                Ok(object) => {
                    let fields = schema.build_fields(&object, &self.currency);
                    let confidence = fill_ratio(&fields);
                    tracing::info!(
                        document_id,
                        %document_type,
                        confidence,
                        attempt,
                        "fields extracted"
                    );
                    return Ok(ExtractedRecord {
                        document_id: document_id.to_string(),
                        document_type,
                        fields,
                        confidence,
                        extracted_at: Utc::now().timestamp(),
                    });
                }
                Err(e) => {
                    tracing::warn!(document_id, attempt, error = %e, "unparseable extraction response");
                    last_error = e;
                }
            }
        }

        Err(PipelineError::ExtractionSchema {
            document_type: document_type.to_string(),
            attempts,
            message: last_error,
        })
    }
}

fn build_prompt(text: &str, document_type: DocumentType, listing: &str) -> Prompt {
    let user = format!(
        "Extrahiere die folgenden Informationen aus diesem Dokument ({}: {}).\n\
         Antworte mit genau einem JSON-Objekt mit diesen Schlüsseln. \
         Wenn ein Feld nicht gefunden wird, setze es auf null.\n\n\
         Zu extrahierende Felder:\n{}\n\
         Dokumenttext:\n{}",
        document_type.as_str(),
        document_type.description(),
        listing,
        text
    );
    Prompt::new(SYSTEM_PROMPT, user)
}

fn corrective_prompt(base: &Prompt, error: &str) -> Prompt {
    Prompt::new(
        base.system.clone(),
        format!(
            "{}\n\nDeine vorherige Antwort war ungültig ({error}). \
             Antworte ausschließlich mit einem einzelnen JSON-Objekt.",
            base.user
        ),
    )
}
