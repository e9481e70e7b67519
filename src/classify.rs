//! Document type classification.
//!
//! The classifier shows the model the first `classify_chars` characters of
//! a document and asks for exactly one label from the closed taxonomy.
//! Classification never fails: malformed answers and provider errors are
//! retried `classify_retries` times, after which the uploader's declared
//! type (confidence 0.5) or `unknown` (confidence 0.0) is used.
//!
//! | Answer | Source | Confidence |
//! |--------|--------|------------|
//! | exact taxonomy label | `Model` | 1.0 |
//! | German name or label inside prose | `Alias` | 0.8 |
//! | `unknown`, declared hint present | `Declared` | 0.5 |
//! | nothing usable | `Fallback` | 0.0 |

use property_rag_core::models::{
    sha256_hex, Classification, ClassificationSource, DocumentType,
};

use crate::config::PipelineSettings;
use crate::llm::{Completer, CompletionConstraints, Prompt};

const SYSTEM_PROMPT: &str = "Du bist ein Experte für die Klassifizierung von Immobiliendokumenten. \
Du antwortest immer mit genau einem Label aus der vorgegebenen Liste und nichts sonst.";

/// Labels are short; anything longer is already off-script.
const LABEL_MAX_TOKENS: u32 = 20;

pub const CONFIDENCE_EXACT: f32 = 1.0;
pub const CONFIDENCE_ALIAS: f32 = 0.8;
pub const CONFIDENCE_DECLARED: f32 = 0.5;

pub struct Classifier {
    completer: Completer,
    window_chars: usize,
    retries: u32,
}

impl Classifier {
    pub fn new(completer: Completer, settings: &PipelineSettings) -> Self {
        Self {
            completer,
            window_chars: settings.classify_chars,
            retries: settings.classify_retries,
        }
    }

    /// Classify `text`.
    ///
    /// When `previous` came from the model and was computed over the same
    /// text window it is returned as-is and the model is not called.
    /// Declared and fallback results are never reused, so a document
    /// classified while the provider was unavailable gets another try.
    pub async fn classify(
        &self,
        text: &str,
        declared: Option<DocumentType>,
        previous: Option<&Classification>,
    ) -> Classification {
        let window = leading_chars(text, self.window_chars);
        let text_hash = sha256_hex(window.as_bytes());

        if let Some(prev) = previous.filter(|p| p.text_hash == text_hash && is_reusable(p)) {
            tracing::debug!(
                document_type = %prev.document_type,
                "text unchanged, reusing classification"
            );
            return prev.clone();
        }

        if window.trim().is_empty() {
            tracing::warn!("empty text, classifying as unknown");
            return Classification {
                document_type: DocumentType::Unknown,
                confidence: 0.0,
                source: ClassificationSource::Fallback,
                text_hash,
            };
        }

        let prompt = build_prompt(window, declared);
        let constraints = CompletionConstraints {
            max_tokens: LABEL_MAX_TOKENS,
            temperature: 0.0,
            json: false,
        };

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            match self.completer.complete_with(&prompt, constraints).await {
                Ok(answer) => match parse_label(&answer) {
                    Some((DocumentType::Unknown, _)) => {
                        return resolve_unknown(declared, text_hash);
                    }
                    Some((document_type, source)) => {
                        let confidence = match source {
                            ClassificationSource::Model => CONFIDENCE_EXACT,
                            _ => CONFIDENCE_ALIAS,
                        };
                        tracing::info!(%document_type, confidence, "document classified");
                        return Classification {
                            document_type,
                            confidence,
                            source,
                            text_hash,
                        };
                    }
                    None => tracing::warn!(
                        attempt,
                        answer = %truncate_for_log(&answer),
                        "classifier answer contains no known label"
                    ),
                },
                Err(e) => tracing::warn!(attempt, error = %e, "classification call failed"),
            }
        }

        tracing::warn!(attempts, "classification exhausted, falling back");
        resolve_unknown(declared, text_hash)
    }
}

fn is_reusable(previous: &Classification) -> bool {
    matches!(
        previous.source,
        ClassificationSource::Model | ClassificationSource::Alias
    )
}

fn resolve_unknown(declared: Option<DocumentType>, text_hash: String) -> Classification {
    match declared.filter(|d| *d != DocumentType::Unknown) {
        Some(document_type) => {
            tracing::info!(%document_type, "using declared type");
            Classification {
                document_type,
                confidence: CONFIDENCE_DECLARED,
                source: ClassificationSource::Declared,
                text_hash,
            }
        }
        None => Classification {
            document_type: DocumentType::Unknown,
            confidence: 0.0,
            source: ClassificationSource::Fallback,
            text_hash,
        },
    }
}

/// The first `n` characters of `text`, cut on a character boundary.
pub fn leading_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn build_prompt(window: &str, declared: Option<DocumentType>) -> Prompt {
    let mut user = String::from(
        "Analysiere den folgenden Dokumenttext und bestimme den Dokumenttyp.\n\nMögliche Dokumenttypen:\n",
    );
    for t in DocumentType::ALL {
        user.push_str(&format!("- {}: {}\n", t.as_str(), t.description()));
    }
    let labels: Vec<&str> = DocumentType::ALL.iter().map(|t| t.as_str()).collect();
    user.push_str(&format!(
        "\nAntworte NUR mit einem der folgenden Labels (kleingeschrieben):\n{}\n",
        labels.join(", ")
    ));
    if let Some(hint) = declared {
        user.push_str(&format!(
            "\nDer Hochladende hat den Typ \"{hint}\" angegeben. Das ist nur ein Hinweis.\n"
        ));
    }
    user.push_str(&format!("\nDokumenttext:\n{window}\n\nDokumenttyp:"));
    Prompt::new(SYSTEM_PROMPT, user)
}

/// Map a model answer to a taxonomy label.
///
/// An answer that is exactly a label is a `Model` match. Otherwise the
/// answer is scanned word by word for a label or alias.
pub fn parse_label(answer: &str) -> Option<(DocumentType, ClassificationSource)> {
    let cleaned = answer
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != '-')
        .trim()
        .to_lowercase();
    if let Some(t) = DocumentType::from_label(&cleaned) {
        return Some((t, ClassificationSource::Model));
    }
    if let Some(t) = DocumentType::from_alias(&cleaned) {
        return Some((t, ClassificationSource::Alias));
    }
    cleaned
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|w| !w.is_empty())
        .find_map(DocumentType::from_alias)
        .map(|t| (t, ClassificationSource::Alias))
}

fn truncate_for_log(s: &str) -> &str {
    leading_chars(s, 80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::mock::ScriptedCompletion;
    use crate::retry::{ProviderError, RetryPolicy};
    use std::sync::Arc;

    fn classifier(provider: Arc<ScriptedCompletion>) -> Classifier {
        let completer =
            Completer::new(provider, &LlmConfig::default()).with_retry(RetryPolicy::immediate(1));
        let settings = PipelineSettings::with_dims(8).unwrap();
        Classifier::new(completer, &settings)
    }

    #[test]
    fn test_parse_label_variants() {
        assert_eq!(
            parse_label("lease"),
            Some((DocumentType::Lease, ClassificationSource::Model))
        );
        assert_eq!(
            parse_label(" \"utility-statement\". "),
            Some((DocumentType::UtilityStatement, ClassificationSource::Model))
        );
        assert_eq!(
            parse_label("Mietvertrag"),
            Some((DocumentType::Lease, ClassificationSource::Alias))
        );
        assert_eq!(
            parse_label("Das Dokument ist ein Grundbuchauszug."),
            Some((DocumentType::LandRegistryExtract, ClassificationSource::Alias))
        );
        assert_eq!(parse_label("keine Ahnung"), None);
    }

    #[test]
    fn test_leading_chars_respects_char_boundaries() {
        assert_eq!(leading_chars("Größe", 3), "Grö");
        assert_eq!(leading_chars("ab", 10), "ab");
    }

    #[tokio::test]
    async fn test_exact_label() {
        let provider = Arc::new(ScriptedCompletion::with_responses(vec!["lease".into()]));
        let c = classifier(provider.clone())
            .classify("Mietvertrag zwischen A und B", None, None)
            .await;
        assert_eq!(c.document_type, DocumentType::Lease);
        assert_eq!(c.confidence, CONFIDENCE_EXACT);
        assert_eq!(provider.constraints()[0].max_tokens, LABEL_MAX_TOKENS);
        assert!(provider.prompts()[0].user.contains("Mietvertrag zwischen A und B"));
    }

    #[tokio::test]
    async fn test_malformed_answers_then_fallback_to_declared() {
        let provider = Arc::new(ScriptedCompletion::default().with_default("no idea"));
        let c = classifier(provider.clone())
            .classify("Text", Some(DocumentType::Appraisal), None)
            .await;
        assert_eq!(c.document_type, DocumentType::Appraisal);
        assert_eq!(c.source, ClassificationSource::Declared);
        assert_eq!(c.confidence, CONFIDENCE_DECLARED);
        // one call plus two retries
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_unknown() {
        let provider = Arc::new(ScriptedCompletion::with_results(vec![
            Err(ProviderError::Permanent("401".into())),
            Err(ProviderError::Permanent("401".into())),
            Err(ProviderError::Permanent("401".into())),
        ]));
        let c = classifier(provider).classify("Text", None, None).await;
        assert_eq!(c.document_type, DocumentType::Unknown);
        assert_eq!(c.source, ClassificationSource::Fallback);
        assert_eq!(c.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_unchanged_text_skips_model() {
        let provider = Arc::new(ScriptedCompletion::with_responses(vec!["appraisal".into()]));
        let classifier = classifier(provider.clone());
        let text = "Verkehrswertgutachten für das Objekt Musterstraße 1";
        let first = classifier.classify(text, None, None).await;
        let second = classifier.classify(text, None, Some(&first)).await;
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_is_reclassified_once_provider_recovers() {
        let provider = Arc::new(
            ScriptedCompletion::with_results(vec![
                Err(ProviderError::Transient("503".into())),
                Err(ProviderError::Transient("503".into())),
                Err(ProviderError::Transient("503".into())),
            ])
            .with_default("lease"),
        );
        let classifier = classifier(provider.clone());
        let text = "Mietvertrag über die Wohnung im 2. OG";

        let outage = classifier.classify(text, None, None).await;
        assert_eq!(outage.source, ClassificationSource::Fallback);
        assert_eq!(provider.calls(), 3);

        let recovered = classifier.classify(text, None, Some(&outage)).await;
        assert_eq!(recovered.document_type, DocumentType::Lease);
        assert_eq!(recovered.source, ClassificationSource::Model);
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn test_declared_result_is_not_reused() {
        let provider = Arc::new(ScriptedCompletion::default().with_default("unknown"));
        let classifier = classifier(provider.clone());
        let first = classifier
            .classify("Text", Some(DocumentType::Appraisal), None)
            .await;
        assert_eq!(first.source, ClassificationSource::Declared);
        let calls = provider.calls();

        classifier
            .classify("Text", Some(DocumentType::Appraisal), Some(&first))
            .await;
        assert_eq!(provider.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_empty_text_skips_model() {
        let provider = Arc::new(ScriptedCompletion::default());
        let c = classifier(provider.clone()).classify("   ", None, None).await;
        assert_eq!(c.document_type, DocumentType::Unknown);
        assert_eq!(provider.calls(), 0);
    }
}
