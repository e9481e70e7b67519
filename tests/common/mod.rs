#![allow(dead_code)]

use std::sync::Arc;

use property_rag::config::{LlmConfig, PipelineSettings};
use property_rag::embedding::EmbeddingProvider;
use property_rag::llm::CompletionProvider;
use property_rag::retry::RetryPolicy;
use property_rag::{Components, PropertyRag};
use property_rag_core::chunk::{ChunkConfig, WordTokenizer};
use property_rag_core::store::memory::InMemoryStore;
use property_rag_core::store::Store;

pub const DIMS: usize = 256;

/// Minimal PDF with one page per entry of `pages`; lines within a page
/// are separated by `\n`. Builds the body first, then the xref with
/// correct byte offsets and stream lengths so pdf-extract can parse it.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let n = pages.len();
    let font_id = 3;
    let page_id = |i: usize| 4 + 2 * i;
    let content_id = |i: usize| 5 + 2 * i;
    let size = 4 + 2 * n;

    let mut out = Vec::new();
    let mut offsets = vec![0usize; size];
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets[1] = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    offsets[2] = out.len();
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", page_id(i))).collect();
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            n
        )
        .as_bytes(),
    );

    offsets[font_id] = out.len();
    out.extend_from_slice(
        format!(
            "{font_id} 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >> endobj\n"
        )
        .as_bytes(),
    );

    for (i, text) in pages.iter().enumerate() {
        offsets[page_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {font_id} 0 R >> >> >> endobj\n",
                page_id(i),
                content_id(i)
            )
            .as_bytes(),
        );

        let mut stream = String::from("BT /F1 12 Tf 72 720 Td");
        for (j, line) in text.lines().enumerate() {
            if j > 0 {
                stream.push_str(" 0 -16 Td");
            }
            stream.push_str(&format!(" ({}) Tj", escape(line)));
        }
        stream.push_str(" ET");

        offsets[content_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                content_id(i),
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {size}\n").as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets.iter().skip(1) {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(format!("trailer << /Size {size} /Root 1 0 R >>\nstartxref\n").as_bytes());
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

fn escape(line: &str) -> String {
    line.replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

pub fn lease_pdf() -> Vec<u8> {
    pdf_with_pages(&[
        "Mietvertrag fuer Wohnraum\nVermieter: Hans Vermieter, Musterstrasse 1, Berlin\nMieter: Erika Mieterin\nKaltmiete: 1200 EUR monatlich",
    ])
}

pub fn utility_pdf() -> Vec<u8> {
    pdf_with_pages(&[
        "Nebenkostenabrechnung 2023\nHeizkosten 850,00 EUR\nWasser 210,00 EUR\nGuthaben 120,00 EUR",
    ])
}

/// Settings tuned for tests: small chunks and retries without delay.
pub fn test_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::with_dims(DIMS).unwrap();
    settings.chunking = ChunkConfig::new(24, 6).unwrap();
    settings.embedding_retry = RetryPolicy::immediate(3);
    settings
}

pub fn test_llm() -> LlmConfig {
    LlmConfig {
        max_attempts: 1,
        backoff_ms: 0,
        ..LlmConfig::default()
    }
}

pub fn rag_with(
    store: Arc<dyn Store>,
    completion: Arc<dyn CompletionProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
) -> PropertyRag {
    rag_with_settings(store, completion, embedding, test_settings())
}

pub fn rag_with_settings(
    store: Arc<dyn Store>,
    completion: Arc<dyn CompletionProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
    settings: PipelineSettings,
) -> PropertyRag {
    PropertyRag::from_components(Components {
        store,
        completion,
        embedding,
        tokenizer: Arc::new(WordTokenizer),
        settings,
        llm: test_llm(),
    })
}

pub fn memory_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}
