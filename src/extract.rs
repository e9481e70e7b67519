//! PDF text extraction.
//!
//! Turns raw PDF bytes into page-ordered [`Page`] records using
//! `pdf-extract`. Parsing is CPU-bound and the parser may panic on hostile
//! input, so [`extract_pages`] runs it on tokio's blocking pool and maps
//! both parser errors and panics to [`PipelineError::UnreadablePdf`].
//!
//! Page text is normalized before it leaves this module:
//!
//! - lines laid out as table rows (cells separated by tabs or wide gaps)
//!   are flattened to `cell | cell | cell`
//! - other runs of spaces and tabs collapse to one space
//! - three or more newlines collapse to a blank line
//! - leading and trailing whitespace is trimmed

use std::sync::LazyLock;

use regex::Regex;

use property_rag_core::models::Page;
use property_rag_core::{PipelineError, PipelineResult};

/// Bytes searched for the `%PDF-` marker. Some producers prepend junk.
const HEADER_SEARCH_WINDOW: usize = 1024;

/// Cell separator inside a table row: a tab, or three or more spaces.
static CELL_GAP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\t+|[ ]{3,}").unwrap());

static SPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Extract pages on the blocking pool.
pub async fn extract_pages(bytes: Vec<u8>) -> PipelineResult<Vec<Page>> {
    match tokio::task::spawn_blocking(move || extract_pages_blocking(&bytes)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PipelineError::UnreadablePdf(
            "PDF parser panicked".to_string(),
        )),
        Err(e) => Err(PipelineError::UnreadablePdf(format!(
            "extraction task failed: {e}"
        ))),
    }
}

/// Synchronous extraction. Prefer [`extract_pages`] from async code.
pub fn extract_pages_blocking(bytes: &[u8]) -> PipelineResult<Vec<Page>> {
    let window = &bytes[..bytes.len().min(HEADER_SEARCH_WINDOW)];
    if !window.windows(5).any(|w| w == b"%PDF-") {
        return Err(PipelineError::UnreadablePdf(
            "missing %PDF header".to_string(),
        ));
    }

    let raw_pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| PipelineError::UnreadablePdf(e.to_string()))?;

    let pages: Vec<Page> = raw_pages
        .iter()
        .enumerate()
        .map(|(i, raw)| Page {
            number: i as u32 + 1,
            text: normalize_page_text(raw),
        })
        .collect();

    if pages.iter().all(|p| p.text.is_empty()) {
        return Err(PipelineError::UnreadablePdf(
            "no extractable text".to_string(),
        ));
    }
    Ok(pages)
}

/// Normalize one page of raw extractor output.
pub fn normalize_page_text(raw: &str) -> String {
    let lines: Vec<String> = raw
        .replace("\r\n", "\n")
        .replace(['\r', '\u{c}'], "\n")
        .lines()
        .map(normalize_line)
        .collect();
    let joined = lines.join("\n");
    BLANK_LINES_RE
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

fn normalize_line(line: &str) -> String {
    let trimmed = line.trim();
    let cells: Vec<&str> = CELL_GAP_RE
        .split(trimmed)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if cells.len() >= 2 {
        return cells
            .iter()
            .map(|c| SPACE_RUN_RE.replace_all(c, " "))
            .collect::<Vec<_>>()
            .join(" | ");
    }
    SPACE_RUN_RE.replace_all(trimmed, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows_are_flattened() {
        let raw = "Position\t\tBetrag\nGrundsteuer     312,00 EUR\nHeizung\t1.204,50 EUR";
        assert_eq!(
            normalize_page_text(raw),
            "Position | Betrag\nGrundsteuer | 312,00 EUR\nHeizung | 1.204,50 EUR"
        );
    }

    #[test]
    fn test_whitespace_normalization() {
        let raw = "  Mietvertrag  \n\n\n\n\nzwischen  Herrn A\r\nund Frau B  ";
        assert_eq!(
            normalize_page_text(raw),
            "Mietvertrag\n\nzwischen Herrn A\nund Frau B"
        );
    }

    #[test]
    fn test_rejects_non_pdf_bytes() {
        let err = extract_pages_blocking(b"not a pdf").unwrap_err();
        assert!(matches!(err, PipelineError::UnreadablePdf(_)));
    }

    #[tokio::test]
    async fn test_truncated_pdf_is_unreadable() {
        let err = extract_pages(b"%PDF-1.4\n1 0 obj << /Type /Catalog".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnreadablePdf(_)));
    }
}
