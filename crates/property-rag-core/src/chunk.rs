//! Sliding-window token chunker.
//!
//! Splits a document's concatenated page text into [`Chunk`]s of at most
//! `chunk_size` tokens, where each chunk starts `chunk_size - overlap`
//! tokens after the previous one. Chunks are byte ranges of the source
//! text, so together they cover it completely with no gaps.
//!
//! Token boundaries come from a [`Tokenizer`]. The app crate plugs in the
//! provider's BPE tokenizer; [`WordTokenizer`] is the dependency-free
//! fallback.
//!
//! # Example
//!
//! ```rust
//! use property_rag_core::chunk::{chunk_pages, ChunkConfig, WordTokenizer};
//! use property_rag_core::models::Page;
//!
//! let pages = vec![Page { number: 1, text: "one two three four five".into() }];
//! let config = ChunkConfig::new(3, 1).unwrap();
//! let chunks = chunk_pages("doc-1", &pages, &config, &WordTokenizer);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "one two three");
//! assert_eq!(chunks[1].text, " three four five");
//! ```

use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{join_pages, sha256_hex, Chunk, Page, PAGE_SEPARATOR};

/// Splits text into tokens, reported as token start offsets.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    /// Byte offset at which each token of `text` starts, in increasing
    /// order. Token `i` spans up to the start of token `i + 1` (or the end
    /// of the text). Empty text yields no tokens.
    fn token_starts(&self, text: &str) -> Vec<usize>;

    fn count_tokens(&self, text: &str) -> usize {
        self.token_starts(text).len()
    }
}

/// Whitespace tokenizer: each token is a word plus the whitespace before it.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn name(&self) -> &str {
        "whitespace"
    }

    fn token_starts(&self, text: &str) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut prev_ws = true;
        for (i, c) in text.char_indices() {
            let ws = c.is_whitespace();
            if i == 0 || (ws && !prev_ws) {
                starts.push(i);
            }
            prev_ws = ws;
        }
        starts
    }
}

/// Validated chunking parameters, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> PipelineResult<Self> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(PipelineError::InvalidChunkConfig {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Tokens between the starts of consecutive chunks.
    pub fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Byte range of each page inside [`join_pages`] output.
fn page_spans(pages: &[Page]) -> Vec<(u32, usize)> {
    let mut spans = Vec::with_capacity(pages.len());
    let mut offset = 0;
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            offset += PAGE_SEPARATOR.len();
        }
        spans.push((page.number, offset));
        offset += page.text.len();
    }
    spans
}

/// Page containing byte `offset`. Separator bytes belong to the page before them.
fn page_at(spans: &[(u32, usize)], offset: usize) -> u32 {
    spans
        .iter()
        .take_while(|(_, start)| *start <= offset)
        .last()
        .or_else(|| spans.first())
        .map(|(n, _)| *n)
        .unwrap_or(1)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Token starts made safe to slice with, each paired with the number of
/// tokenizer tokens it stands for.
///
/// The first start is 0, every start sits on a char boundary, and starts
/// strictly increase. A token that begins inside a multi-byte character is
/// folded into the unit before it, so that unit counts more than one token.
fn token_units(text: &str, raw: Vec<usize>) -> Vec<(usize, usize)> {
    let mut units: Vec<(usize, usize)> = Vec::with_capacity(raw.len());
    for s in raw {
        let s = snap_to_char_boundary(text, s);
        match units.last_mut() {
            Some((last, weight)) if s <= *last || s >= text.len() => *weight += 1,
            None if s >= text.len() => {}
            _ => units.push((s, 1)),
        }
    }
    if let Some((first, _)) = units.first_mut() {
        *first = 0;
    } else if !text.is_empty() {
        units.push((0, 1));
    }
    units
}

/// Chunk the concatenation of `pages`.
///
/// # Guarantees
///
/// - Chunk 0 starts at offset 0 and the last chunk ends at the end of the text.
/// - Each chunk starts at or before the end of the previous one.
/// - A chunk holds at most `chunk_size` tokens and shares at most `overlap`
///   tokens with the next one. Both are exact when every token starts on a
///   char boundary; a character split across tokens is never cut, so its
///   tokens move together. Only `chunk_size` smaller than one character's
///   tokens can exceed the limit.
/// - Indices are contiguous from 0; offsets are on UTF-8 char boundaries.
/// - Text without any tokens yields no chunks.
pub fn chunk_pages(
    document_id: &str,
    pages: &[Page],
    config: &ChunkConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<Chunk> {
    let text = join_pages(pages);
    let units = token_units(&text, tokenizer.token_starts(&text));
    let spans = page_spans(pages);
    let n = units.len();

    let mut chunks = Vec::new();
    let mut first = 0;
    let mut tokens_before = 0;
    while first < n {
        let mut end = first;
        let mut token_count = 0;
        while end < n && (end == first || token_count + units[end].1 <= config.chunk_size) {
            token_count += units[end].1;
            end += 1;
        }

        let start_offset = units[first].0;
        let end_offset = if end == n { text.len() } else { units[end].0 };
        let slice = &text[start_offset..end_offset];
        chunks.push(Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index: chunks.len() as i64,
            text: slice.to_string(),
            hash: sha256_hex(slice.as_bytes()),
            token_start: tokens_before,
            token_count,
            start_offset,
            end_offset,
            page_start: page_at(&spans, start_offset),
            page_end: page_at(&spans, end_offset.saturating_sub(1).max(start_offset)),
        });
        if end == n {
            break;
        }

        // Step back from the end over at most `overlap` tokens.
        let mut next = end;
        let mut shared = 0;
        while next > first + 1 && shared + units[next - 1].1 <= config.overlap {
            next -= 1;
            shared += units[next].1;
        }
        tokens_before += units[first..next].iter().map(|(_, w)| w).sum::<usize>();
        first = next;
    }
    chunks
}
