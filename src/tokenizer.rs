//! `cl100k_base` tokenizer for the chunker.
//!
//! Wraps `tiktoken-rs` behind the core [`Tokenizer`] trait. Token start
//! offsets are recovered by decoding each token back to its bytes and
//! summing their lengths. A token may end in the middle of a multi-byte
//! character; the chunker keeps such a character whole and counts every
//! token it spans against the chunk size.

use anyhow::Result;
use tiktoken_rs::CoreBPE;

use property_rag_core::chunk::{Tokenizer, WordTokenizer};

pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn token_starts(&self, text: &str) -> Vec<usize> {
        let tokens = self.bpe.encode_ordinary(text);
        let mut starts = Vec::with_capacity(tokens.len());
        let mut offset = 0;
        for bytes in self.bpe._decode_native_and_split(tokens) {
            starts.push(offset);
            offset += bytes.len();
        }
        if offset != text.len() {
            tracing::warn!(
                decoded = offset,
                expected = text.len(),
                "token bytes do not cover the text, falling back to whitespace tokens"
            );
            return WordTokenizer.token_starts(text);
        }
        starts
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}
