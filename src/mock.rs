//! Deterministic in-process providers for tests and offline runs.
//!
//! - [`ScriptedCompletion`]: replays queued completions, then answers by
//!   matching prompt text against routes, then falls back to a default.
//! - [`HashEmbedder`]: bag-of-words feature hashing; texts sharing words
//!   get similar vectors.
//! - [`FlakyEmbedder`]: fails transiently a fixed number of times before
//!   delegating.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::llm::{CompletionConstraints, CompletionProvider, Prompt};
use crate::retry::ProviderError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    routes: Vec<(String, String)>,
    pub default_response: String,
    prompts: Mutex<Vec<(Prompt, CompletionConstraints)>>,
}

impl ScriptedCompletion {
    /// Replay `responses` in order, one per call.
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            queue: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    /// Answer with `response` whenever the prompt contains `needle`.
    /// Routes are consulted once the queue is empty, in insertion order.
    pub fn route(mut self, needle: &str, response: &str) -> Self {
        self.routes.push((needle.to_string(), response.to_string()));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<Prompt> {
        lock(&self.prompts).iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn constraints(&self) -> Vec<CompletionConstraints> {
        lock(&self.prompts).iter().map(|(_, c)| *c).collect()
    }

    pub fn calls(&self) -> usize {
        lock(&self.prompts).len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, ProviderError> {
        lock(&self.prompts).push((prompt.clone(), *constraints));
        if let Some(next) = lock(&self.queue).pop_front() {
            return next;
        }
        let routed = self.routes.iter().find(|(needle, _)| {
            prompt.user.contains(needle.as_str()) || prompt.system.contains(needle.as_str())
        });
        Ok(routed
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_response.clone()))
    }
}

/// Feature-hashing embedder over lowercase alphanumeric words.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            v[(bucket % self.dims as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Fails with a transient error for the first `failures` calls.
#[derive(Debug)]
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyEmbedder {
    pub fn new(inner: HashEmbedder, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ProviderError::Transient(format!(
                "503 Service Unavailable (simulated failure {})",
                call + 1
            )));
        }
        self.inner.embed(texts).await
    }
}
