//! Completion provider abstraction and implementations.
//!
//! The classifier, field extractor, and answer synthesizer all talk to a
//! language model through [`CompletionProvider`]:
//! - **[`DisabledCompletion`]**: always fails; used when no model is configured.
//! - **[`OpenAIChat`]**: `POST /v1/chat/completions`, with JSON mode on request.
//! - **[`OllamaChat`]**: `POST /api/chat` on a local Ollama instance.
//!
//! Like the embedding providers, these make one attempt per call;
//! [`Completer`] applies the retry policy and the configured sampling
//! constraints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use property_rag_core::{PipelineError, PipelineResult};

use crate::config::LlmConfig;
use crate::retry::{retry_transient, ProviderError, RetryPolicy};

/// A two-message chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionConstraints {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider to emit a single JSON object.
    pub json: bool,
}

impl Default for CompletionConstraints {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.0,
            json: false,
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, ProviderError>;
}

pub fn create_completion_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Retrying front end over a [`CompletionProvider`].
#[derive(Clone)]
pub struct Completer {
    provider: Arc<dyn CompletionProvider>,
    retry: RetryPolicy,
    defaults: CompletionConstraints,
}

impl Completer {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            retry: config.retry_policy(),
            defaults: CompletionConstraints {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                json: false,
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Complete `prompt` with the configured constraints.
    pub async fn complete(&self, prompt: &Prompt, json: bool) -> PipelineResult<String> {
        self.complete_with(prompt, CompletionConstraints { json, ..self.defaults })
            .await
    }

    /// Complete `prompt` with explicit constraints.
    pub async fn complete_with(
        &self,
        prompt: &Prompt,
        constraints: CompletionConstraints,
    ) -> PipelineResult<String> {
        retry_transient("completion", self.retry, || {
            self.provider.complete(prompt, &constraints)
        })
        .await
        .map_err(|e| PipelineError::CompletionProvider {
            attempts: e.attempts,
            message: e.last.to_string(),
        })
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn messages(prompt: &Prompt) -> serde_json::Value {
    serde_json::json!([
        {"role": "system", "content": prompt.system},
        {"role": "user", "content": prompt.user},
    ])
}

// ============ Disabled ============

pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _prompt: &Prompt,
        _constraints: &CompletionConstraints,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Permanent(
            "LLM provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

/// Chat completions against the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIChat {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages(prompt),
            "temperature": constraints.temperature,
            "max_tokens": constraints.max_tokens,
        });
        if constraints.json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| {
                ProviderError::Permanent(
                    "Invalid OpenAI response: missing choices[0].message.content".to_string(),
                )
            })
    }
}

// ============ Ollama ============

pub struct OllamaChat {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages(prompt),
            "stream": false,
            "options": {
                "temperature": constraints.temperature,
                "num_predict": constraints.max_tokens,
            },
        });
        if constraints.json {
            body["format"] = serde_json::json!("json");
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("Ollama", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| {
                ProviderError::Permanent(
                    "Invalid Ollama response: missing message.content".to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedCompletion;

    #[tokio::test]
    async fn test_completer_retries_transient_errors() {
        let provider = Arc::new(ScriptedCompletion::with_results(vec![
            Err(ProviderError::Transient("503".into())),
            Ok("fine".into()),
        ]));
        let completer = Completer::new(provider.clone(), &LlmConfig::default())
            .with_retry(RetryPolicy::immediate(3));
        let out = completer.complete(&Prompt::new("s", "u"), false).await.unwrap();
        assert_eq!(out, "fine");
        assert_eq!(provider.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_completer_surfaces_permanent_errors() {
        let provider = Arc::new(ScriptedCompletion::with_results(vec![Err(
            ProviderError::Permanent("401 invalid key".into()),
        )]));
        let completer = Completer::new(provider, &LlmConfig::default())
            .with_retry(RetryPolicy::immediate(3));
        let err = completer
            .complete(&Prompt::new("s", "u"), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CompletionProvider { attempts: 1, .. }
        ));
    }

    #[test]
    fn test_disabled_provider_selected() {
        let provider = create_completion_provider(&LlmConfig::default()).unwrap();
        assert_eq!(provider.name(), "disabled");
    }
}
