//! Cluster summarization via a chat-completion model.
//!
//! The tree builder only needs one operation — turn a block of concatenated
//! chunk text into a short objective summary — so the seam is a single-method
//! [`Summarizer`] trait. The concrete implementation speaks the
//! OpenAI-compatible chat API (which also covers Azure deployments and
//! Ollama's `/v1` endpoint). When no summarizer is configured the builder
//! falls back to truncated concatenation and never touches this module.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SummarizerConfig;

const SYSTEM_PROMPT: &str = "You are a document summarizer. Write an objective \
summary of the provided passages in 200 to 500 Chinese characters, or an \
equivalent length in the passages' own language. Summarize only what the text \
states; do not interpret, evaluate, or add information.";

/// Produces a summary for one cluster's concatenated content.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Build the configured summarizer, or `None` when summaries are disabled.
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Option<Arc<dyn Summarizer>>> {
    if !config.is_configured() {
        return Ok(None);
    }
    match config.provider.as_str() {
        "openai" | "azure" | "ollama" => Ok(Some(Arc::new(ChatSummarizer::new(config)?))),
        other => bail!("Unknown summarizer provider: {}", other),
    }
}

/// Maps a library's semantic-segment provider/model ids to a summarizer.
///
/// Provider CRUD lives outside the engine; the default implementation
/// resolves every id against the statically configured summarizer, swapping
/// in the library's model id when one is set.
pub trait ProviderResolver: Send + Sync {
    fn summarizer(&self, provider_id: &str, model_id: &str)
        -> Result<Option<Arc<dyn Summarizer>>>;
}

pub struct ConfigResolver {
    config: SummarizerConfig,
}

impl ConfigResolver {
    pub fn new(config: SummarizerConfig) -> Self {
        Self { config }
    }
}

impl ProviderResolver for ConfigResolver {
    fn summarizer(
        &self,
        _provider_id: &str,
        model_id: &str,
    ) -> Result<Option<Arc<dyn Summarizer>>> {
        if !self.config.is_configured() {
            return Ok(None);
        }
        let mut config = self.config.clone();
        if !model_id.is_empty() {
            config.model = model_id.to_string();
        }
        create_summarizer(&config)
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatSummarizer {
    model: String,
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl ChatSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        if config.model.is_empty() {
            bail!("summarizer.model required");
        }
        let base = match (config.provider.as_str(), config.endpoint.is_empty()) {
            ("openai", true) => "https://api.openai.com/v1".to_string(),
            ("ollama", true) => "http://localhost:11434/v1".to_string(),
            ("azure", true) => bail!("summarizer.endpoint required for the azure provider"),
            (_, false) => config.endpoint.trim_end_matches('/').to_string(),
            (other, true) => bail!("unknown summarizer provider: {}", other),
        };
        Ok(Self {
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            url: format!("{}/chat/completions", base),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("chat completion error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("invalid chat completion response"))?;

        let summary = content.trim();
        if summary.is_empty() {
            bail!("chat completion returned empty content");
        }
        Ok(summary.to_string())
    }
}
