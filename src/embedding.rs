//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and the three remote backends the engine
//! supports:
//! - **[`OpenAiEmbedder`]** — `POST {endpoint}/embeddings`; also serves any
//!   OpenAI-compatible service via a custom endpoint.
//! - **[`AzureEmbedder`]** — Azure deployments (`api-key` header, explicit
//!   `api-version` query parameter).
//! - **[`OllamaEmbedder`]** — a local Ollama instance's `/api/embed`.
//!
//! Every constructed embedder is wrapped in a [`BatchedEmbedder`] that caps
//! texts-per-call at the strictest provider's limit and re-concatenates the
//! sub-batch outputs in order.
//!
//! Also provides vector utilities shared with the store and the tree builder:
//! [`vec_to_blob`], [`blob_to_vec`], [`cosine_similarity`].
//!
//! # Retry Strategy
//!
//! Transient failures use exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Default per-call cap; matches the strictest supported provider.
pub const DEFAULT_MAX_BATCH: usize = 10;

/// Uniform embedding interface over the remote providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Build the configured provider, wrapped with the batch cap.
///
/// With no model configured, returns a placeholder that fails at call time,
/// so startup succeeds and only ingestion reports the missing model.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    if !config.is_configured() {
        return Ok(Arc::new(DisabledEmbedder));
    }
    let inner: Box<dyn Embedder> = match config.provider.as_str() {
        "openai" => Box::new(OpenAiEmbedder::new(config)?),
        "azure" => Box::new(AzureEmbedder::new(config)?),
        "ollama" => Box::new(OllamaEmbedder::new(config)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Arc::new(BatchedEmbedder::new(inner, config.batch_size)))
}

/// Stand-in provider used when embeddings are not configured.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("no embedding model configured")
    }

    fn model_name(&self) -> &str {
        "disabled"
    }
}

// ============ Batch cap wrapper ============

/// Enforces a maximum batch size over any [`Embedder`].
///
/// Longer inputs are split into contiguous sub-batches; outputs are
/// concatenated in input order. A sub-batch failure aborts the whole call and
/// reports the failing range `[i, j)`.
pub struct BatchedEmbedder {
    inner: Box<dyn Embedder>,
    max_batch: usize,
}

impl BatchedEmbedder {
    pub fn new(inner: Box<dyn Embedder>, max_batch: usize) -> Self {
        Self {
            inner,
            max_batch: max_batch.max(1),
        }
    }
}

#[async_trait]
impl Embedder for BatchedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        let mut start = 0;
        while start < texts.len() {
            let end = (start + self.max_batch).min(texts.len());
            let batch = self
                .inner
                .embed(&texts[start..end])
                .await
                .map_err(|e| anyhow!("embedding batch [{}, {}) failed: {}", start, end, e))?;
            if batch.len() != end - start {
                bail!(
                    "embedding batch [{}, {}) returned {} vectors",
                    start,
                    end,
                    batch.len()
                );
            }
            vectors.extend(batch);
            start = end;
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

// ============ Shared HTTP plumbing ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// POST a JSON body with retry/backoff, returning the parsed response.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.json(body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("{} error {}: {}", url, status, body_text));
                    continue;
                }
                bail!("{} error {}: {}", url, status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("request failed after retries")))
}

/// Parse an OpenAI-shaped embeddings response (`data[].embedding`).
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

// ============ OpenAI (and compatible) ============

pub struct OpenAiEmbedder {
    model: String,
    api_key: String,
    endpoint: String,
    dimensions: Option<usize>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.model.is_empty() {
            bail!("embedding.model required for the openai provider");
        }
        let endpoint = if config.endpoint.is_empty() {
            "https://api.openai.com/v1".to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        Ok(Self {
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            endpoint,
            dimensions: config.dimensions,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }
        let url = format!("{}/embeddings", self.endpoint);
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let json = post_with_retry(&self.client, &url, &headers, &body, self.max_retries).await?;
        parse_openai_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============ Azure ============

pub struct AzureEmbedder {
    model: String,
    api_key: String,
    endpoint: String,
    api_version: String,
    dimensions: Option<usize>,
    max_retries: u32,
    client: reqwest::Client,
}

impl AzureEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.model.is_empty() {
            bail!("embedding.model required for the azure provider");
        }
        if config.endpoint.is_empty() {
            bail!("embedding.endpoint required for the azure provider");
        }
        Ok(Self {
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_version: config.azure_api_version.clone(),
            dimensions: config.dimensions,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for AzureEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut body = serde_json::json!({ "input": texts });
        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }
        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            self.endpoint, self.model, self.api_version
        );
        let headers = [("api-key", self.api_key.clone())];
        let json = post_with_retry(&self.client, &url, &headers, &body, self.max_retries).await?;
        parse_openai_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    model: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.model.is_empty() {
            bail!("embedding.model required for the ollama provider");
        }
        let endpoint = if config.endpoint.is_empty() {
            "http://localhost:11434".to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };
        Ok(Self {
            model: config.model.clone(),
            endpoint,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.endpoint);
        let json = post_with_retry(&self.client, &url, &[], &body, self.max_retries).await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid ollama response: missing embeddings array"))?;

        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let vec: Vec<f32> = embedding
                .as_array()
                .ok_or_else(|| anyhow!("invalid ollama response: embedding is not an array"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            result.push(vec);
        }
        Ok(result)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for the vector table.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode the blob form back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    /// Records batch sizes and returns a constant unit vector per text.
    struct CountingEmbedder {
        calls: Arc<Mutex<Vec<usize>>>,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut calls = self.calls.lock().unwrap();
            let seen: usize = calls.iter().sum();
            calls.push(texts.len());
            if let Some(fail_from) = self.fail_from {
                if seen >= fail_from {
                    bail!("provider down");
                }
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn counting(fail_from: Option<usize>) -> (Arc<Mutex<Vec<usize>>>, BatchedEmbedder) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = Box::new(CountingEmbedder {
            calls: calls.clone(),
            fail_from,
        });
        (calls, BatchedEmbedder::new(inner, 10))
    }

    #[tokio::test]
    async fn test_batch_cap_splits_contiguously() {
        let (calls, batched) = counting(None);
        let texts: Vec<String> = (0..25).map(|i| format!("t{}", i)).collect();
        let out = batched.embed(&texts).await.unwrap();
        assert_eq!(out.len(), 25);
        assert_eq!(*calls.lock().unwrap(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_batch_empty_input() {
        let (calls, batched) = counting(None);
        let out = batched.embed(&[]).await.unwrap();
        assert!(out.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_failure_reports_range() {
        let (_calls, batched) = counting(Some(10));
        let texts: Vec<String> = (0..15).map(|i| format!("t{}", i)).collect();
        let err = batched.embed(&texts).await.unwrap_err();
        assert!(err.to_string().contains("[10, 15)"), "got {}", err);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_parse_openai_shape() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[1].len(), 2);
    }
}
