//! Configuration parsing and validation.
//!
//! docbase is configured via a TOML file (default:
//! `<platform_config_dir>/docbase/docbase.toml`). The config defines the data
//! directory, vector dimension, embedding and summarizer providers, queue
//! worker counts, and the defaults applied to newly created libraries.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application identifier; used for the platform config directory and the
/// database file name.
pub const APP_ID: &str = "docbase";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub raptor: RaptorConfig,
    #[serde(default)]
    pub library: LibraryDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Root data directory. Defaults to `<platform_config_dir>/docbase`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Vector dimension baked into the store at first migration.
    #[serde(default = "default_vector_dims")]
    pub vector_dims: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            vector_dims: default_vector_dims(),
        }
    }
}

fn default_vector_dims() -> usize {
    1536
}

impl AppConfig {
    /// Resolved data directory: explicit override or the platform default.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_ID)
        })
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(format!("{}.sqlite", APP_ID))
    }

    /// Directory document files are copied into, per library.
    pub fn documents_dir(&self, library_id: i64) -> PathBuf {
        self.data_dir().join("documents").join(library_id.to_string())
    }
}

/// Provider settings for the embedding adapter.
///
/// `provider` is one of `openai`, `azure`, `ollama`; OpenAI-compatible
/// services use `openai` with a custom `endpoint`.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Base URL. Empty means the provider's public default.
    #[serde(default)]
    pub endpoint: String,
    /// Optional request-side dimension override (OpenAI `dimensions` field).
    #[serde(default)]
    pub dimensions: Option<usize>,
    /// Azure deployments require an explicit API version.
    #[serde(default = "default_azure_api_version")]
    pub azure_api_version: String,
    /// Hard cap on texts per provider call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: String::new(),
            api_key: String::new(),
            endpoint: String::new(),
            dimensions: None,
            azure_api_version: default_azure_api_version(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embed_provider() -> String {
    "openai".to_string()
}
fn default_azure_api_version() -> String {
    "2024-02-01".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

/// Chat-completion provider used for RAPTOR cluster summaries.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SummarizerConfig {
    /// Empty provider disables LLM summaries; raptor then falls back to
    /// truncated concatenation.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueuesConfig {
    #[serde(default = "default_document_workers")]
    pub document_workers: usize,
    #[serde(default = "default_document_poll_ms")]
    pub document_poll_ms: u64,
    #[serde(default = "default_thumbnail_workers")]
    pub thumbnail_workers: usize,
    #[serde(default = "default_thumbnail_poll_ms")]
    pub thumbnail_poll_ms: u64,
    /// Lease length for a claimed job; must exceed the longest handler run.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            document_workers: default_document_workers(),
            document_poll_ms: default_document_poll_ms(),
            thumbnail_workers: default_thumbnail_workers(),
            thumbnail_poll_ms: default_thumbnail_poll_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_document_workers() -> usize {
    2
}
fn default_document_poll_ms() -> u64 {
    100
}
fn default_thumbnail_workers() -> usize {
    8
}
fn default_thumbnail_poll_ms() -> u64 {
    50
}
fn default_lease_secs() -> u64 {
    300
}

/// Summarization-tree tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct RaptorConfig {
    #[serde(default = "default_max_level")]
    pub max_level: usize,
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,
    #[serde(default = "default_max_tokens_per_summary")]
    pub max_tokens_per_summary: usize,
}

impl Default for RaptorConfig {
    fn default() -> Self {
        Self {
            max_level: default_max_level(),
            cluster_size: default_cluster_size(),
            min_nodes: default_min_nodes(),
            max_tokens_per_summary: default_max_tokens_per_summary(),
        }
    }
}

fn default_max_level() -> usize {
    2
}
fn default_cluster_size() -> usize {
    5
}
fn default_min_nodes() -> usize {
    3
}
fn default_max_tokens_per_summary() -> usize {
    4000
}

/// Defaults applied when a library is created without explicit settings.
#[derive(Debug, Deserialize, Clone)]
pub struct LibraryDefaults {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
}

impl Default for LibraryDefaults {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            match_threshold: default_match_threshold(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_top_k() -> i64 {
    5
}
fn default_match_threshold() -> f64 {
    0.4
}

impl EmbeddingConfig {
    pub fn is_configured(&self) -> bool {
        !self.model.is_empty()
    }
}

impl SummarizerConfig {
    pub fn is_configured(&self) -> bool {
        !self.provider.is_empty() && !self.model.is_empty()
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    if config.app.vector_dims == 0 {
        anyhow::bail!("app.vector_dims must be > 0");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "openai" | "azure" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, azure, or ollama.",
            other
        ),
    }

    if config.library.chunk_size == 0 {
        anyhow::bail!("library.chunk_size must be > 0");
    }
    if config.library.chunk_overlap >= config.library.chunk_size {
        anyhow::bail!("library.chunk_overlap must be smaller than chunk_size");
    }

    if config.queues.document_workers == 0 || config.queues.thumbnail_workers == 0 {
        anyhow::bail!("queue worker counts must be > 0");
    }

    Ok(config)
}
