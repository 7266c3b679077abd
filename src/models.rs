//! Core data models.
//!
//! These types mirror the storage schema: documents, their tree of nodes
//! (leaves and summaries), and the library settings that parameterize an
//! ingestion run.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-phase processing state stored as an integer on the document row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum ProcessStatus {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
}

impl ProcessStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ProcessStatus::Processing,
            2 => ProcessStatus::Completed,
            3 => ProcessStatus::Failed,
            _ => ProcessStatus::Pending,
        }
    }
}

/// Where a document's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Local,
    Web,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Local => "local",
            SourceType::Web => "web",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "web" => SourceType::Web,
            _ => SourceType::Local,
        }
    }
}

/// A user document row. Owns its nodes and their vectors (cascade delete).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Document {
    pub id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub library_id: i64,
    pub original_name: String,
    pub name_tokens: String,
    pub thumb_icon: String,
    pub file_size: i64,
    pub content_hash: String,
    pub extension: String,
    pub mime_type: String,
    pub source_type: String,
    pub local_path: String,
    pub web_url: String,
    /// Opaque id minted for every ingestion attempt; stale runs must not
    /// overwrite rows carrying a newer one.
    pub processing_run_id: String,
    pub parsing_status: i64,
    pub parsing_progress: i64,
    pub parsing_error: String,
    pub embedding_status: i64,
    pub embedding_progress: i64,
    pub embedding_error: String,
    pub word_total: i64,
    pub split_total: i64,
}

/// A node in a document's retrieval tree.
///
/// `level` 0 nodes are splitter output; level >= 1 nodes are cluster
/// summaries. A non-null `parent_id` always references a node of strictly
/// greater level within the same document.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentNode {
    pub id: i64,
    pub library_id: i64,
    pub document_id: i64,
    pub content: String,
    pub content_tokens: String,
    pub level: i64,
    pub parent_id: Option<i64>,
    pub chunk_order: i64,
}

/// Library settings read by the ingestion orchestrator.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Library {
    pub id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub name: String,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub semantic_segment_provider_id: String,
    pub semantic_segment_model_id: String,
    pub top_k: i64,
    pub match_threshold: f64,
}

/// Payload of the `document:progress` event; one row snapshot per emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub document_id: i64,
    pub library_id: i64,
    pub parsing_status: i64,
    pub parsing_progress: i64,
    pub parsing_error: String,
    pub embedding_status: i64,
    pub embedding_progress: i64,
    pub embedding_error: String,
}
