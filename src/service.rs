//! Document service facade.
//!
//! The thin coordinator the rest of the application talks to: uploads files
//! into the store, enqueues ingestion and thumbnail jobs, serves paginated
//! listings and keyword search over the name index, and owns the
//! delete/rename/reprocess lifecycle. All heavy lifting happens in the job
//! handlers this module registers on the task manager.

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Store;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::events::{EventSink, EVENT_THUMBNAIL, EVENT_UPLOADED, EVENT_UPLOAD_PROGRESS};
use crate::ingest::Ingestor;
use crate::llm::ProviderResolver;
use crate::models::{Document, Library};
use crate::queue::{
    Handler, JobContext, TaskManager, JOB_PROCESS_DOCUMENT, JOB_REEMBED_DOCUMENT, JOB_THUMBNAIL,
    QUEUE_DOCUMENT, QUEUE_THUMBNAIL,
};
use crate::tokenizer;

/// The only extensions the engine accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "md", "csv", "xlsx", "html", "htm", "ofd",
];

const MAX_PAGE_SIZE: i64 = 100;

/// Renders a document thumbnail as a data URI. Rendering lives in the shell;
/// the default produces nothing.
pub trait Thumbnailer: Send + Sync {
    fn render(&self, path: &Path, extension: &str) -> anyhow::Result<String>;
}

pub struct NoThumbnailer;

impl Thumbnailer for NoThumbnailer {
    fn render(&self, _path: &Path, _extension: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

pub struct DocumentService {
    store: Store,
    config: Config,
    tasks: Arc<TaskManager>,
    ingestor: Arc<Ingestor>,
    embedder: Arc<dyn Embedder>,
    resolver: Arc<dyn ProviderResolver>,
    events: Arc<dyn EventSink>,
    /// Back-reference captured by the registered job handlers.
    self_ref: std::sync::Weak<DocumentService>,
}

impl DocumentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        config: Config,
        tasks: Arc<TaskManager>,
        ingestor: Arc<Ingestor>,
        embedder: Arc<dyn Embedder>,
        resolver: Arc<dyn ProviderResolver>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            config,
            tasks,
            ingestor,
            embedder,
            resolver,
            events,
            self_ref: self_ref.clone(),
        })
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Register the ingestion and thumbnail handlers. Must run before the
    /// task manager starts.
    pub fn register_handlers(&self, thumbnailer: Arc<dyn Thumbnailer>) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let service = this.clone();
        let process: Handler = Arc::new(move |ctx: JobContext| {
            let service = service.clone();
            Box::pin(async move { service.handle_process(ctx).await })
        });
        self.tasks
            .register_handler(QUEUE_DOCUMENT, JOB_PROCESS_DOCUMENT, process);

        let service = this.clone();
        let reembed: Handler = Arc::new(move |ctx: JobContext| {
            let service = service.clone();
            Box::pin(async move { service.handle_reembed(ctx).await })
        });
        self.tasks
            .register_handler(QUEUE_DOCUMENT, JOB_REEMBED_DOCUMENT, reembed);

        let service = this.clone();
        let thumb: Handler = Arc::new(move |ctx: JobContext| {
            let service = service.clone();
            let thumbnailer = thumbnailer.clone();
            Box::pin(async move { service.handle_thumbnail(ctx, thumbnailer).await })
        });
        self.tasks
            .register_handler(QUEUE_THUMBNAIL, JOB_THUMBNAIL, thumb);
    }

    async fn handle_process(&self, ctx: JobContext) -> anyhow::Result<()> {
        let document_id = job_document_id(&ctx)?;
        let Some(document) = self.get_document_opt(document_id).await? else {
            // Deleted between submit and dispatch; nothing to do.
            return Ok(());
        };
        let library = self.get_or_create_library(document.library_id).await?;
        let summarizer = self
            .resolver
            .summarizer(
                &library.semantic_segment_provider_id,
                &library.semantic_segment_model_id,
            )
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "summarizer unavailable");
                None
            });

        match self
            .ingestor
            .process_document(
                document.id,
                Path::new(&document.local_path),
                &library,
                self.embedder.clone(),
                summarizer,
                &ctx.run_id,
                &ctx.cancel,
            )
            .await
        {
            // Pipeline failures are recorded on the document row; retrying
            // the job would just repeat them.
            Ok(()) | Err(Error::Cancelled) | Err(Error::Pipeline { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_reembed(&self, ctx: JobContext) -> anyhow::Result<()> {
        let document_id = job_document_id(&ctx)?;
        if self.get_document_opt(document_id).await?.is_none() {
            return Ok(());
        }
        match self
            .ingestor
            .reembed_document_nodes(document_id, self.embedder.clone(), &ctx.run_id, &ctx.cancel)
            .await
        {
            Ok(()) | Err(Error::Cancelled) | Err(Error::Pipeline { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_thumbnail(
        &self,
        ctx: JobContext,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> anyhow::Result<()> {
        let document_id = job_document_id(&ctx)?;
        let Some(document) = self.get_document_opt(document_id).await? else {
            return Ok(());
        };
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        let path = PathBuf::from(&document.local_path);
        let extension = document.extension.clone();
        let icon = tokio::task::spawn_blocking(move || thumbnailer.render(&path, &extension))
            .await??;

        sqlx::query("UPDATE documents SET thumb_icon = ? WHERE id = ?")
            .bind(&icon)
            .bind(document_id)
            .execute(self.store.write())
            .await?;

        self.events.emit(
            EVENT_THUMBNAIL,
            serde_json::json!({
                "document_id": document_id,
                "library_id": document.library_id,
                "thumb_icon": icon,
            }),
        );
        Ok(())
    }

    // ============ Upload ============

    /// Upload files into a library and enqueue their processing.
    ///
    /// Unsupported extensions and per-file failures are skipped (logged and
    /// counted in the progress events); the successfully inserted rows are
    /// returned. A duplicate `(library_id, content_hash)` replaces the
    /// existing document: its jobs are cancelled and its row and file removed
    /// before the new copy lands.
    pub async fn upload_documents(
        &self,
        library_id: i64,
        paths: &[PathBuf],
    ) -> Result<Vec<Document>> {
        self.get_or_create_library(library_id).await?;

        let total = paths.len();
        let mut uploaded = Vec::new();

        for (done, path) in paths.iter().enumerate() {
            match self.upload_one(library_id, path).await {
                Ok(document) => {
                    if let Ok(payload) = serde_json::to_value(&document) {
                        self.events.emit(EVENT_UPLOADED, payload);
                    }
                    uploaded.push(document);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), key = e.error_key(), error = %e, "upload failed");
                }
            }
            self.events.emit(
                EVENT_UPLOAD_PROGRESS,
                serde_json::json!({
                    "library_id": library_id,
                    "total": total,
                    "done": done + 1,
                }),
            );
        }

        Ok(uploaded)
    }

    async fn upload_one(&self, library_id: i64, path: &Path) -> Result<Document> {
        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("invalid file name: {}", path.display())))?
            .to_string();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(Error::UnsupportedFileType(extension));
        }

        let bytes = std::fs::read(path)?;
        let content_hash = format!("{:x}", Sha256::digest(&bytes));

        // Same content already in this library: replace it outright.
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE library_id = ? AND content_hash = ?",
        )
        .bind(library_id)
        .bind(&content_hash)
        .fetch_optional(self.store.read())
        .await?;
        if let Some(existing_id) = existing {
            self.delete_document(existing_id).await?;
        }

        let dir = self.config.app.documents_dir(library_id);
        std::fs::create_dir_all(&dir)?;
        let stored_path = dir.join(format!("{}_{}", &content_hash[..8], original_name));
        write_synced(&stored_path, &bytes)?;

        let run_id = Uuid::new_v4().to_string();
        let name_tokens = tokenizer::tokenize_name(&original_name);

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents
                (library_id, original_name, name_tokens, file_size, content_hash,
                 extension, mime_type, source_type, local_path, processing_run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'local', ?, ?)
            RETURNING id
            "#,
        )
        .bind(library_id)
        .bind(&original_name)
        .bind(&name_tokens)
        .bind(bytes.len() as i64)
        .bind(&content_hash)
        .bind(&extension)
        .bind(mime_type_for(&extension))
        .bind(stored_path.to_string_lossy().as_ref())
        .bind(&run_id)
        .fetch_one(self.store.write())
        .await;

        let document_id: i64 = match inserted {
            Ok(row) => row.get("id"),
            Err(e) => {
                // Roll the copy back so a failed insert leaks no file.
                let _ = std::fs::remove_file(&stored_path);
                return Err(e.into());
            }
        };

        self.tasks
            .submit(
                QUEUE_DOCUMENT,
                JOB_PROCESS_DOCUMENT,
                &doc_task_key(document_id),
                &run_id,
                serde_json::json!({ "document_id": document_id }),
            )
            .await?;
        self.tasks
            .submit(
                QUEUE_THUMBNAIL,
                JOB_THUMBNAIL,
                &thumb_task_key(document_id),
                &run_id,
                serde_json::json!({ "document_id": document_id }),
            )
            .await?;

        self.get_document(document_id).await
    }

    // ============ Listing ============

    /// Cursor-paginated listing, optionally filtered by a name keyword.
    ///
    /// Without a keyword, pages walk `id` descending (ascending when `sort`
    /// ends in `asc`, with `before_id` acting as the after-cursor). With a
    /// keyword, the tokenized prefix query runs against the name index and
    /// results order by rank. An input that tokenizes to nothing returns no
    /// rows.
    pub async fn list_documents_page(
        &self,
        library_id: i64,
        keyword: &str,
        before_id: i64,
        limit: i64,
        sort: &str,
    ) -> Result<Vec<Document>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        if keyword.trim().is_empty() {
            let ascending = sort.ends_with("asc");
            let sql = if ascending {
                "SELECT * FROM documents WHERE library_id = ? AND (? = 0 OR id > ?) \
                 ORDER BY id ASC LIMIT ?"
            } else {
                "SELECT * FROM documents WHERE library_id = ? AND (? = 0 OR id < ?) \
                 ORDER BY id DESC LIMIT ?"
            };
            let rows = sqlx::query_as::<_, Document>(sql)
                .bind(library_id)
                .bind(before_id)
                .bind(before_id)
                .bind(limit)
                .fetch_all(self.store.read())
                .await?;
            return Ok(rows);
        }

        let match_query = tokenizer::build_match_query(keyword);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, Document>(
            r#"
            SELECT d.*
            FROM doc_name_fts
            JOIN documents d ON d.id = doc_name_fts.rowid
            WHERE doc_name_fts MATCH ? AND d.library_id = ?
            ORDER BY doc_name_fts.rank, d.id DESC
            LIMIT ?
            "#,
        )
        .bind(&match_query)
        .bind(library_id)
        .bind(limit)
        .fetch_all(self.store.read())
        .await?;
        Ok(rows)
    }

    // ============ Lifecycle ============

    /// Rename the document and its physical file, keeping the hash prefix.
    pub async fn rename_document(&self, document_id: i64, new_name: &str) -> Result<Document> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::Validation("document name must not be empty".into()));
        }

        let document = self.get_document(document_id).await?;
        let mut full_name = new_name.to_string();
        let suffix = format!(".{}", document.extension);
        if !full_name.to_lowercase().ends_with(&suffix) {
            full_name.push_str(&suffix);
        }

        let old_path = PathBuf::from(&document.local_path);
        let new_path = old_path
            .parent()
            .map(|p| p.join(format!("{}_{}", &document.content_hash[..8], full_name)))
            .ok_or_else(|| Error::RenameFailed(document.local_path.clone()))?;

        if old_path.exists() && old_path != new_path {
            std::fs::rename(&old_path, &new_path)
                .map_err(|e| Error::RenameFailed(format!("{}: {}", old_path.display(), e)))?;
        }

        let name_tokens = tokenizer::tokenize_name(&full_name);
        sqlx::query(
            r#"
            UPDATE documents
            SET original_name = ?, name_tokens = ?, local_path = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ')
            WHERE id = ?
            "#,
        )
        .bind(&full_name)
        .bind(&name_tokens)
        .bind(new_path.to_string_lossy().as_ref())
        .bind(document_id)
        .execute(self.store.write())
        .await?;

        self.get_document(document_id).await
    }

    /// Drop derived state and run the pipeline again under a fresh run id.
    pub async fn reprocess_document(&self, document_id: i64) -> Result<()> {
        let document = self.get_document(document_id).await?;
        if !Path::new(&document.local_path).exists() {
            return Err(Error::FileMissing(document.local_path));
        }

        self.tasks.cancel(&doc_task_key(document_id));
        self.delete_derived_rows(document_id).await?;

        let run_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            UPDATE documents
            SET processing_run_id = ?,
                parsing_status = 0, parsing_progress = 0, parsing_error = '',
                embedding_status = 0, embedding_progress = 0, embedding_error = '',
                word_total = 0, split_total = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ')
            WHERE id = ?
            "#,
        )
        .bind(&run_id)
        .bind(document_id)
        .execute(self.store.write())
        .await?;

        self.tasks
            .submit(
                QUEUE_DOCUMENT,
                JOB_PROCESS_DOCUMENT,
                &doc_task_key(document_id),
                &run_id,
                serde_json::json!({ "document_id": document_id }),
            )
            .await?;
        Ok(())
    }

    /// Re-embed existing nodes under a fresh run id (no reparse).
    pub async fn reembed_document(&self, document_id: i64) -> Result<()> {
        self.get_document(document_id).await?;
        self.tasks.cancel(&doc_task_key(document_id));

        let run_id = Uuid::new_v4().to_string();
        sqlx::query("UPDATE documents SET processing_run_id = ? WHERE id = ?")
            .bind(&run_id)
            .bind(document_id)
            .execute(self.store.write())
            .await?;

        self.tasks
            .submit(
                QUEUE_DOCUMENT,
                JOB_REEMBED_DOCUMENT,
                &doc_task_key(document_id),
                &run_id,
                serde_json::json!({ "document_id": document_id }),
            )
            .await?;
        Ok(())
    }

    /// Remove the document, its file, and every derived row.
    pub async fn delete_document(&self, document_id: i64) -> Result<()> {
        let document = self.get_document(document_id).await?;

        self.tasks.cancel(&doc_task_key(document_id));
        self.tasks.cancel(&thumb_task_key(document_id));

        if !document.local_path.is_empty() {
            if let Err(e) = std::fs::remove_file(&document.local_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %document.local_path, error = %e, "file removal failed");
                }
            }
        }

        let mut tx = self.store.begin().await?;
        // The vector table has no cascade, and the node delete is explicit so
        // the trigger-maintained index empties inside this transaction.
        delete_nodes_and_vectors(&mut tx, document_id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn delete_derived_rows(&self, document_id: i64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        delete_nodes_and_vectors(&mut tx, document_id).await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Lookups ============

    pub async fn get_document(&self, document_id: i64) -> Result<Document> {
        self.get_document_opt(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))
    }

    async fn get_document_opt(&self, document_id: i64) -> Result<Option<Document>> {
        Ok(
            sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(self.store.read())
                .await?,
        )
    }

    /// Fetch the library, creating it with configured defaults on first use.
    pub async fn get_or_create_library(&self, library_id: i64) -> Result<Library> {
        let existing = sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE id = ?")
            .bind(library_id)
            .fetch_optional(self.store.read())
            .await?;
        if let Some(library) = existing {
            return Ok(library);
        }

        let defaults = &self.config.library;
        sqlx::query(
            r#"
            INSERT INTO libraries (id, name, chunk_size, chunk_overlap, top_k, match_threshold)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(library_id)
        .bind(format!("library-{}", library_id))
        .bind(defaults.chunk_size as i64)
        .bind(defaults.chunk_overlap as i64)
        .bind(defaults.top_k)
        .bind(defaults.match_threshold)
        .execute(self.store.write())
        .await?;

        sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE id = ?")
            .bind(library_id)
            .fetch_one(self.store.read())
            .await
            .map_err(Into::into)
    }
}

/// Point-delete the document's vectors (virtual tables take no subquery
/// deletes), then its nodes; the FTS triggers fire in the same transaction.
async fn delete_nodes_and_vectors(
    tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
    document_id: i64,
) -> Result<()> {
    let node_ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM document_nodes WHERE document_id = ?")
            .bind(document_id)
            .fetch_all(&mut **tx)
            .await?;
    for node_id in &node_ids {
        sqlx::query("DELETE FROM doc_vec WHERE id = ?")
            .bind(node_id)
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query("DELETE FROM document_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn job_document_id(ctx: &JobContext) -> anyhow::Result<i64> {
    ctx.data
        .get("document_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("job payload missing document_id"))
}

pub fn doc_task_key(document_id: i64) -> String {
    format!("doc:{}", document_id)
}

pub fn thumb_task_key(document_id: i64) -> String {
    format!("thumb:{}", document_id)
}

fn mime_type_for(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "html" | "htm" => "text/html",
        "ofd" => "application/ofd",
        _ => "application/octet-stream",
    }
}

/// Write bytes and flush them to disk before returning.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
