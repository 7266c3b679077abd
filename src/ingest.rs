//! Ingestion orchestration.
//!
//! One document, one job: parse → split → embed leaves → (optional) tree →
//! one atomic commit. Progress is reported per phase and at every embedding
//! batch boundary, and every write to the document row is guarded by the run
//! id so a superseded job can never clobber a newer one.
//!
//! Phase windows: parsing `[10, 100]`, leaf embedding `[10, 80]`, tree
//! `[80, 100]`. A parse/split failure marks `parsing = failed` and leaves
//! embedding pending; an embed/persist failure keeps `parsing = completed`
//! and marks `embedding = failed`. Cancellation updates nothing.

use anyhow::anyhow;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RaptorConfig;
use crate::db::Store;
use crate::embedding::{vec_to_blob, Embedder};
use crate::error::{Error, Phase, Result};
use crate::events::{EventSink, EVENT_PROGRESS};
use crate::llm::Summarizer;
use crate::models::{DocumentProgress, Library, ProcessStatus};
use crate::parser::ParserRegistry;
use crate::raptor::{PlanNode, RaptorBuilder};
use crate::splitter::{split_document, SplitConfig};
use crate::tokenizer;

pub struct Ingestor {
    store: Store,
    parsers: Arc<ParserRegistry>,
    raptor_config: RaptorConfig,
    /// Batch size used when walking leaves through the embedder; progress is
    /// reported at each boundary.
    embed_batch_size: usize,
    events: Arc<dyn EventSink>,
}

impl Ingestor {
    pub fn new(
        store: Store,
        parsers: Arc<ParserRegistry>,
        raptor_config: RaptorConfig,
        embed_batch_size: usize,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            parsers,
            raptor_config,
            embed_batch_size: embed_batch_size.max(1),
            events,
        }
    }

    /// Run the full pipeline for one document.
    ///
    /// On pipeline failure the matching status column is set to `failed` with
    /// the error string, and the error is returned. Cancellation returns
    /// [`Error::Cancelled`] without touching the row.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_document(
        &self,
        document_id: i64,
        local_path: &Path,
        library: &Library,
        embedder: Arc<dyn Embedder>,
        summarizer: Option<Arc<dyn Summarizer>>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = self
            .run_pipeline(
                document_id,
                local_path,
                library,
                embedder,
                summarizer,
                run_id,
                cancel,
            )
            .await;

        match &result {
            Err(Error::Pipeline { phase, cause }) => {
                let message = cause.to_string();
                tracing::warn!(document_id, %phase, error = %message, "ingestion failed");
                match phase {
                    Phase::Parsing => {
                        self.update_parsing(
                            document_id,
                            run_id,
                            ProcessStatus::Failed,
                            None,
                            &message,
                        )
                        .await?;
                    }
                    Phase::Embedding => {
                        self.update_embedding(
                            document_id,
                            run_id,
                            ProcessStatus::Failed,
                            None,
                            &message,
                        )
                        .await?;
                    }
                }
            }
            Err(Error::Cancelled) => {
                tracing::debug!(document_id, "ingestion cancelled");
            }
            _ => {}
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        document_id: i64,
        local_path: &Path,
        library: &Library,
        embedder: Arc<dyn Embedder>,
        summarizer: Option<Arc<dyn Summarizer>>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let extension: String =
            sqlx::query_scalar("SELECT extension FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(self.store.read())
                .await?
                .ok_or(Error::DocumentNotFound(document_id))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // ---- parsing phase -------------------------------------------------
        self.update_parsing(document_id, run_id, ProcessStatus::Processing, Some(10), "")
            .await?;

        let parser = self.parsers.parser_for(&extension);
        let path = local_path.to_path_buf();
        let fragments = tokio::task::spawn_blocking(move || parser.parse(&path))
            .await
            .map_err(|e| Error::parsing(anyhow!("parser panicked: {}", e)))?
            .map_err(Error::parsing)?;

        let word_total: i64 = fragments
            .iter()
            .map(|f| f.text.chars().count() as i64)
            .sum();
        if word_total == 0 {
            return Err(Error::parsing(anyhow!("no content extracted")));
        }

        let semantic = !library.semantic_segment_provider_id.is_empty();
        let split_config = SplitConfig {
            chunk_size: library.chunk_size.max(1) as usize,
            chunk_overlap: library.chunk_overlap.max(0) as usize,
            ..Default::default()
        };
        let chunks = split_document(
            &extension,
            &fragments,
            &split_config,
            semantic.then(|| embedder.as_ref() as &dyn Embedder),
        )
        .await
        .map_err(Error::parsing)?;

        if chunks.is_empty() {
            return Err(Error::parsing(anyhow!("splitter produced no chunks")));
        }
        let split_total = chunks.len() as i64;

        self.update_parsing(document_id, run_id, ProcessStatus::Completed, Some(100), "")
            .await?;

        // ---- embedding phase ----------------------------------------------
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.update_embedding(document_id, run_id, ProcessStatus::Processing, Some(10), "")
            .await?;

        let mut nodes: Vec<PlanNode> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| PlanNode {
                temp_id: i as i64 + 1,
                content: chunk.content.clone(),
                content_tokens: tokenizer::tokenize_content(&chunk.content),
                level: 0,
                parent_id: None,
                chunk_order: i as i64,
                vector: Vec::new(),
            })
            .collect();

        let total = nodes.len();
        let mut done = 0usize;
        for batch_start in (0..total).step_by(self.embed_batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let batch_end = (batch_start + self.embed_batch_size).min(total);
            let texts: Vec<String> = nodes[batch_start..batch_end]
                .iter()
                .map(|n| n.content.clone())
                .collect();
            let vectors = embedder.embed(&texts).await.map_err(Error::embedding)?;
            if vectors.len() != texts.len() {
                return Err(Error::embedding(anyhow!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            for (node, vector) in nodes[batch_start..batch_end].iter_mut().zip(vectors) {
                node.vector = vector;
            }

            done = batch_end;
            let progress = 10 + (done as i64 * 70) / total as i64;
            self.update_embedding(
                document_id,
                run_id,
                ProcessStatus::Processing,
                Some(progress),
                "",
            )
            .await?;
        }
        debug_assert_eq!(done, total);

        // ---- tree phase (optional, non-fatal) ------------------------------
        if semantic {
            self.update_embedding(document_id, run_id, ProcessStatus::Processing, Some(80), "")
                .await?;
            let builder =
                RaptorBuilder::new(self.raptor_config.clone(), embedder.clone(), summarizer);
            let leaves = nodes.clone();
            match builder.build(nodes, cancel).await {
                Ok(tree) => nodes = tree,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    tracing::warn!(document_id, error = %e, "tree build failed; keeping leaves");
                    nodes = leaves;
                }
            }
        }

        for node in &mut nodes {
            if node.content_tokens.is_empty() {
                node.content_tokens = tokenizer::tokenize_content(&node.content);
            }
        }

        // ---- persist -------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.commit_nodes(document_id, library.id, &mut nodes)
            .await
            .map_err(Error::embedding)?;

        sqlx::query(
            r#"
            UPDATE documents
            SET word_total = ?, split_total = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ')
            WHERE id = ? AND processing_run_id = ?
            "#,
        )
        .bind(word_total)
        .bind(split_total)
        .bind(document_id)
        .bind(run_id)
        .execute(self.store.write())
        .await?;

        self.update_embedding(document_id, run_id, ProcessStatus::Completed, Some(100), "")
            .await?;
        Ok(())
    }

    /// Atomically replace the document's nodes and vectors.
    ///
    /// Nodes are inserted sorted by `(level, chunk_order, temp_id)` so
    /// summaries always receive higher row ids than their children, then
    /// parent links are rewritten through the temp→db id map. An unresolved
    /// mapping is skipped: a dropped parent beats a corrupt reference.
    async fn commit_nodes(
        &self,
        document_id: i64,
        library_id: i64,
        nodes: &mut [PlanNode],
    ) -> anyhow::Result<()> {
        nodes.sort_by_key(|n| (n.level, n.chunk_order, n.temp_id));

        let mut tx = self.store.begin().await?;

        // The vector table has no cascade; clear it row by row before the
        // nodes go (virtual tables take point deletes, not subqueries).
        let old_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM document_nodes WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;
        for old_id in &old_ids {
            sqlx::query("DELETE FROM doc_vec WHERE id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM document_nodes WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let mut id_map: HashMap<i64, i64> = HashMap::with_capacity(nodes.len());
        for node in nodes.iter() {
            let row = sqlx::query(
                r#"
                INSERT INTO document_nodes
                    (library_id, document_id, content, content_tokens, level, parent_id, chunk_order)
                VALUES (?, ?, ?, ?, ?, NULL, ?)
                RETURNING id
                "#,
            )
            .bind(library_id)
            .bind(document_id)
            .bind(&node.content)
            .bind(&node.content_tokens)
            .bind(node.level)
            .bind(node.chunk_order)
            .fetch_one(&mut *tx)
            .await?;
            let db_id: i64 = row.get("id");
            id_map.insert(node.temp_id, db_id);

            sqlx::query("INSERT INTO doc_vec (id, content) VALUES (?, ?)")
                .bind(db_id)
                .bind(vec_to_blob(&node.vector))
                .execute(&mut *tx)
                .await?;
        }

        for node in nodes.iter() {
            let Some(parent_temp) = node.parent_id else {
                continue;
            };
            let (Some(&db_id), Some(&parent_db)) =
                (id_map.get(&node.temp_id), id_map.get(&parent_temp))
            else {
                continue;
            };
            sqlx::query("UPDATE document_nodes SET parent_id = ? WHERE id = ?")
                .bind(parent_db)
                .bind(db_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Re-embed every existing node without reparsing or resegmenting.
    ///
    /// Nodes are read in `id` ascending order; vectors are rewritten in one
    /// transaction. Fails if the document has no nodes.
    pub async fn reembed_document_nodes(
        &self,
        document_id: i64,
        embedder: Arc<dyn Embedder>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = self
            .run_reembed(document_id, embedder, run_id, cancel)
            .await;

        if let Err(Error::Pipeline { cause, .. }) = &result {
            let message = cause.to_string();
            tracing::warn!(document_id, error = %message, "re-embed failed");
            self.update_embedding(document_id, run_id, ProcessStatus::Failed, None, &message)
                .await?;
        }
        result
    }

    async fn run_reembed(
        &self,
        document_id: i64,
        embedder: Arc<dyn Embedder>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rows = sqlx::query("SELECT id, content FROM document_nodes WHERE document_id = ? ORDER BY id ASC")
            .bind(document_id)
            .fetch_all(self.store.read())
            .await?;
        if rows.is_empty() {
            return Err(Error::embedding(anyhow!("document has no nodes to re-embed")));
        }

        self.update_embedding(document_id, run_id, ProcessStatus::Processing, Some(10), "")
            .await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        let contents: Vec<String> = rows.iter().map(|r| r.get("content")).collect();

        let total = contents.len();
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(total);
        for batch_start in (0..total).step_by(self.embed_batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let batch_end = (batch_start + self.embed_batch_size).min(total);
            let batch = embedder
                .embed(&contents[batch_start..batch_end])
                .await
                .map_err(Error::embedding)?;
            vectors.extend(batch);

            if batch_end < total {
                let progress = 10 + (batch_end as i64 * 70) / total as i64;
                self.update_embedding(
                    document_id,
                    run_id,
                    ProcessStatus::Processing,
                    Some(progress),
                    "",
                )
                .await?;
            }
        }
        if vectors.len() != total {
            return Err(Error::embedding(anyhow!(
                "embedder returned {} vectors for {} nodes",
                vectors.len(),
                total
            )));
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut tx = self.store.begin().await?;
        for (id, vector) in ids.iter().zip(&vectors) {
            sqlx::query("DELETE FROM doc_vec WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO doc_vec (id, content) VALUES (?, ?)")
                .bind(id)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.update_embedding(document_id, run_id, ProcessStatus::Completed, Some(100), "")
            .await?;
        Ok(())
    }

    async fn update_parsing(
        &self,
        document_id: i64,
        run_id: &str,
        status: ProcessStatus,
        progress: Option<i64>,
        error: &str,
    ) -> Result<()> {
        self.update_phase(document_id, run_id, "parsing", status, progress, error)
            .await
    }

    async fn update_embedding(
        &self,
        document_id: i64,
        run_id: &str,
        status: ProcessStatus,
        progress: Option<i64>,
        error: &str,
    ) -> Result<()> {
        self.update_phase(document_id, run_id, "embedding", status, progress, error)
            .await
    }

    /// Run-id-guarded phase column update; emits a progress event only when
    /// the row actually changed.
    async fn update_phase(
        &self,
        document_id: i64,
        run_id: &str,
        phase: &str,
        status: ProcessStatus,
        progress: Option<i64>,
        error: &str,
    ) -> Result<()> {
        let sql = match (phase, progress.is_some()) {
            ("parsing", true) => {
                "UPDATE documents SET parsing_status = ?, parsing_progress = ?, parsing_error = ?, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ') WHERE id = ? AND processing_run_id = ?"
            }
            ("parsing", false) => {
                "UPDATE documents SET parsing_status = ?, parsing_error = ?, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ') WHERE id = ? AND processing_run_id = ?"
            }
            ("embedding", true) => {
                "UPDATE documents SET embedding_status = ?, embedding_progress = ?, embedding_error = ?, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ') WHERE id = ? AND processing_run_id = ?"
            }
            _ => {
                "UPDATE documents SET embedding_status = ?, embedding_error = ?, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ') WHERE id = ? AND processing_run_id = ?"
            }
        };

        let mut query = sqlx::query(sql).bind(status.as_i64());
        if let Some(progress) = progress {
            query = query.bind(progress);
        }
        let result = query
            .bind(error)
            .bind(document_id)
            .bind(run_id)
            .execute(self.store.write())
            .await?;

        if result.rows_affected() > 0 {
            self.emit_progress(document_id).await;
        }
        Ok(())
    }

    async fn emit_progress(&self, document_id: i64) {
        let row = sqlx::query(
            r#"
            SELECT id, library_id, parsing_status, parsing_progress, parsing_error,
                   embedding_status, embedding_progress, embedding_error
            FROM documents WHERE id = ?
            "#,
        )
        .bind(document_id)
        .fetch_optional(self.store.read())
        .await;

        if let Ok(Some(row)) = row {
            let progress = DocumentProgress {
                document_id: row.get("id"),
                library_id: row.get("library_id"),
                parsing_status: row.get("parsing_status"),
                parsing_progress: row.get("parsing_progress"),
                parsing_error: row.get("parsing_error"),
                embedding_status: row.get("embedding_status"),
                embedding_progress: row.get("embedding_progress"),
                embedding_error: row.get("embedding_error"),
            };
            if let Ok(payload) = serde_json::to_value(&progress) {
                self.events.emit(EVENT_PROGRESS, payload);
            }
        }
    }
}
