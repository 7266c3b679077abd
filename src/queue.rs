//! Durable multi-queue job runner.
//!
//! All queues share one relational table (`goqite`). A job row is claimed by
//! atomically pushing its `timeout` one lease into the future; on success the
//! row is deleted, on handler error the lease is released so the row is
//! redelivered, and an expired lease makes the row claimable again on its own.
//!
//! Submission is keyed: re-submitting a task key cancels the previous
//! in-memory [`TaskInfo`] and installs a fresh one carrying the new run id.
//! The run id travels inside the durable envelope, and three ordered guards
//! run at dispatch time, before any handler code:
//!
//! 1. no `TaskInfo` (we restarted) → synthesize one from the envelope so
//!    durable jobs are adopted instead of orphaned;
//! 2. `TaskInfo` cancelled → delete the row and return;
//! 3. envelope run id ≠ current run id → a newer submission superseded this
//!    row; drop it silently.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::Store;
use crate::events::EventSink;

/// Queue name for document ingestion jobs.
pub const QUEUE_DOCUMENT: &str = "document";
/// Queue name for thumbnail jobs.
pub const QUEUE_THUMBNAIL: &str = "thumbnail";

/// Job type: full ingestion of one document.
pub const JOB_PROCESS_DOCUMENT: &str = "process_document";
/// Job type: re-embed existing nodes without reparsing.
pub const JOB_REEMBED_DOCUMENT: &str = "reembed_document";
/// Job type: render a document thumbnail.
pub const JOB_THUMBNAIL: &str = "thumbnail";

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Durable payload of a job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_key: String,
    pub run_id: String,
    pub job_type: String,
    pub data: serde_json::Value,
}

/// What a handler receives.
pub struct JobContext {
    pub task_key: String,
    pub run_id: String,
    pub data: serde_json::Value,
    /// Cancelled when the task is replaced/cancelled or the manager stops.
    pub cancel: CancellationToken,
}

/// In-memory state of one keyed task. At most one non-cancelled instance per
/// key exists at any time.
#[derive(Clone)]
pub struct TaskInfo {
    pub run_id: String,
    token: CancellationToken,
}

impl TaskInfo {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub workers: usize,
    pub poll_interval: Duration,
}

/// The standard two queues, sized from configuration.
pub fn queues_from_config(config: &crate::config::QueuesConfig) -> Vec<QueueConfig> {
    vec![
        QueueConfig {
            name: QUEUE_DOCUMENT.to_string(),
            workers: config.document_workers,
            poll_interval: Duration::from_millis(config.document_poll_ms),
        },
        QueueConfig {
            name: QUEUE_THUMBNAIL.to_string(),
            workers: config.thumbnail_workers,
            poll_interval: Duration::from_millis(config.thumbnail_poll_ms),
        },
    ]
}

struct ClaimedJob {
    id: String,
    envelope: JobEnvelope,
}

pub struct TaskManager {
    store: Store,
    lease: Duration,
    queues: Vec<QueueConfig>,
    handlers: RwLock<HashMap<(String, String), Handler>>,
    tasks: Arc<RwLock<HashMap<String, TaskInfo>>>,
    root: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    events: Arc<dyn EventSink>,
    /// Back-reference handed to spawned workers.
    self_ref: std::sync::Weak<TaskManager>,
}

impl TaskManager {
    pub fn new(
        store: Store,
        lease: Duration,
        queues: Vec<QueueConfig>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            lease,
            queues,
            handlers: RwLock::new(HashMap::new()),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            events,
            self_ref: self_ref.clone(),
        })
    }

    /// Associate a handler with a `(queue, job_type)` pair. Must be called
    /// before [`start`](Self::start).
    pub fn register_handler(&self, queue: &str, job_type: &str, handler: Handler) {
        self.handlers
            .write()
            .unwrap()
            .insert((queue.to_string(), job_type.to_string()), handler);
    }

    /// Spawn the configured consumers for every queue.
    pub fn start(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let mut workers = self.workers.lock().unwrap();
        for queue in &self.queues {
            for worker in 0..queue.workers {
                let manager = this.clone();
                let queue = queue.clone();
                workers.push(tokio::spawn(async move {
                    manager.worker_loop(queue, worker).await;
                }));
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, queue: QueueConfig, worker: usize) {
        tracing::debug!(queue = %queue.name, worker, "worker started");
        loop {
            if self.root.is_cancelled() {
                break;
            }

            match self.claim(&queue.name).await {
                Ok(Some(job)) => {
                    self.dispatch(&queue.name, job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(queue = %queue.name, error = %e, "claim failed");
                }
            }

            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = tokio::time::sleep(queue.poll_interval) => {}
            }
        }
        tracing::debug!(queue = %queue.name, worker, "worker stopped");
    }

    /// Atomically claim the oldest eligible row and lease it.
    async fn claim(&self, queue: &str) -> Result<Option<ClaimedJob>> {
        let now = now_string();
        let lease = chrono::Duration::from_std(self.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let leased_until = time_string(chrono::Utc::now() + lease);

        let row = sqlx::query(
            r#"
            UPDATE goqite
            SET timeout = ?1, updated = ?2, received = received + 1
            WHERE id = (
                SELECT id FROM goqite
                WHERE queue = ?3 AND timeout <= ?2
                ORDER BY created, rowid
                LIMIT 1
            )
            RETURNING id, body
            "#,
        )
        .bind(&leased_until)
        .bind(&now)
        .bind(queue)
        .fetch_optional(self.store.write())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.get("id");
        let body: Vec<u8> = row.get("body");

        match serde_json::from_slice::<JobEnvelope>(&body) {
            Ok(envelope) => Ok(Some(ClaimedJob { id, envelope })),
            Err(e) => {
                // Undecodable rows would redeliver forever.
                tracing::warn!(job_id = %id, error = %e, "dropping undecodable job");
                self.delete_row(&id).await?;
                Ok(None)
            }
        }
    }

    async fn dispatch(&self, queue: &str, job: ClaimedJob) {
        let envelope = job.envelope;
        let key = envelope.task_key.clone();

        // Guard 1: adopt durable jobs that survived a restart.
        let info = {
            let mut tasks = self.tasks.write().unwrap();
            tasks
                .entry(key.clone())
                .or_insert_with(|| TaskInfo {
                    run_id: envelope.run_id.clone(),
                    token: self.root.child_token(),
                })
                .clone()
        };

        // Guard 2: cancelled before it ever ran.
        if info.is_cancelled() {
            if let Err(e) = self.delete_row(&job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "delete after cancel failed");
            }
            self.remove_task(&key, &envelope.run_id);
            return;
        }

        // Guard 3: superseded by a newer submission with the same key.
        if info.run_id != envelope.run_id {
            if let Err(e) = self.delete_row(&job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "delete of stale job failed");
            }
            return;
        }

        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&(queue.to_string(), envelope.job_type.clone()))
            .cloned();

        let Some(handler) = handler else {
            tracing::error!(queue, job_type = %envelope.job_type, "no handler registered");
            let _ = self.delete_row(&job.id).await;
            self.remove_task(&key, &envelope.run_id);
            return;
        };

        let context = JobContext {
            task_key: key.clone(),
            run_id: envelope.run_id.clone(),
            data: envelope.data.clone(),
            cancel: info.token.clone(),
        };

        match handler(context).await {
            Ok(()) => {
                if let Err(e) = self.delete_row(&job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "delete after success failed");
                }
                self.remove_task(&key, &envelope.run_id);
            }
            Err(e) => {
                tracing::warn!(task_key = %key, error = %e, "handler failed; releasing lease");
                if let Err(e) = self.release_lease(&job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "lease release failed");
                }
            }
        }
    }

    async fn delete_row(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM goqite WHERE id = ?")
            .bind(id)
            .execute(self.store.write())
            .await?;
        Ok(())
    }

    /// Make the row claimable again immediately (retry with a fresh lease).
    async fn release_lease(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE goqite SET timeout = ?, updated = ? WHERE id = ?")
            .bind(now_string())
            .bind(now_string())
            .bind(id)
            .execute(self.store.write())
            .await?;
        Ok(())
    }

    /// Drop the TaskInfo for `key` unless a newer run replaced it mid-flight.
    fn remove_task(&self, key: &str, run_id: &str) {
        let mut tasks = self.tasks.write().unwrap();
        if tasks.get(key).is_some_and(|info| info.run_id == run_id) {
            tasks.remove(key);
        }
    }

    /// Insert a durable job, replacing any in-flight task with the same key.
    ///
    /// Returns `true` when an earlier task instance was cancelled.
    pub async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        task_key: &str,
        run_id: &str,
        data: serde_json::Value,
    ) -> Result<bool> {
        let replaced = {
            let mut tasks = self.tasks.write().unwrap();
            let replaced = match tasks.get(task_key) {
                Some(existing) => {
                    existing.token.cancel();
                    true
                }
                None => false,
            };
            tasks.insert(
                task_key.to_string(),
                TaskInfo {
                    run_id: run_id.to_string(),
                    token: self.root.child_token(),
                },
            );
            replaced
        };

        let envelope = JobEnvelope {
            task_key: task_key.to_string(),
            run_id: run_id.to_string(),
            job_type: job_type.to_string(),
            data,
        };
        let body = serde_json::to_vec(&envelope)?;

        sqlx::query("INSERT INTO goqite (queue, body) VALUES (?, ?)")
            .bind(queue)
            .bind(body)
            .execute(self.store.write())
            .await?;

        Ok(replaced)
    }

    /// Mark the task cancelled. The durable row stays; the dispatch guard (or
    /// the handler's next checkpoint) drops the work.
    pub fn cancel(&self, task_key: &str) {
        let tasks = self.tasks.read().unwrap();
        if let Some(info) = tasks.get(task_key) {
            info.token.cancel();
        }
    }

    pub fn is_task_running(&self, task_key: &str) -> bool {
        self.tasks
            .read()
            .unwrap()
            .get(task_key)
            .is_some_and(|info| !info.is_cancelled())
    }

    pub fn get_task_info(&self, task_key: &str) -> Option<TaskInfo> {
        self.tasks.read().unwrap().get(task_key).cloned()
    }

    /// Hand an event to the shell's bus.
    pub fn emit(&self, event: &str, payload: serde_json::Value) {
        self.events.emit(event, payload);
    }

    /// Rows currently enqueued or leased on a queue.
    pub async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM goqite WHERE queue = ?")
            .bind(queue)
            .fetch_one(self.store.read())
            .await?;
        Ok(count)
    }

    /// Cancel the root context and wait for every worker to finish its
    /// current job.
    pub async fn stop(&self) {
        self.root.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "worker join failed");
            }
        }
    }

    /// Like [`stop`](Self::stop), but first cancels every known task so
    /// in-flight handlers bail at their next checkpoint.
    pub async fn stop_now(&self) {
        {
            let tasks = self.tasks.read().unwrap();
            for info in tasks.values() {
                info.token.cancel();
            }
        }
        self.stop().await;
    }
}

fn now_string() -> String {
    time_string(chrono::Utc::now())
}

/// Timestamp format matching the table's `strftime('%Y-%m-%dT%H:%M:%fZ')`
/// defaults; lexical order equals time order.
fn time_string(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
