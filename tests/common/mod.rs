//! Shared fixtures for the integration tests: a tempdir-backed store, a
//! deterministic fake embedder, and a fully wired document service.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use docbase::config::Config;
use docbase::db::Store;
use docbase::embedding::Embedder;
use docbase::events::CollectingSink;
use docbase::ingest::Ingestor;
use docbase::llm::ConfigResolver;
use docbase::parser::ParserRegistry;
use docbase::queue::{queues_from_config, TaskManager};
use docbase::service::{DocumentService, NoThumbnailer};

pub const TEST_DIMS: usize = 4;

/// Deterministic embedder: a 4-d vector derived from the text bytes, plus a
/// log of every batch size it was asked for.
pub struct FakeEmbedder {
    pub batches: Mutex<Vec<usize>>,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batches.lock().unwrap().push(texts.len());
        Ok(texts
            .iter()
            .map(|t| {
                let mut acc = [0.0f32; TEST_DIMS];
                for (i, b) in t.bytes().enumerate() {
                    acc[i % TEST_DIMS] += b as f32 / 255.0;
                }
                acc[TEST_DIMS - 1] += 1.0;
                acc.to_vec()
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

pub struct TestEngine {
    pub tmp: TempDir,
    pub store: Store,
    pub service: Arc<DocumentService>,
    pub embedder: Arc<FakeEmbedder>,
    pub sink: Arc<CollectingSink>,
}

/// Wire the whole engine against a temp directory, with fast queue polls.
pub async fn engine() -> TestEngine {
    let tmp = TempDir::new().unwrap();

    let mut config = Config::default();
    config.app.data_dir = Some(tmp.path().to_path_buf());
    config.app.vector_dims = TEST_DIMS;
    config.queues.document_workers = 1;
    config.queues.document_poll_ms = 10;
    config.queues.thumbnail_poll_ms = 10;

    let store = Store::open(&config.app.db_path(), TEST_DIMS).await.unwrap();
    let sink = Arc::new(CollectingSink::new());
    let embedder = FakeEmbedder::new();

    let tasks = TaskManager::new(
        store.clone(),
        Duration::from_secs(config.queues.lease_secs),
        queues_from_config(&config.queues),
        sink.clone(),
    );
    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        Arc::new(ParserRegistry::with_builtins()),
        config.raptor.clone(),
        config.embedding.batch_size,
        sink.clone(),
    ));
    let service = DocumentService::new(
        store.clone(),
        config.clone(),
        tasks,
        ingestor,
        embedder.clone(),
        Arc::new(ConfigResolver::new(config.summarizer.clone())),
        sink.clone(),
    );
    service.register_handlers(Arc::new(NoThumbnailer));

    TestEngine {
        tmp,
        store,
        service,
        embedder,
        sink,
    }
}

/// Write a file into the tempdir and return its path.
pub fn write_file(tmp: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = tmp.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Wait until both queues are empty, with a hard timeout.
pub async fn wait_for_drain(service: &DocumentService) {
    for _ in 0..600 {
        let documents = service
            .tasks()
            .queue_depth(docbase::queue::QUEUE_DOCUMENT)
            .await
            .unwrap();
        let thumbnails = service
            .tasks()
            .queue_depth(docbase::queue::QUEUE_THUMBNAIL)
            .await
            .unwrap();
        if documents == 0 && thumbnails == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queues did not drain");
}
