//! Task manager semantics: keyed replacement, restart adoption, cancellation,
//! and retry-on-error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use docbase::db::Store;
use docbase::events::NullSink;
use docbase::queue::{Handler, QueueConfig, TaskManager, QUEUE_DOCUMENT};

const JOB: &str = "test_job";

async fn open_store() -> (tempfile::TempDir, Store) {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Store::open(&tmp.path().join("q.sqlite"), 4).await.unwrap();
    (tmp, store)
}

fn manager(store: &Store, workers: usize) -> Arc<TaskManager> {
    TaskManager::new(
        store.clone(),
        Duration::from_secs(300),
        vec![QueueConfig {
            name: QUEUE_DOCUMENT.to_string(),
            workers,
            poll_interval: Duration::from_millis(10),
        }],
        Arc::new(NullSink),
    )
}

/// Handler that records `(task_key, run_id)` per invocation.
fn recording_handler(log: Arc<Mutex<Vec<(String, String)>>>) -> Handler {
    Arc::new(move |ctx| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push((ctx.task_key, ctx.run_id));
            Ok(())
        })
    })
}

async fn wait_empty(manager: &TaskManager) {
    for _ in 0..300 {
        if manager.queue_depth(QUEUE_DOCUMENT).await.unwrap() == 0 {
            // One extra tick lets the in-flight handler finish.
            tokio::time::sleep(Duration::from_millis(30)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue did not drain");
}

#[tokio::test]
async fn test_submit_and_run_once() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    manager.register_handler(QUEUE_DOCUMENT, JOB, recording_handler(log.clone()));

    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:1", "run-1", serde_json::json!({}))
        .await
        .unwrap();
    assert!(manager.is_task_running("doc:1"));

    manager.start();
    wait_empty(&manager).await;
    manager.stop().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![("doc:1".to_string(), "run-1".to_string())]
    );
    assert!(!manager.is_task_running("doc:1"));
    assert!(manager.get_task_info("doc:1").is_none());
}

#[tokio::test]
async fn test_resubmit_supersedes_older_run() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    manager.register_handler(QUEUE_DOCUMENT, JOB, recording_handler(log.clone()));

    // Both rows land before any worker starts; the first must be dropped by
    // the dispatch guard, the second must run.
    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:7", "A", serde_json::json!({}))
        .await
        .unwrap();
    let replaced = manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:7", "B", serde_json::json!({}))
        .await
        .unwrap();
    assert!(replaced);

    manager.start();
    wait_empty(&manager).await;
    manager.stop().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![("doc:7".to_string(), "B".to_string())]
    );
}

#[tokio::test]
async fn test_restart_adopts_orphaned_job() {
    let (_tmp, store) = open_store().await;

    // First manager enqueues but never starts; its in-memory task table dies
    // with it.
    let first = manager(&store, 1);
    first
        .submit(QUEUE_DOCUMENT, JOB, "doc:9", "run-9", serde_json::json!({}))
        .await
        .unwrap();
    drop(first);

    let second = manager(&store, 1);
    assert!(second.get_task_info("doc:9").is_none());
    let log = Arc::new(Mutex::new(Vec::new()));
    second.register_handler(QUEUE_DOCUMENT, JOB, recording_handler(log.clone()));
    second.start();
    wait_empty(&second).await;
    second.stop().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![("doc:9".to_string(), "run-9".to_string())]
    );
}

#[tokio::test]
async fn test_cancel_before_dispatch_drops_job() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    manager.register_handler(QUEUE_DOCUMENT, JOB, recording_handler(log.clone()));

    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:3", "run-3", serde_json::json!({}))
        .await
        .unwrap();
    manager.cancel("doc:3");
    assert!(!manager.is_task_running("doc:3"));

    manager.start();
    wait_empty(&manager).await;
    manager.stop().await;

    assert!(log.lock().unwrap().is_empty(), "cancelled job must not run");
    assert_eq!(manager.queue_depth(QUEUE_DOCUMENT).await.unwrap(), 0);
}

#[tokio::test]
async fn test_handler_error_releases_lease_for_retry() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);

    let attempts = Arc::new(Mutex::new(0u32));
    let handler_attempts = attempts.clone();
    let handler: Handler = Arc::new(move |_ctx| {
        let attempts = handler_attempts.clone();
        Box::pin(async move {
            let mut attempts = attempts.lock().unwrap();
            *attempts += 1;
            if *attempts == 1 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        })
    });
    manager.register_handler(QUEUE_DOCUMENT, JOB, handler);

    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:5", "run-5", serde_json::json!({}))
        .await
        .unwrap();
    manager.start();
    wait_empty(&manager).await;
    manager.stop().await;

    assert_eq!(*attempts.lock().unwrap(), 2, "failed once, retried once");
}

#[tokio::test]
async fn test_mid_run_cancellation_token_observed() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);

    let outcome = Arc::new(Mutex::new(None::<bool>));
    let handler_outcome = outcome.clone();
    let handler: Handler = Arc::new(move |ctx| {
        let outcome = handler_outcome.clone();
        Box::pin(async move {
            // Simulates a long phase: wait for the cancel signal.
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    *outcome.lock().unwrap() = Some(true);
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    *outcome.lock().unwrap() = Some(false);
                }
            }
            Ok(())
        })
    });
    manager.register_handler(QUEUE_DOCUMENT, JOB, handler);

    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:8", "run-8", serde_json::json!({}))
        .await
        .unwrap();
    manager.start();

    // Give the worker a moment to claim, then cancel mid-run.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel("doc:8");

    wait_empty(&manager).await;
    manager.stop().await;

    assert_eq!(*outcome.lock().unwrap(), Some(true), "handler saw the cancel");
}

#[tokio::test]
async fn test_stop_now_cancels_known_tasks() {
    let (_tmp, store) = open_store().await;
    let manager = manager(&store, 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    manager.register_handler(QUEUE_DOCUMENT, JOB, recording_handler(log.clone()));

    manager
        .submit(QUEUE_DOCUMENT, JOB, "doc:11", "run-11", serde_json::json!({}))
        .await
        .unwrap();
    // Never started; stop_now must still mark the task cancelled.
    manager.stop_now().await;
    assert!(!manager.is_task_running("doc:11"));
}
