//! Event delivery to the embedding shell.
//!
//! The engine reports observable state changes (upload progress, per-phase
//! ingestion progress, thumbnails) through an [`EventSink`]; the shell bridges
//! the sink onto its own bus. The library ships a tracing-backed sink and a
//! collecting sink for tests.

use serde_json::Value;
use std::sync::Mutex;

/// `{library_id, total, done}` per processed upload batch entry.
pub const EVENT_UPLOAD_PROGRESS: &str = "document:upload_progress";
/// The full document record, once per successful upload.
pub const EVENT_UPLOADED: &str = "document:uploaded";
/// Snapshot of both phase statuses; see `models::DocumentProgress`.
pub const EVENT_PROGRESS: &str = "document:progress";
/// `{document_id, library_id, thumb_icon}` when a thumbnail lands.
pub const EVENT_THUMBNAIL: &str = "document:thumbnail";

/// Receives engine events. Implementations must be cheap and non-blocking;
/// they are called from worker tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Logs every event at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &str, payload: Value) {
        tracing::debug!(event, %payload, "event");
    }
}

/// Drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Buffers events for inspection; used by tests.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events captured so far, in emission order.
    pub fn drain(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}
