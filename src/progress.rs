//! Progress-callback trait for per-document pipeline events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as documents are extracted. The trait is `Send + Sync` because
//! documents are processed concurrently on blocking worker threads.
//!
//! # Example
//!
//! ```rust
//! use schoolmeal_metrics::{PipelineConfig, RunProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, document: &str, records: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {document} → {records} records");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Document events may arrive concurrently and out of
/// ingestion order.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after the input has been enumerated.
    fn on_run_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called when a worker picks up a document.
    fn on_document_start(&self, document: &str) {
        let _ = document;
    }

    /// Called when a document yielded at least one normalised record.
    fn on_document_complete(&self, document: &str, records: usize) {
        let _ = (document, records);
    }

    /// Called when a document was skipped (no data, unreadable, timeout).
    fn on_document_failed(&self, document: &str, reason: &str) {
        let _ = (document, reason);
    }

    /// Called once after the merge finished.
    fn on_run_complete(&self, total_documents: usize, failed_documents: usize) {
        let _ = (total_documents, failed_documents);
    }
}

/// Shared handle stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;

/// Callback that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RunProgressCallback for Recorder {
        fn on_document_failed(&self, document: &str, reason: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{document}:{reason}"));
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let cb: ProgressCallback = Arc::new(Recorder::default());
        cb.on_run_start(3);
        cb.on_document_start("a.html");
        cb.on_document_complete("a.html", 10);
        cb.on_document_failed("b.pdf", "timeout");
        cb.on_run_complete(3, 1);
        NoopProgressCallback.on_run_start(1);
    }

    #[test]
    fn overridden_method_receives_events() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();
        cb.on_document_failed("b.pdf", "timeout");
        assert_eq!(*rec.events.lock().unwrap(), vec!["b.pdf:timeout".to_string()]);
    }
}
