//! Run entry points: load documents, extract them concurrently, merge once.
//!
//! Each document goes through read → layout → normalise on a blocking
//! worker (pdfium is synchronous), bounded by `concurrency` and wrapped in a
//! per-document timeout. Worker results are re-sorted into ingestion order
//! and reduced into the merge engine in a single step, so nothing partial is
//! ever visible and identical input yields an identical dataset.

use crate::config::PipelineConfig;
use crate::error::{DocumentError, Issue, PipelineError};
use crate::model::{RawDocument, SourceType, SourcedRecord};
use crate::pipeline::layout::layout_for;
use crate::pipeline::merge::{self, Dataset, ReconciliationReport};
use crate::pipeline::normalize::{normalize_document, NormalizedBatch};
use crate::pipeline::{input, reader};
use crate::schools::{SchoolDirectory, SchoolMapping};
use crate::vocabulary::Vocabulary;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Output types ─────────────────────────────────────────────────────────────

/// Per-document extraction statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStats {
    pub document: String,
    pub source_type: SourceType,
    pub rows_parsed: usize,
    pub records: usize,
    pub rows_rejected: usize,
    pub rows_excluded: usize,
    pub cells_repaired: usize,
    pub duration_ms: u64,
    /// Why the document yielded nothing, if it didn't.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Totals for a run plus every non-fatal issue, in ingestion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub documents_total: usize,
    pub documents_failed: usize,
    pub rows_parsed: usize,
    pub rows_rejected: usize,
    pub rows_excluded: usize,
    pub cells_repaired: usize,
    pub records_normalized: usize,
    pub issues: Vec<Issue>,
    /// Every raw school spelling seen and what it resolved to, by spelling.
    pub school_mappings: Vec<SchoolMapping>,
    pub duration_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub dataset: Dataset,
    pub reconciliation: ReconciliationReport,
    pub summary: RunSummary,
    pub documents: Vec<DocumentStats>,
}

/// Serialisable view of a run for the JSON report.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub summary: &'a RunSummary,
    pub reconciliation: &'a ReconciliationReport,
    pub documents: &'a [DocumentStats],
}

impl RunOutput {
    pub fn report(&self) -> RunReport<'_> {
        RunReport {
            summary: &self.summary,
            reconciliation: &self.reconciliation,
            documents: &self.documents,
        }
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Process every document under `path` (a directory or a single file).
///
/// # Errors
/// Returns `Err(PipelineError)` only when the input path cannot be opened or
/// listed. Files that cannot be read, unreadable documents, bad rows and
/// cost conflicts are reported in [`RunSummary::issues`].
pub async fn run(path: impl AsRef<Path>, config: &PipelineConfig) -> Result<RunOutput, PipelineError> {
    let path = path.as_ref();
    info!("Starting run: {}", path.display());
    let loaded = input::load_documents(path)?;
    if loaded.documents.is_empty() && loaded.unreadable.is_empty() {
        warn!("No supported documents found in {}", path.display());
    }
    run_inner(loaded.documents, loaded.unreadable, config).await
}

/// Process documents already in memory. Ingestion order is the order given.
pub async fn run_documents(
    documents: Vec<RawDocument>,
    config: &PipelineConfig,
) -> Result<RunOutput, PipelineError> {
    run_inner(documents, Vec::new(), config).await
}

async fn run_inner(
    documents: Vec<RawDocument>,
    unreadable: Vec<Issue>,
    config: &PipelineConfig,
) -> Result<RunOutput, PipelineError> {
    let started = Instant::now();
    let total = documents.len() + unreadable.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(total);
    }

    let mut outcomes: Vec<DocumentOutcome> = stream::iter(
        documents
            .into_iter()
            .enumerate()
            .map(|(seq, doc)| extract(seq, doc, config)),
    )
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;
    outcomes.sort_by_key(|o| o.seq);

    // ── Reduce ──
    let mut summary = RunSummary {
        documents_total: total,
        documents_failed: unreadable.len(),
        issues: unreadable,
        ..RunSummary::default()
    };
    let mut records: Vec<SourcedRecord> = Vec::new();
    let mut mappings: BTreeMap<String, SchoolMapping> = BTreeMap::new();
    let mut documents = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let stats = outcome.stats;
        if stats.error.is_some() {
            summary.documents_failed += 1;
        }
        summary.rows_parsed += stats.rows_parsed;
        summary.rows_rejected += stats.rows_rejected;
        summary.rows_excluded += stats.rows_excluded;
        summary.cells_repaired += stats.cells_repaired;
        summary.records_normalized += outcome.batch.records.len();
        summary.issues.extend(outcome.issues);
        for (raw, mapping) in outcome.batch.school_mappings {
            mappings.entry(raw).or_insert(mapping);
        }
        records.extend(outcome.batch.records);
        documents.push(stats);
    }
    summary.school_mappings = mappings.into_values().collect();

    let (dataset, reconciliation) = merge::merge(
        records,
        config.cost_tolerance_cents,
        &config.resolutions,
        Arc::clone(&config.schools),
    );
    summary.issues.extend(reconciliation.issues());
    summary.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        "Run complete: {}/{} documents, {} records, {} issues, {}ms",
        total - summary.documents_failed,
        total,
        dataset.len(),
        summary.issues.len(),
        summary.duration_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(total, summary.documents_failed);
    }

    Ok(RunOutput {
        dataset,
        reconciliation,
        summary,
        documents,
    })
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(path: impl AsRef<Path>, config: &PipelineConfig) -> Result<RunOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(run(path, config))
}

// ── Per-document work ────────────────────────────────────────────────────────

struct DocumentOutcome {
    seq: usize,
    stats: DocumentStats,
    batch: NormalizedBatch,
    /// Layout, normalisation and failure issues for this document.
    issues: Vec<Issue>,
}

impl DocumentOutcome {
    fn failed(seq: usize, document: &str, source_type: SourceType, issue: Issue) -> Self {
        Self {
            seq,
            stats: DocumentStats {
                document: document.to_string(),
                source_type,
                rows_parsed: 0,
                records: 0,
                rows_rejected: 0,
                rows_excluded: 0,
                cells_repaired: 0,
                duration_ms: 0,
                error: Some(issue.to_string()),
            },
            batch: NormalizedBatch::default(),
            issues: vec![issue],
        }
    }
}

async fn extract(seq: usize, doc: RawDocument, config: &PipelineConfig) -> DocumentOutcome {
    let id = doc.id.clone();
    let source_type = doc.source_type;
    let vocabulary = Arc::clone(&config.vocabulary);
    let schools = Arc::clone(&config.schools);
    let pdfium_path = config.pdfium_library_path.clone();
    run_blocking(seq, id, source_type, config, move || {
        process_document(seq, &doc, &vocabulary, &schools, pdfium_path.as_deref())
    })
    .await
}

/// Run one document's blocking work under the per-document timeout and
/// report the result to the progress callback.
async fn run_blocking<F>(
    seq: usize,
    id: String,
    source_type: SourceType,
    config: &PipelineConfig,
    work: F,
) -> DocumentOutcome
where
    F: FnOnce() -> DocumentOutcome + Send + 'static,
{
    if let Some(ref cb) = config.progress_callback {
        cb.on_document_start(&id);
    }

    let started = Instant::now();
    let secs = config.document_timeout_secs;
    let task = tokio::task::spawn_blocking(work);
    let mut outcome = match tokio::time::timeout(Duration::from_secs(secs), task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => DocumentOutcome::failed(
            seq,
            &id,
            source_type,
            DocumentError::WorkerFailed {
                document: id.clone(),
                detail: e.to_string(),
            }
            .into(),
        ),
        Err(_) => DocumentOutcome::failed(
            seq,
            &id,
            source_type,
            DocumentError::Timeout {
                document: id.clone(),
                secs,
            }
            .into(),
        ),
    };
    outcome.stats.duration_ms = started.elapsed().as_millis() as u64;

    match &outcome.stats.error {
        None => {
            info!(
                document = %id,
                rows = outcome.stats.rows_parsed,
                records = outcome.stats.records,
                "document extracted"
            );
            if let Some(ref cb) = config.progress_callback {
                cb.on_document_complete(&id, outcome.stats.records);
            }
        }
        Some(reason) => {
            warn!("Skipping document: {reason}");
            if let Some(ref cb) = config.progress_callback {
                cb.on_document_failed(&id, reason);
            }
        }
    }
    outcome
}

/// Blocking read → layout → normalise for one document.
fn process_document(
    seq: usize,
    doc: &RawDocument,
    vocabulary: &Vocabulary,
    schools: &SchoolDirectory,
    pdfium_path: Option<&Path>,
) -> DocumentOutcome {
    let fragments = match reader::read_document(doc, vocabulary, pdfium_path) {
        Ok(f) => f,
        Err(e) => return DocumentOutcome::failed(seq, &doc.id, doc.source_type, e.into()),
    };

    let parsed = layout_for(doc.source_type).parse(&doc.id, &fragments, vocabulary);
    if parsed.rows.is_empty() {
        let reason = if fragments.iter().any(|f| matches!(f, reader::Fragment::Table(_))) {
            "no data rows under a recognised header"
        } else {
            "no tables found"
        };
        let mut outcome = DocumentOutcome::failed(
            seq,
            &doc.id,
            doc.source_type,
            Issue::NoDataExtracted {
                document: doc.id.clone(),
                reason: reason.into(),
            },
        );
        outcome.issues.extend(parsed.issues);
        return outcome;
    }

    let batch = normalize_document(&parsed, &doc.source_ref(seq), &doc.hints, vocabulary, schools);
    debug!(
        document = %doc.id,
        rows = parsed.rows.len(),
        records = batch.records.len(),
        "document normalised"
    );

    let mut issues = parsed.issues;
    issues.extend(batch.issues.iter().cloned());
    DocumentOutcome {
        seq,
        stats: DocumentStats {
            document: doc.id.clone(),
            source_type: doc.source_type,
            rows_parsed: parsed.rows.len(),
            records: batch.records.len(),
            rows_rejected: batch.errors,
            rows_excluded: batch.excluded,
            cells_repaired: parsed.repaired_cells,
            duration_ms: 0,
            error: None,
        },
        batch,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RunProgressCallback;
    use std::sync::Mutex;

    const LANE: &str = r#"<h1>Lunch Production Report</h1>
        <table>
          <tr><th>School</th><th>Date</th><th>Category</th><th>Item</th><th>Served</th><th>Planned</th><th>Cost</th></tr>
          <tr><td>Lane ES</td><td>09/05/2023</td><td>Free</td><td>Pizza</td><td>100</td><td>110</td><td>$1.25</td></tr>
          <tr><td>Total</td><td></td><td></td><td></td><td>100</td><td>110</td><td></td></tr>
        </table>"#;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl RunProgressCallback for Events {
        fn on_document_complete(&self, document: &str, records: usize) {
            self.0.lock().unwrap().push(format!("ok {document} {records}"));
        }

        fn on_document_failed(&self, document: &str, _reason: &str) {
            self.0.lock().unwrap().push(format!("failed {document}"));
        }
    }

    #[tokio::test]
    async fn empty_document_does_not_stop_the_run() {
        let events = Arc::new(Events::default());
        let config = PipelineConfig::builder()
            .progress_callback(events.clone())
            .build()
            .unwrap();
        let docs = vec![
            RawDocument::html("lane.html", LANE),
            RawDocument::html("empty.html", "<p>No service today</p>"),
        ];
        let out = run_documents(docs, &config).await.unwrap();

        assert_eq!(out.dataset.len(), 1);
        assert_eq!(out.summary.documents_failed, 1);
        assert!(out.summary.issues.contains(&Issue::NoDataExtracted {
            document: "empty.html".into(),
            reason: "no tables found".into(),
        }));
        let mut seen = events.0.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["failed empty.html", "ok lane.html 1"]);
    }

    #[tokio::test]
    async fn corrupt_pdf_becomes_no_data_extracted() {
        let config = PipelineConfig::default();
        let docs = vec![RawDocument::pdf("broken.pdf", b"%PDF-1.4 truncated".to_vec())];
        let out = run_documents(docs, &config).await.unwrap();
        assert!(out.dataset.is_empty());
        assert_eq!(out.summary.issues[0].kind(), "no_data_extracted");
        assert!(out.documents[0].error.is_some());
    }

    #[tokio::test]
    async fn summary_counts_rows() {
        let config = PipelineConfig::default();
        let out = run_documents(vec![RawDocument::html("lane.html", LANE)], &config)
            .await
            .unwrap();
        let s = &out.summary;
        assert_eq!((s.rows_parsed, s.records_normalized, s.rows_rejected), (1, 1, 0));
        let r = &out.dataset.records()[0];
        assert_eq!((r.served_qty, r.planned_qty, r.unit_cost), (100, 110, 125));
        let json = serde_json::to_value(out.report()).unwrap();
        assert_eq!(json["summary"]["documents_total"], 1);
    }

    #[tokio::test]
    async fn slow_document_times_out_and_the_run_continues() {
        let events = Arc::new(Events::default());
        let config = PipelineConfig::builder()
            .document_timeout_secs(1)
            .progress_callback(events.clone())
            .build()
            .unwrap();
        let outcome = run_blocking(0, "slow.pdf".into(), SourceType::Pdf, &config, || {
            std::thread::sleep(Duration::from_millis(1500));
            DocumentOutcome::failed(
                0,
                "slow.pdf",
                SourceType::Pdf,
                Issue::NoDataExtracted {
                    document: "slow.pdf".into(),
                    reason: "finished".into(),
                },
            )
        })
        .await;

        assert_eq!(
            outcome.issues,
            vec![Issue::NoDataExtracted {
                document: "slow.pdf".into(),
                reason: "extraction timed out after 1s".into(),
            }]
        );
        assert!(outcome.stats.error.is_some());
        assert_eq!(events.0.lock().unwrap().clone(), vec!["failed slow.pdf"]);

        let lane = run_blocking(1, "lane.html".into(), SourceType::Html, &config, || {
            let doc = RawDocument::html("lane.html", LANE);
            process_document(1, &doc, &Vocabulary::default(), &SchoolDirectory::default(), None)
        })
        .await;
        assert_eq!(lane.stats.records, 1);
    }

    #[tokio::test]
    async fn summary_lists_school_mappings() {
        let config = PipelineConfig::builder()
            .schools(SchoolDirectory::new(vec![crate::schools::School::new(
                "041",
                "Lane Elementary",
            )]))
            .build()
            .unwrap();
        let out = run_documents(vec![RawDocument::html("lane.html", LANE)], &config)
            .await
            .unwrap();
        let mappings = &out.summary.school_mappings;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].raw, "Lane ES");
        assert_eq!(mappings[0].school_id.as_deref(), Some("041"));
        assert_eq!(mappings[0].method, crate::schools::MatchMethod::Normalized);
        let json = serde_json::to_value(out.report()).unwrap();
        assert_eq!(json["summary"]["school_mappings"][0]["method"], "normalized");
    }

    #[test]
    fn run_sync_reports_missing_input() {
        let err = run_sync("/no/such/dir", &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InputNotFound { .. }));
    }
}
