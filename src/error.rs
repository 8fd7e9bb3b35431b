//! Error types for the school meal pipeline.
//!
//! Three distinct types reflect three distinct failure scopes:
//!
//! * [`PipelineError`] (**fatal**): the run cannot proceed at all (input
//!   directory missing or unreadable, invalid vocabulary file, bad config).
//!   Returned as `Err(PipelineError)` from the top-level `run*` functions.
//!
//! * [`DocumentError`] (**non-fatal, document scope**): one document could not
//!   be read (corrupt PDF, pdfium missing, timeout). The document is skipped
//!   and recorded as an [`Issue::NoDataExtracted`].
//!
//! * [`Issue`] (**non-fatal, accumulated**): every row-, document- and
//!   record-level problem of a run, stored in
//!   [`crate::run::RunSummary::issues`] so the caller sees everything that was
//!   skipped, repaired or held back.

use crate::model::Cents;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input path does not exist.
    #[error("Input not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the input.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// Listing the input directory or reading a file failed.
    #[error("Failed to read input '{path}': {source}")]
    InputReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Reference data errors ─────────────────────────────────────────────
    /// The vocabulary / schools file could not be read.
    #[error("Failed to read vocabulary file '{path}': {source}")]
    VocabularyReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The vocabulary / schools file is not valid TOML for the expected shape.
    #[error("Vocabulary file '{path}' is invalid: {detail}")]
    InvalidVocabulary { path: PathBuf, detail: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A document that produced nothing usable.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum DocumentError {
    /// The bytes could not be decoded as the declared format.
    #[error("{document}: unreadable {format}: {detail}")]
    Unreadable {
        document: String,
        format: String,
        detail: String,
    },

    /// No pdfium shared library could be bound.
    #[error(
        "{document}: pdfium library unavailable: {detail}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium on the loader path."
    )]
    PdfiumUnavailable { document: String, detail: String },

    /// The configured table selector is not valid CSS.
    #[error("{document}: invalid table selector '{selector}': {detail}")]
    InvalidSelector {
        document: String,
        selector: String,
        detail: String,
    },

    /// Extraction did not finish within the per-document timeout.
    #[error("{document}: extraction timed out after {secs}s")]
    Timeout { document: String, secs: u64 },

    /// The worker thread panicked.
    #[error("{document}: extraction worker failed: {detail}")]
    WorkerFailed { document: String, detail: String },
}

/// A non-fatal problem recorded during a run.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    /// The document yielded zero rows and was skipped.
    #[error("{document}: no data extracted ({reason})")]
    NoDataExtracted { document: String, reason: String },

    /// Row had fewer cells than its header; missing cells became null.
    #[error("{document} row {row}: {found} of {expected} cells present, padded with nulls")]
    IncompleteRow {
        document: String,
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A numeric cell stayed unparsable after cleanup.
    #[error("{document} row {row}: column '{column}' value {value:?} is not numeric")]
    UnparsableRow {
        document: String,
        row: usize,
        column: String,
        value: String,
    },

    /// A source column with no canonical mapping was dropped.
    #[error("{document}: unknown column '{label}' dropped")]
    UnknownField { document: String, label: String },

    /// The row could not be mapped onto a record and was rejected.
    #[error("{document} row {row}: {detail}")]
    SchemaMappingError {
        document: String,
        row: usize,
        detail: String,
    },

    /// Sources disagree on the unit cost of one record; the record is held
    /// back from the dataset until resolved.
    #[error("cost conflict for {key}: unit costs {unit_costs:?} from {sources:?}")]
    CostConflict {
        key: String,
        sources: Vec<String>,
        /// `None` for a source without a cost column.
        unit_costs: Vec<Option<Cents>>,
    },
}

impl Issue {
    /// Short machine-friendly name of the issue kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Issue::NoDataExtracted { .. } => "no_data_extracted",
            Issue::IncompleteRow { .. } => "incomplete_row",
            Issue::UnparsableRow { .. } => "unparsable_row",
            Issue::UnknownField { .. } => "unknown_field",
            Issue::SchemaMappingError { .. } => "schema_mapping_error",
            Issue::CostConflict { .. } => "cost_conflict",
        }
    }
}

impl From<DocumentError> for Issue {
    fn from(err: DocumentError) -> Self {
        let document = match &err {
            DocumentError::Unreadable { document, .. }
            | DocumentError::PdfiumUnavailable { document, .. }
            | DocumentError::InvalidSelector { document, .. }
            | DocumentError::Timeout { document, .. }
            | DocumentError::WorkerFailed { document, .. } => document.clone(),
        };
        let reason = err.to_string();
        let reason = reason
            .strip_prefix(&format!("{document}: "))
            .unwrap_or(&reason)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        Issue::NoDataExtracted { document, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_not_found_display() {
        let e = PipelineError::InputNotFound {
            path: PathBuf::from("/nope/reports"),
        };
        assert!(e.to_string().contains("/nope/reports"), "got: {e}");
    }

    #[test]
    fn timeout_becomes_no_data_extracted() {
        let issue: Issue = DocumentError::Timeout {
            document: "lane.pdf".into(),
            secs: 30,
        }
        .into();
        assert_eq!(
            issue,
            Issue::NoDataExtracted {
                document: "lane.pdf".into(),
                reason: "extraction timed out after 30s".into(),
            }
        );
    }

    #[test]
    fn pdfium_hint_is_dropped_from_issue_reason() {
        let issue: Issue = DocumentError::PdfiumUnavailable {
            document: "a.pdf".into(),
            detail: "LoadLibraryError".into(),
        }
        .into();
        match issue {
            Issue::NoDataExtracted { reason, .. } => {
                assert!(reason.contains("LoadLibraryError"));
                assert!(!reason.contains("PDFIUM_LIB_PATH"));
            }
            other => panic!("unexpected issue {other:?}"),
        }
    }

    #[test]
    fn issue_serialises_with_kind_tag() {
        let issue = Issue::UnknownField {
            document: "d".into(),
            label: "Notes".into(),
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "unknown_field");
        assert_eq!(issue.kind(), "unknown_field");
    }
}
