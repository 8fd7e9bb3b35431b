//! # schoolmeal-metrics
//!
//! Extract school meal sales and production reports (PDF and HTML) into one
//! canonical dataset and compute cost, waste and consistency metrics over it.
//!
//! ## Why this crate?
//!
//! District meal reports come from several systems: PDF production records,
//! HTML sales exports, monthly and daily roll-ups of the same numbers. Column
//! names drift, totals and page footers are interleaved with data, and two
//! reports often cover the same school-day. This crate reads them all,
//! agrees on one record per (school, date, meal, category, item) and answers
//! metric queries over the result.
//!
//! ## Pipeline Overview
//!
//! ```text
//! reports/
//!  │
//!  ├─ 1. Input      list files, detect PDF/HTML, period + meal from file name
//!  ├─ 2. Read       pdfium text runs → cell grids (spawn_blocking) / HTML tables
//!  ├─ 3. Layout     header detection, total/footer removal, cell repair
//!  ├─ 4. Normalize  alias table → canonical fields, school resolution
//!  ├─ 5. Merge      override / sum / cost agreement per record key
//!  └─ 6. Output     Dataset + reconciliation report + run summary
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use schoolmeal_metrics::metrics::{Filter, GroupBy};
//! use schoolmeal_metrics::{run, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let output = run("reports/", &config).await?;
//!     for r in output.dataset.metrics().waste_rate(&Filter::all(), GroupBy::School) {
//!         println!("{}: {:?}", r.group, r.value);
//!     }
//!     eprintln!("{} issues", output.summary.issues.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mealstats` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! PDF input needs the pdfium shared library at run time. Point
//! `PDFIUM_LIB_PATH` (or [`PipelineConfig::pdfium_library_path`]) at it, or
//! install it on the system loader path. HTML input works without it.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod run;
pub mod schools;
pub mod units;
pub mod vocabulary;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{CostResolutions, PipelineConfig, PipelineConfigBuilder};
pub use error::{DocumentError, Issue, PipelineError};
pub use model::{
    Category, Cents, Field, MealRecord, MealType, RawDocument, RecordKey, ReportPeriod,
    SourceType,
};
pub use pipeline::merge::{Dataset, ReconciliationReport};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use run::{run, run_documents, run_sync, DocumentStats, RunOutput, RunReport, RunSummary};
pub use schools::{MatchMethod, School, SchoolDirectory, SchoolMapping};
pub use vocabulary::{ReferenceData, Vocabulary};
