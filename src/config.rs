//! Configuration for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The reference data (vocabulary and schools) is
//! held behind `Arc`s so every worker shares one immutable copy.

use crate::error::PipelineError;
use crate::model::{Cents, RecordKey};
use crate::progress::ProgressCallback;
use crate::schools::SchoolDirectory;
use crate::vocabulary::{ReferenceData, Vocabulary};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Agreed unit costs for keys whose sources disagreed in an earlier run.
pub type CostResolutions = BTreeMap<RecordKey, Cents>;

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use schoolmeal_metrics::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(8)
///     .document_timeout_secs(20)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Documents extracted at once. Default: 4.
    pub concurrency: usize,

    /// Per-document extraction budget in seconds. A document that exceeds it
    /// is reported as `NoDataExtracted` and skipped. Default: 30.
    pub document_timeout_secs: u64,

    /// Largest unit-cost difference (in cents) still treated as agreement
    /// when merging overlapping sources. Default: 1.
    pub cost_tolerance_cents: Cents,

    /// Alias and vocabulary table.
    pub vocabulary: Arc<Vocabulary>,

    /// School reference table used for name resolution and region grouping.
    pub schools: Arc<SchoolDirectory>,

    /// Manually agreed unit costs for previously conflicting keys.
    pub resolutions: Arc<CostResolutions>,

    /// Location of the pdfium shared library (file or directory). Falls back
    /// to `PDFIUM_LIB_PATH`, then the system loader path.
    pub pdfium_library_path: Option<PathBuf>,

    /// Optional per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            document_timeout_secs: 30,
            cost_tolerance_cents: 1,
            vocabulary: Arc::new(Vocabulary::default()),
            schools: Arc::new(SchoolDirectory::default()),
            resolutions: Arc::new(CostResolutions::new()),
            pdfium_library_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("concurrency", &self.concurrency)
            .field("document_timeout_secs", &self.document_timeout_secs)
            .field("cost_tolerance_cents", &self.cost_tolerance_cents)
            .field("schools", &self.schools.len())
            .field("resolutions", &self.resolutions.len())
            .field("pdfium_library_path", &self.pdfium_library_path)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn RunProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn document_timeout_secs(mut self, secs: u64) -> Self {
        self.config.document_timeout_secs = secs.max(1);
        self
    }

    pub fn cost_tolerance_cents(mut self, cents: Cents) -> Self {
        self.config.cost_tolerance_cents = cents.max(0);
        self
    }

    pub fn vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.config.vocabulary = Arc::new(vocabulary);
        self
    }

    pub fn schools(mut self, schools: SchoolDirectory) -> Self {
        self.config.schools = Arc::new(schools);
        self
    }

    /// Install both halves of a loaded vocabulary file.
    pub fn reference(self, data: ReferenceData) -> Self {
        self.vocabulary(data.vocabulary).schools(data.schools)
    }

    /// Record an agreed unit cost for a conflicting key.
    pub fn resolve_cost(mut self, key: RecordKey, unit_cost: Cents) -> Self {
        Arc::make_mut(&mut self.config.resolutions).insert(key, unit_cost);
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.document_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Document timeout must be ≥ 1 second".into(),
            ));
        }
        if c.cost_tolerance_cents < 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Cost tolerance must be ≥ 0 cents, got {}",
                c.cost_tolerance_cents
            )));
        }
        Ok(self.config)
    }
}
