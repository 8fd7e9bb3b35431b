//! CLI binary for schoolmeal-metrics.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs the pipeline and prints the dataset, a metric or a
//! trend series.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use schoolmeal_metrics::export::{self, dataset_to_string};
use schoolmeal_metrics::metrics::{Filter, GroupBy, Measure, MetricKind, TrendPeriod};
use schoolmeal_metrics::schools::MatchMethod;
use schoolmeal_metrics::{
    run, PipelineConfig, ProgressCallback, ReferenceData, RunOutput, RunProgressCallback,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the run plus a log line per
/// document. Documents complete out of order, so start times are keyed by id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    records: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            records: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, document: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(document))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_documents: usize) {
        self.bar.set_length(total_documents as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_documents} documents…"))
        ));
    }

    fn on_document_start(&self, document: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(document.to_string(), Instant::now());
        }
        self.bar.set_message(document.to_string());
    }

    fn on_document_complete(&self, document: &str, records: usize) {
        let secs = self.elapsed_secs(document);
        self.records.fetch_add(records, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            green("✓"),
            document,
            dim(&format!("{records:>5} records")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_failed(&self, document: &str, reason: &str) {
        let secs = self.elapsed_secs(document);
        let msg = if reason.chars().count() > 80 {
            format!("{}\u{2026}", reason.chars().take(79).collect::<String>())
        } else {
            reason.to_string()
        };
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            red("✗"),
            document,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_documents: usize, failed_documents: usize) {
        self.bar.finish_and_clear();
        let ok = total_documents.saturating_sub(failed_documents);
        let records = self.records.load(Ordering::SeqCst);
        if failed_documents == 0 {
            eprintln!(
                "{} {} documents extracted, {} records",
                green("✔"),
                bold(&ok.to_string()),
                records
            );
        } else {
            eprintln!(
                "{} {}/{} documents extracted, {} records  ({} without data)",
                if ok == 0 { red("✘") } else { cyan("⚠") },
                bold(&ok.to_string()),
                total_documents,
                records,
                red(&failed_documents.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Canonical dataset as CSV on stdout
  mealstats reports/

  # Write the dataset and the reconciliation report
  mealstats reports/ -o dataset.csv --report report.json

  # Waste rate per school for September
  mealstats reports/ --metric waste_rate --group-by school --from 2023-09-01 --to 2023-09-30

  # Cost deviation per region using a vocabulary with a schools table
  mealstats reports/ --vocabulary district.toml --metric deviation --group-by region

  # Served quantity by weekday, lunch only, as JSON
  mealstats reports/ --trend weekday --measure served --meal lunch --json

METRICS:
  total_cost, average_cost, waste_rate, deviation, sales_proportion,
  daily_variation (alias: consistency), served_total

GROUPINGS:
  all, school, region, meal, category, item, date, month, weekday

ENVIRONMENT VARIABLES:
  MEALSTATS_*       Every flag, e.g. MEALSTATS_VOCABULARY=district.toml
  PDFIUM_LIB_PATH   Path to libpdfium (file or directory) for PDF input
  RUST_LOG          Overrides the log filter
"#;

/// Extract school meal reports into a canonical dataset and compute metrics.
#[derive(Parser, Debug)]
#[command(
    name = "mealstats",
    version,
    about = "Extract school meal reports (PDF/HTML) into a canonical dataset and compute metrics",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Report file or directory of reports.
    input: PathBuf,

    /// Vocabulary TOML (field aliases, variants, excluded schools, [[schools]]).
    #[arg(long, env = "MEALSTATS_VOCABULARY")]
    vocabulary: Option<PathBuf>,

    /// Write the canonical dataset to this file.
    #[arg(short, long, env = "MEALSTATS_OUTPUT")]
    output: Option<PathBuf>,

    /// Write the run summary and reconciliation report as JSON to this file.
    #[arg(long, env = "MEALSTATS_REPORT")]
    report: Option<PathBuf>,

    /// Dataset field delimiter: a single character or `tab`.
    #[arg(long, env = "MEALSTATS_DELIMITER", default_value = ",")]
    delimiter: String,

    /// Documents extracted at once.
    #[arg(short, long, env = "MEALSTATS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Per-document extraction timeout in seconds.
    #[arg(long, env = "MEALSTATS_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Largest unit-cost difference in cents still treated as agreement.
    #[arg(long, env = "MEALSTATS_COST_TOLERANCE", default_value_t = 1)]
    cost_tolerance: i64,

    /// Path to the pdfium shared library (file or directory).
    #[arg(long, env = "MEALSTATS_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// Metric to compute instead of printing the dataset.
    #[arg(long, env = "MEALSTATS_METRIC")]
    metric: Option<MetricKind>,

    /// Grouping dimension for --metric.
    #[arg(long, env = "MEALSTATS_GROUP_BY", default_value = "all")]
    group_by: GroupBy,

    /// Trend series to compute: daily, monthly or weekday.
    #[arg(long, env = "MEALSTATS_TREND")]
    trend: Option<TrendPeriod>,

    /// Quantity summed by --trend: served, planned, waste or cost.
    #[arg(long, env = "MEALSTATS_MEASURE", default_value = "served")]
    measure: Measure,

    /// First date included (YYYY-MM-DD).
    #[arg(long, env = "MEALSTATS_FROM")]
    from: Option<NaiveDate>,

    /// Last date included (YYYY-MM-DD).
    #[arg(long, env = "MEALSTATS_TO")]
    to: Option<NaiveDate>,

    /// Restrict to schools (id or name; repeatable).
    #[arg(long, env = "MEALSTATS_SCHOOL", value_delimiter = ',')]
    school: Vec<String>,

    /// Restrict to one meal (breakfast, lunch or any vocabulary variant).
    #[arg(long, env = "MEALSTATS_MEAL")]
    meal: Option<String>,

    /// Restrict to categories (repeatable).
    #[arg(long, env = "MEALSTATS_CATEGORY", value_delimiter = ',')]
    category: Vec<String>,

    /// Print metric, trend or report output as JSON.
    #[arg(long, env = "MEALSTATS_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "MEALSTATS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MEALSTATS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MEALSTATS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-document feedback, so library INFO
    // logs are muted while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let reference = match cli.vocabulary {
        Some(ref path) => ReferenceData::load(path)
            .with_context(|| format!("Failed to load vocabulary from {}", path.display()))?,
        None => ReferenceData::default(),
    };
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
    } else {
        None
    };
    let filter = build_filter(&cli, &reference)?;
    let sep = parse_delimiter(&cli.delimiter)?;

    let mut builder = PipelineConfig::builder()
        .concurrency(cli.concurrency)
        .document_timeout_secs(cli.timeout)
        .cost_tolerance_cents(cli.cost_tolerance)
        .reference(reference);
    if let Some(ref path) = cli.pdfium_lib {
        builder = builder.pdfium_library_path(path.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("Invalid configuration")?;

    // ── Run pipeline ─────────────────────────────────────────────────────
    let output = run(&cli.input, &config)
        .await
        .with_context(|| format!("Failed to process {}", cli.input.display()))?;

    if let Some(ref path) = cli.output {
        export::write_dataset_file(&output.dataset, path, sep)
            .await
            .context("Failed to write dataset")?;
    }
    if let Some(ref path) = cli.report {
        export::write_json_file(&output.report(), path)
            .await
            .context("Failed to write report")?;
    }

    // ── Print results ────────────────────────────────────────────────────
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Some(metric) = cli.metric {
        let results = output.dataset.metrics().query(metric, &filter, cli.group_by);
        if cli.json {
            let json = serde_json::to_string_pretty(&results).context("Failed to serialise metric")?;
            writeln!(out, "{json}")?;
        } else {
            for r in &results {
                writeln!(out, "{}\t{}", r.group, format_value(metric, r.value))?;
            }
        }
    }
    if let Some(period) = cli.trend {
        let points = output.dataset.metrics().trend(&filter, period, cli.measure);
        if cli.json {
            let json = serde_json::to_string_pretty(&points).context("Failed to serialise trend")?;
            writeln!(out, "{json}")?;
        } else {
            for p in &points {
                writeln!(out, "{}\t{}", p.period, p.value)?;
            }
        }
    }
    if cli.metric.is_none() && cli.trend.is_none() && cli.output.is_none() {
        if cli.json {
            let json = export::to_json_string(&output.report()).context("Failed to serialise report")?;
            writeln!(out, "{json}")?;
        } else {
            out.write_all(dataset_to_string(&output.dataset, sep).as_bytes())
                .context("Failed to write to stdout")?;
        }
    }
    out.flush().ok();

    if !cli.quiet {
        print_summary(&output, show_progress);
    }
    Ok(())
}

/// Map --school/--meal/--category/--from/--to onto a metric `Filter`.
fn build_filter(cli: &Cli, reference: &ReferenceData) -> Result<Filter> {
    let mut filter = Filter::all();

    let schools: Vec<String> = cli
        .school
        .iter()
        .map(|s| {
            reference
                .schools
                .resolve(s)
                .map(|m| m.school.id.clone())
                .unwrap_or_else(|| s.trim().to_string())
        })
        .collect();
    if !schools.is_empty() {
        filter = filter.schools(schools);
    }
    if let Some(from) = cli.from {
        filter = filter.since(from);
    }
    if let Some(to) = cli.to {
        filter = filter.until(to);
    }
    if let (Some(from), Some(to)) = (cli.from, cli.to) {
        if from > to {
            anyhow::bail!("Invalid date range: --from {from} is after --to {to}");
        }
    }
    if let Some(ref meal) = cli.meal {
        let meal = reference
            .vocabulary
            .meal_type(meal)
            .with_context(|| format!("Unknown meal '{meal}'"))?;
        filter = filter.meal_type(meal);
    }
    for raw in &cli.category {
        let category = reference
            .vocabulary
            .category(raw)
            .with_context(|| format!("Unknown category '{raw}'"))?;
        filter = filter.category(category);
    }
    Ok(filter)
}

/// Parse `--delimiter`: one character, or `tab` / `\t`.
fn parse_delimiter(s: &str) -> Result<char> {
    match s {
        "tab" | "\\t" | "\t" => Ok('\t'),
        _ => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c != '"' && c != '\n' && c != '\r' => Ok(c),
                _ => anyhow::bail!("Delimiter must be a single character other than a quote, got {s:?}"),
            }
        }
    }
}

/// Cost metrics are cents; print them as currency.
fn format_value(metric: MetricKind, value: Option<f64>) -> String {
    match (metric, value) {
        (_, None) => "null".to_string(),
        (MetricKind::TotalCost | MetricKind::AverageCost, Some(v)) => format!("{:.2}", v / 100.0),
        (MetricKind::ServedTotal, Some(v)) => format!("{v:.0}"),
        (_, Some(v)) => format!("{v:.4}"),
    }
}

fn print_summary(output: &RunOutput, progress_shown: bool) {
    let s = &output.summary;
    if !progress_shown {
        eprintln!(
            "Processed {}/{} documents in {}ms",
            s.documents_total - s.documents_failed,
            s.documents_total,
            s.duration_ms
        );
    }
    eprintln!(
        "   {} rows  /  {} records  /  {} rejected  /  {} excluded  /  {} repaired cells",
        dim(&s.rows_parsed.to_string()),
        dim(&output.dataset.len().to_string()),
        dim(&s.rows_rejected.to_string()),
        dim(&s.rows_excluded.to_string()),
        dim(&s.cells_repaired.to_string()),
    );
    let r = &output.reconciliation;
    if r.summed + r.overridden + r.conflicting > 0 {
        eprintln!(
            "   merge: {} summed  /  {} overridden  /  {} cost conflicts ({} resolved)",
            r.summed, r.overridden, r.conflicting, r.resolved
        );
    }
    for m in s
        .school_mappings
        .iter()
        .filter(|m| m.method == MatchMethod::Fuzzy)
    {
        eprintln!(
            "   school {:?} → {} (fuzzy {:.2})",
            m.raw,
            m.school_id.as_deref().unwrap_or("?"),
            m.score.unwrap_or_default()
        );
    }
    if !s.issues.is_empty() {
        eprintln!("{} {} issues recorded", cyan("⚠"), s.issues.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_parsing() {
        assert_eq!(parse_delimiter(",").unwrap(), ',');
        assert_eq!(parse_delimiter("tab").unwrap(), '\t');
        assert_eq!(parse_delimiter(";").unwrap(), ';');
        assert!(parse_delimiter("\"").is_err());
        assert!(parse_delimiter(",,").is_err());
    }

    #[test]
    fn cost_values_print_as_currency() {
        assert_eq!(format_value(MetricKind::TotalCost, Some(12500.0)), "125.00");
        assert_eq!(format_value(MetricKind::WasteRate, Some(0.08)), "0.0800");
        assert_eq!(format_value(MetricKind::Deviation, None), "null");
    }

    #[test]
    fn cli_parses_metric_flags() {
        let cli = Cli::try_parse_from([
            "mealstats",
            "reports",
            "--metric",
            "consistency",
            "--group-by",
            "school",
            "--from",
            "2023-09-01",
            "--school",
            "041,207",
        ])
        .unwrap();
        assert_eq!(cli.metric, Some(MetricKind::DailyVariation));
        assert_eq!(cli.group_by, GroupBy::School);
        assert_eq!(cli.school, vec!["041", "207"]);
        let filter = build_filter(&cli, &ReferenceData::default()).unwrap();
        assert_eq!(filter.from, NaiveDate::from_ymd_opt(2023, 9, 1));
    }
}
