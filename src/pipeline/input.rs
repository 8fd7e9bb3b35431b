//! Input enumeration: a directory or file path → [`RawDocument`]s.
//!
//! A directory is read non-recursively and sorted by file name so ingestion
//! order (and with it every later-wins decision in the merge) is the same on
//! every run. The source type comes from the extension, falling back to the
//! content (`%PDF` magic or a leading `<`). The file stem may carry the
//! report period (`lunch_2023-09-05.pdf`, `2023-09-01_2023-09-30.html`,
//! `sales-2023-09.pdf`) and the path may name the meal.

use crate::error::{Issue, PipelineError};
use crate::model::{MealType, RawDocument, ReportPeriod, SourceType};
use chrono::{Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static RE_FULL_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());

static RE_YEAR_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})").unwrap());

/// Documents found under an input path.
#[derive(Debug, Default)]
pub struct LoadedInput {
    pub documents: Vec<RawDocument>,
    /// Listed files that could not be read, as `NoDataExtracted`.
    pub unreadable: Vec<Issue>,
}

/// Load every supported document under `path`.
///
/// Fails when the path cannot be opened, the directory cannot be listed, or
/// a single-file input cannot be read. A listed file that fails to read is
/// recorded in [`LoadedInput::unreadable`]; unsupported files are skipped
/// with a debug log.
pub fn load_documents(path: impl AsRef<Path>) -> Result<LoadedInput, PipelineError> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path).map_err(|e| io_error(path, e))?;

    if !meta.is_dir() {
        let content = std::fs::read(path).map_err(|e| io_error(path, e))?;
        let documents = document_from_file(path, content).into_iter().collect();
        return Ok(LoadedInput {
            documents,
            unreadable: Vec::new(),
        });
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| io_error(path, e))? {
        let entry = entry.map_err(|e| io_error(path, e))?;
        let entry_path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry_path.is_file() && !hidden {
            files.push(entry_path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let loaded = read_files(&files);
    info!(
        "Loaded {} document(s) from {} ({} unreadable, {} skipped)",
        loaded.documents.len(),
        path.display(),
        loaded.unreadable.len(),
        files.len() - loaded.documents.len() - loaded.unreadable.len()
    );
    Ok(loaded)
}

/// Read listed files in order. A failed read becomes an issue for that file.
pub fn read_files(files: &[PathBuf]) -> LoadedInput {
    let mut loaded = LoadedInput::default();
    for file in files {
        match std::fs::read(file) {
            Ok(content) => loaded.documents.extend(document_from_file(file, content)),
            Err(e) => {
                let issue = Issue::NoDataExtracted {
                    document: file_id(file),
                    reason: format!("file could not be read: {e}"),
                };
                warn!("{issue}");
                loaded.unreadable.push(issue);
            }
        }
    }
    loaded
}

fn file_id(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

/// A document with hints from its file name, or `None` for unsupported files.
fn document_from_file(file: &Path, content: Vec<u8>) -> Option<RawDocument> {
    let Some(source_type) = detect_source_type(file, &content) else {
        debug!("Skipping unsupported file: {}", file.display());
        return None;
    };
    let mut doc = RawDocument::new(file_id(file), source_type, content);
    let stem = file.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    if let Some(period) = period_from_name(&stem) {
        doc = doc.with_period(period);
    }
    if let Some(meal) = meal_from_path(file) {
        doc = doc.with_meal_type(meal);
    }
    debug!(
        document = %doc.id,
        source_type = %doc.source_type,
        stream = %doc.stream,
        period = ?doc.period,
        meal = ?doc.hints.meal_type,
        "document loaded"
    );
    Some(doc)
}

fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    match e.kind() {
        ErrorKind::NotFound => PipelineError::InputNotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::InputReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

/// Source type by extension, else by content.
pub fn detect_source_type(path: &Path, content: &[u8]) -> Option<SourceType> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => return Some(SourceType::Pdf),
        "htm" | "html" => return Some(SourceType::Html),
        _ => {}
    }
    if content.starts_with(b"%PDF") {
        Some(SourceType::Pdf)
    } else if content.trim_ascii_start().starts_with(b"<") {
        Some(SourceType::Html)
    } else {
        None
    }
}

/// Report period encoded in a file name: one `YYYY-MM-DD` is a day, two are
/// a range, a lone `YYYY-MM` is the whole month.
pub fn period_from_name(stem: &str) -> Option<ReportPeriod> {
    let dates: Vec<NaiveDate> = RE_FULL_DATE
        .find_iter(stem)
        .filter_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok())
        .collect();
    match dates.as_slice() {
        [day] => return Some(ReportPeriod::day(*day)),
        [a, b, ..] => return Some(ReportPeriod::range(*a, *b)),
        [] => {}
    }

    let caps = RE_YEAR_MONTH.captures(stem)?;
    let year: i32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
    Some(ReportPeriod::range(start, end))
}

/// Meal named anywhere in the path, when exactly one is.
pub fn meal_from_path(path: &Path) -> Option<MealType> {
    let text = path.to_string_lossy().to_lowercase();
    match (text.contains("breakfast"), text.contains("lunch")) {
        (true, false) => Some(MealType::Breakfast),
        (false, true) => Some(MealType::Lunch),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn periods_from_file_names() {
        assert_eq!(
            period_from_name("lunch_2023-09-05"),
            Some(ReportPeriod::day(date(2023, 9, 5)))
        );
        assert_eq!(
            period_from_name("2023-09-30_2023-09-01"),
            Some(ReportPeriod::range(date(2023, 9, 1), date(2023, 9, 30)))
        );
        assert_eq!(
            period_from_name("sales-2024-02"),
            Some(ReportPeriod::range(date(2024, 2, 1), date(2024, 2, 29)))
        );
        assert_eq!(period_from_name("report"), None);
        assert_eq!(period_from_name("sales-2024-13"), None);
    }

    #[test]
    fn source_type_by_extension_then_content() {
        assert_eq!(detect_source_type(Path::new("a.PDF"), b""), Some(SourceType::Pdf));
        assert_eq!(detect_source_type(Path::new("a.htm"), b""), Some(SourceType::Html));
        assert_eq!(detect_source_type(Path::new("a.bin"), b"%PDF-1.7"), Some(SourceType::Pdf));
        assert_eq!(
            detect_source_type(Path::new("export"), b"\n  <html>"),
            Some(SourceType::Html)
        );
        assert_eq!(detect_source_type(Path::new("notes.txt"), b"hello"), None);
    }

    #[test]
    fn meal_hint_from_path() {
        assert_eq!(
            meal_from_path(Path::new("/data/Breakfast/2023-09-05.html")),
            Some(MealType::Breakfast)
        );
        assert_eq!(meal_from_path(Path::new("lunch_and_breakfast.pdf")), None);
        assert_eq!(meal_from_path(Path::new("sales.pdf")), None);
    }

    #[test]
    fn directory_is_sorted_and_unsupported_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_lunch_2023-09-06.html"), "<table></table>").unwrap();
        std::fs::write(dir.path().join("a_lunch_2023-09-05.html"), "<table></table>").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "notes").unwrap();
        std::fs::write(dir.path().join(".hidden.html"), "<p>x</p>").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let docs = load_documents(dir.path()).unwrap().documents;
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a_lunch_2023-09-05.html", "b_lunch_2023-09-06.html"]);
        assert_eq!(docs[0].period, Some(ReportPeriod::day(date(2023, 9, 5))));
        assert_eq!(docs[0].hints.meal_type, Some(MealType::Lunch));
    }

    #[test]
    fn missing_input_is_fatal() {
        let err = load_documents("/no/such/reports").unwrap_err();
        assert!(matches!(err, PipelineError::InputNotFound { .. }));
    }

    #[test]
    fn empty_directory_yields_no_documents() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_documents(dir.path()).unwrap();
        assert!(loaded.documents.is_empty() && loaded.unreadable.is_empty());
    }

    #[test]
    fn unreadable_listed_file_is_an_issue_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a_lunch_2023-09-05.html");
        std::fs::write(&good, "<table></table>").unwrap();
        let vanished = dir.path().join("b_lunch_2023-09-05.html");

        let loaded = read_files(&[good, vanished]);
        assert_eq!(loaded.documents.len(), 1);
        match &loaded.unreadable[..] {
            [Issue::NoDataExtracted { document, reason }] => {
                assert_eq!(document, "b_lunch_2023-09-05.html");
                assert!(reason.starts_with("file could not be read"), "got: {reason}");
            }
            other => panic!("unexpected issues {other:?}"),
        }
    }

    #[test]
    fn single_file_input_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sales_2023-09-05.html");
        std::fs::write(&file, "<table></table>").unwrap();
        let loaded = load_documents(&file).unwrap();
        assert_eq!(loaded.documents[0].stream, "sales");
    }
}
