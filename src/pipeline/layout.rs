//! Layout parser: reader fragments → rows labelled with the source's own
//! column headings.
//!
//! Both source formats share one grid walker; they differ only in how a grid
//! without a header row is treated and whether page footers can appear:
//!
//! | Rule                     | PDF                       | HTML    |
//! |--------------------------|---------------------------|---------|
//! | grid without header      | inherits previous header  | skipped |
//! | `Page N of M` rows/text  | dropped                   | kept    |
//!
//! The parser does not map labels to canonical fields. It only decides which
//! row is a header, which rows are data, and flags cells that needed repair.

use crate::error::Issue;
use crate::model::{Field, SourceType};
use crate::pipeline::reader::{collapse_whitespace, Fragment};
use crate::units::{clean_numeric, parse_cents, parse_date, parse_quantity};
use crate::vocabulary::Vocabulary;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

static RE_PAGE_FOOTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^page\s+\d+(\s*(of|/)\s*\d+)?$").unwrap());

static RE_INLINE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4}|\d{1,2}-[a-z]{3}-\d{4}|(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.? \d{1,2}, \d{4})\b",
    )
    .unwrap()
});

static RE_MEAL_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(breakfast|lunch)\b").unwrap());

// ── Output types ─────────────────────────────────────────────────────────────

/// Per-row quality flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFlags {
    /// The row had fewer cells than its header.
    pub incomplete: bool,
    /// Labels of numeric cells that parsed only after cleanup.
    pub repaired: Vec<String>,
    /// Labels of numeric cells that stayed unparsable.
    pub unparsable: Vec<String>,
}

/// One data row with the source's labels. `None` is the null sentinel for
/// an empty or missing cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub document_id: String,
    /// 1-based ordinal of the row among all table rows of the document.
    pub row: usize,
    pub fields: Vec<(String, Option<String>)>,
    pub flags: RowFlags,
}

impl ParsedRow {
    /// Cell under `label`, if the column exists and the cell is not null.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Document-level values gathered from free text (titles, headings,
/// `Label: value` lines). Used when a row lacks a column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContext {
    pub fields: BTreeMap<Field, String>,
}

impl DocumentContext {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// Pick up whatever a text block says about the whole document. The
    /// first value seen for a field wins.
    pub fn absorb(&mut self, text: &str, vocabulary: &Vocabulary) {
        if let Some((label, value)) = text.split_once(':') {
            let value = value.trim();
            if let Some(field) = vocabulary.field_for(label) {
                if !value.is_empty() {
                    self.fields.entry(field).or_insert_with(|| value.to_string());
                }
            }
        }

        if !self.fields.contains_key(&Field::Date) {
            // Only an unambiguous single date; a "from – to" line is a period.
            let mut dates: Vec<_> = RE_INLINE_DATE
                .find_iter(text)
                .filter_map(|m| parse_date(m.as_str()))
                .collect();
            dates.dedup();
            if let [date] = dates.as_slice() {
                self.fields.insert(Field::Date, date.to_string());
            }
        }

        if !self.fields.contains_key(&Field::MealType) {
            let mut meals: Vec<String> = RE_MEAL_WORD
                .find_iter(text)
                .map(|m| m.as_str().to_lowercase())
                .collect();
            meals.sort();
            meals.dedup();
            if let [meal] = meals.as_slice() {
                self.fields.insert(Field::MealType, meal.clone());
            }
        }
    }
}

/// Everything the layout stage learned about one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    pub document_id: String,
    pub rows: Vec<ParsedRow>,
    pub context: DocumentContext,
    /// Incomplete and unparsable row issues, in source order.
    pub issues: Vec<Issue>,
    /// Numeric cells fixed by the cleanup pass.
    pub repaired_cells: usize,
}

// ── Parsers ──────────────────────────────────────────────────────────────────

/// Format-specific positional rules.
pub trait LayoutParser: Send + Sync {
    fn source_type(&self) -> SourceType;

    fn parse(&self, document_id: &str, fragments: &[Fragment], vocabulary: &Vocabulary)
        -> ParsedDocument;
}

/// PDF production/sales reports: tables split across pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfLayout;

/// HTML production reports: one `<table>` per report section.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlLayout;

impl LayoutParser for PdfLayout {
    fn source_type(&self) -> SourceType {
        SourceType::Pdf
    }

    fn parse(
        &self,
        document_id: &str,
        fragments: &[Fragment],
        vocabulary: &Vocabulary,
    ) -> ParsedDocument {
        GridWalker {
            document_id,
            vocabulary,
            inherit_header: true,
            drop_page_footers: true,
        }
        .walk(fragments)
    }
}

impl LayoutParser for HtmlLayout {
    fn source_type(&self) -> SourceType {
        SourceType::Html
    }

    fn parse(
        &self,
        document_id: &str,
        fragments: &[Fragment],
        vocabulary: &Vocabulary,
    ) -> ParsedDocument {
        GridWalker {
            document_id,
            vocabulary,
            inherit_header: false,
            drop_page_footers: false,
        }
        .walk(fragments)
    }
}

/// Parser for a source type.
pub fn layout_for(source_type: SourceType) -> &'static dyn LayoutParser {
    match source_type {
        SourceType::Pdf => &PdfLayout,
        SourceType::Html => &HtmlLayout,
    }
}

/// True when a row reads as column headings: at least two of its non-empty
/// cells (or all of them, if fewer) are known labels, and they make up at
/// least half of the non-empty cells.
pub fn is_header_row(cells: &[String], vocabulary: &Vocabulary) -> bool {
    let non_empty: Vec<&String> = cells.iter().filter(|c| !c.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return false;
    }
    let matched = non_empty.iter().filter(|c| vocabulary.is_header_term(c)).count();
    matched >= non_empty.len().min(2) && matched * 2 >= non_empty.len()
}

/// True for `Page 3`, `Page 3 of 7`, `page 3/7`.
pub fn is_page_footer(text: &str) -> bool {
    RE_PAGE_FOOTER.is_match(text.trim())
}

// ── Shared walker ────────────────────────────────────────────────────────────

struct GridWalker<'a> {
    document_id: &'a str,
    vocabulary: &'a Vocabulary,
    inherit_header: bool,
    drop_page_footers: bool,
}

impl GridWalker<'_> {
    fn walk(&self, fragments: &[Fragment]) -> ParsedDocument {
        let mut out = ParsedDocument {
            document_id: self.document_id.to_string(),
            ..ParsedDocument::default()
        };
        let mut carried: Option<Vec<String>> = None;
        let mut ordinal = 0usize;

        for fragment in fragments {
            let grid = match fragment {
                Fragment::Text(text) => {
                    if !(self.drop_page_footers && is_page_footer(text)) {
                        out.context.absorb(text, self.vocabulary);
                    }
                    continue;
                }
                Fragment::Table(grid) => grid,
            };

            let mut header = if self.inherit_header {
                carried.clone()
            } else {
                None
            };
            let mut skipped_headerless = 0usize;

            for cells in &grid.rows {
                ordinal += 1;
                let first = cells.iter().map(|c| c.trim()).find(|c| !c.is_empty());
                let Some(first) = first else {
                    continue;
                };

                if is_header_row(cells, self.vocabulary) {
                    let labels = header_labels(cells);
                    if header.as_ref() == Some(&labels) {
                        debug!(document = self.document_id, row = ordinal, "repeated header skipped");
                    } else {
                        debug!(document = self.document_id, row = ordinal, columns = ?labels, "header");
                        header = Some(labels);
                    }
                    continue;
                }
                if self.drop_page_footers && is_page_footer(first) {
                    continue;
                }
                if self.vocabulary.is_total_marker(first) {
                    debug!(document = self.document_id, row = ordinal, marker = first, "total row dropped");
                    continue;
                }
                let Some(labels) = header.as_ref() else {
                    skipped_headerless += 1;
                    continue;
                };
                let row = self.data_row(ordinal, labels, cells, &mut out);
                out.rows.push(row);
            }

            if skipped_headerless > 0 {
                debug!(
                    document = self.document_id,
                    page = ?grid.page,
                    rows = skipped_headerless,
                    "grid without header skipped"
                );
            }
            if self.inherit_header {
                carried = header;
            }
        }
        out
    }

    fn data_row(
        &self,
        ordinal: usize,
        labels: &[String],
        cells: &[String],
        out: &mut ParsedDocument,
    ) -> ParsedRow {
        let mut flags = RowFlags::default();
        if cells.len() < labels.len() {
            flags.incomplete = true;
            let issue = Issue::IncompleteRow {
                document: self.document_id.to_string(),
                row: ordinal,
                expected: labels.len(),
                found: cells.len(),
            };
            warn!("{issue}");
            out.issues.push(issue);
        } else if cells.len() > labels.len() {
            debug!(
                document = self.document_id,
                row = ordinal,
                surplus = cells.len() - labels.len(),
                "surplus cells dropped"
            );
        }

        let mut fields = Vec::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            let mut value = cells
                .get(i)
                .map(|c| collapse_whitespace(c))
                .filter(|c| !c.is_empty());

            let numeric = self.vocabulary.field_for(label).filter(Field::is_numeric);
            if let (Some(field), Some(raw)) = (numeric, value.clone()) {
                if !parses_as(field, &raw) {
                    match clean_numeric(&raw).filter(|c| parses_as(field, c)) {
                        Some(cleaned) => {
                            debug!(document = self.document_id, row = ordinal, column = %label, raw = %raw, cleaned = %cleaned, "numeric cell repaired");
                            flags.repaired.push(label.clone());
                            out.repaired_cells += 1;
                            value = Some(cleaned);
                        }
                        None => {
                            let issue = Issue::UnparsableRow {
                                document: self.document_id.to_string(),
                                row: ordinal,
                                column: label.clone(),
                                value: raw.clone(),
                            };
                            warn!("{issue}");
                            out.issues.push(issue);
                            flags.unparsable.push(label.clone());
                        }
                    }
                }
            }
            fields.push((label.clone(), value));
        }

        ParsedRow {
            document_id: self.document_id.to_string(),
            row: ordinal,
            fields,
            flags,
        }
    }
}

fn header_labels(cells: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = cells.iter().map(|c| collapse_whitespace(c)).collect();
    while labels.last().is_some_and(|l| l.is_empty()) {
        labels.pop();
    }
    labels
}

fn parses_as(field: Field, cell: &str) -> bool {
    match field {
        Field::UnitCost => parse_cents(cell).is_some(),
        _ => parse_quantity(cell).is_some(),
    }
}
