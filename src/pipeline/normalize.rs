//! Schema normaliser: labelled rows → canonical [`MealRecord`]s.
//!
//! Each row's source labels go through the alias table; values missing from
//! the row fall back to the document context (`School: Lane ES` in a
//! heading), then the document hints (meal type from the file name), then a
//! single-day report period for the date. A row that still lacks a key field
//! is rejected with a `SchemaMappingError`, never guessed.

use crate::error::Issue;
use crate::model::{DocumentHints, Field, MealRecord, SourceRef, SourcedRecord};
use crate::pipeline::layout::{ParsedDocument, ParsedRow};
use crate::schools::{SchoolDirectory, SchoolMapping};
use crate::units::{parse_cents, parse_date, parse_quantity};
use crate::vocabulary::Vocabulary;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Item name used when a report has no item column.
pub const UNSPECIFIED_ITEM: &str = "unspecified";

/// Output of normalising one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<SourcedRecord>,
    /// Rows rejected with a `SchemaMappingError`.
    pub errors: usize,
    /// Rows dropped because their school is on the exclusion list.
    pub excluded: usize,
    pub issues: Vec<Issue>,
    /// Every raw school name seen, keyed by its trimmed spelling.
    pub school_mappings: BTreeMap<String, SchoolMapping>,
}

/// Normalise every row of a parsed document.
pub fn normalize_document(
    parsed: &ParsedDocument,
    source: &SourceRef,
    hints: &DocumentHints,
    vocabulary: &Vocabulary,
    schools: &SchoolDirectory,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mapping = map_labels(parsed, vocabulary, &mut batch.issues);
    let normalizer = RowNormalizer {
        parsed,
        source,
        hints,
        vocabulary,
        schools,
        mapping: &mapping,
    };

    for row in &parsed.rows {
        match normalizer.normalize(row, &mut batch.school_mappings) {
            Outcome::Record(record, cost_reported) => batch.records.push(SourcedRecord {
                record,
                source: source.clone(),
                cost_reported,
            }),
            Outcome::Excluded(school) => {
                debug!(document = %parsed.document_id, row = row.row, school = %school, "excluded school dropped");
                batch.excluded += 1;
            }
            Outcome::Rejected(detail) => {
                let issue = Issue::SchemaMappingError {
                    document: parsed.document_id.clone(),
                    row: row.row,
                    detail,
                };
                warn!("{issue}");
                batch.issues.push(issue);
                batch.errors += 1;
            }
        }
    }

    debug!(
        document = %parsed.document_id,
        records = batch.records.len(),
        rejected = batch.errors,
        excluded = batch.excluded,
        "document normalised"
    );
    batch
}

/// Resolve every distinct label once; unknown labels warn once each.
fn map_labels(
    parsed: &ParsedDocument,
    vocabulary: &Vocabulary,
    issues: &mut Vec<Issue>,
) -> HashMap<String, Option<Field>> {
    let mut mapping = HashMap::new();
    for row in &parsed.rows {
        for (label, _) in &row.fields {
            if mapping.contains_key(label) {
                continue;
            }
            let field = vocabulary.field_for(label);
            if field.is_none() && !label.trim().is_empty() {
                let issue = Issue::UnknownField {
                    document: parsed.document_id.clone(),
                    label: label.clone(),
                };
                warn!("{issue}");
                issues.push(issue);
            }
            mapping.insert(label.clone(), field);
        }
    }
    mapping
}

enum Outcome {
    /// The record and whether the row carried a unit cost.
    Record(MealRecord, bool),
    Excluded(String),
    Rejected(String),
}

struct RowNormalizer<'a> {
    parsed: &'a ParsedDocument,
    source: &'a SourceRef,
    hints: &'a DocumentHints,
    vocabulary: &'a Vocabulary,
    schools: &'a SchoolDirectory,
    mapping: &'a HashMap<String, Option<Field>>,
}

impl<'a> RowNormalizer<'a> {
    fn normalize(
        &self,
        row: &'a ParsedRow,
        mappings: &mut BTreeMap<String, SchoolMapping>,
    ) -> Outcome {
        let mut values: BTreeMap<Field, &str> = BTreeMap::new();
        let mut unparsable: Vec<Field> = Vec::new();
        for (label, value) in &row.fields {
            let Some(field) = self.mapping.get(label).copied().flatten() else {
                continue;
            };
            if row.flags.unparsable.contains(label) {
                unparsable.push(field);
                continue;
            }
            if let Some(v) = value.as_deref() {
                values.entry(field).or_insert(v);
            }
        }
        let cell = |field: Field| {
            values
                .get(&field)
                .copied()
                .or_else(|| self.parsed.context.get(field))
        };

        // ── School ──
        let Some(raw_school) = cell(Field::SchoolId).or(self.hints.school.as_deref()) else {
            return Outcome::Rejected("missing required field school_id".into());
        };
        if self.vocabulary.is_excluded_school(raw_school) {
            return Outcome::Excluded(raw_school.to_string());
        }
        let mapping = if self.schools.is_empty() {
            SchoolMapping::passthrough(raw_school)
        } else {
            match self.schools.resolve(raw_school) {
                Some(m) if self.vocabulary.is_excluded_school(&m.school.name) => {
                    return Outcome::Excluded(m.school.name.clone());
                }
                Some(m) => SchoolMapping::matched(raw_school, &m),
                None => SchoolMapping::unmapped(raw_school),
            }
        };
        let school_id = mapping.school_id.clone();
        mappings.entry(mapping.raw.clone()).or_insert(mapping);
        let Some(school_id) = school_id else {
            return Outcome::Rejected(format!("unknown school '{raw_school}'"));
        };

        // ── Date ──
        let date = match cell(Field::Date) {
            Some(raw) => match parse_date(raw) {
                Some(d) => d,
                None => return Outcome::Rejected(format!("unparsable date '{raw}'")),
            },
            None => match self.source.period.and_then(|p| p.single_day()) {
                Some(d) => d,
                None => return Outcome::Rejected("missing required field date".into()),
            },
        };

        // ── Meal type / category ──
        let meal_type = match self.key_value(cell(Field::MealType), self.hints.meal_type, |s| {
            self.vocabulary.meal_type(s)
        }) {
            Ok(m) => m,
            Err(detail) => return Outcome::Rejected(format!("meal_type: {detail}")),
        };
        let category = match self.key_value(cell(Field::Category), self.hints.category, |s| {
            self.vocabulary.category(s)
        }) {
            Ok(c) => c,
            Err(detail) => return Outcome::Rejected(format!("category: {detail}")),
        };

        // ── Measures ──
        if let Some(field) = Field::ALL.iter().find(|f| f.is_numeric() && unparsable.contains(f)) {
            return Outcome::Rejected(format!("{field} is not numeric"));
        }
        let measure = |field: Field, parse: fn(&str) -> Option<u64>| match cell(field) {
            Some(raw) if !raw.trim().is_empty() => parse(raw)
                .map(Some)
                .ok_or_else(|| format!("invalid {field} '{raw}'")),
            _ => Ok(None),
        };
        let served_qty = match measure(Field::ServedQty, parse_quantity) {
            Ok(Some(q)) => q,
            Ok(None) => return Outcome::Rejected("missing required field served_qty".into()),
            Err(detail) => return Outcome::Rejected(detail),
        };
        let (planned_qty, waste_qty) = match (
            measure(Field::PlannedQty, parse_quantity),
            measure(Field::WasteQty, parse_quantity),
        ) {
            (Ok(planned), Ok(waste)) => (planned.unwrap_or(0), waste.unwrap_or(0)),
            (Err(detail), _) | (_, Err(detail)) => return Outcome::Rejected(detail),
        };
        let unit_cost = match cell(Field::UnitCost).filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => match parse_cents(raw) {
                Some(c) => Some(c),
                None => return Outcome::Rejected(format!("invalid unit_cost '{raw}'")),
            },
            None => None,
        };

        let item_id = cell(Field::ItemId)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNSPECIFIED_ITEM)
            .to_string();

        Outcome::Record(
            MealRecord {
                school_id,
                date,
                meal_type,
                category,
                item_id,
                served_qty,
                planned_qty,
                unit_cost: unit_cost.unwrap_or(0),
                waste_qty,
            },
            unit_cost.is_some(),
        )
    }

    /// A key field from the row/context text, else the document hint.
    /// Present-but-unrecognised text is an error even when a hint exists.
    fn key_value<T: Copy>(
        &self,
        raw: Option<&str>,
        hint: Option<T>,
        lookup: impl Fn(&str) -> Option<T>,
    ) -> Result<T, String> {
        match (raw, hint) {
            (Some(raw), _) => lookup(raw).ok_or_else(|| format!("unrecognised value '{raw}'")),
            (None, Some(hint)) => Ok(hint),
            (None, None) => Err("missing and no document hint".into()),
        }
    }
}
