//! Canonical data model shared by every pipeline stage.
//!
//! [`RawDocument`] is the immutable input, [`MealRecord`] the canonical fact
//! row produced by normalisation and deduplicated by the merge engine. A
//! record's identity is its [`RecordKey`]; everything else on the record is a
//! measure that the merge engine sums or reconciles.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Money in the smallest currency unit (cents). Integer arithmetic only.
pub type Cents = i64;

// ── Documents ────────────────────────────────────────────────────────────

/// Source format of a raw document. Selects the reader and layout parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Html,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Pdf => f.write_str("pdf"),
            SourceType::Html => f.write_str("html"),
        }
    }
}

/// The date range a report covers (inclusive on both ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportPeriod {
    /// A single-day report.
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// A multi-day report; the bounds are reordered if given backwards.
    pub fn range(a: NaiveDate, b: NaiveDate) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// The covered day when the period is exactly one day long.
    pub fn single_day(&self) -> Option<NaiveDate> {
        (self.start == self.end).then_some(self.start)
    }
}

/// Document-level values used when a row has no column for them, e.g. a
/// "Breakfast production" report whose rows never name the meal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHints {
    pub meal_type: Option<MealType>,
    pub category: Option<Category>,
    pub school: Option<String>,
}

/// One input document. Never mutated after ingestion.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub id: String,
    pub source_type: SourceType,
    pub content: Vec<u8>,
    pub period: Option<ReportPeriod>,
    pub hints: DocumentHints,
    /// Recurring report this document belongs to; defaults to
    /// [`report_stream`] of the id.
    pub stream: String,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, source_type: SourceType, content: Vec<u8>) -> Self {
        let id = id.into();
        Self {
            stream: report_stream(&id),
            id,
            source_type,
            content,
            period: None,
            hints: DocumentHints::default(),
        }
    }

    pub fn html(id: impl Into<String>, markup: impl Into<String>) -> Self {
        Self::new(id, SourceType::Html, markup.into().into_bytes())
    }

    pub fn pdf(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(id, SourceType::Pdf, bytes)
    }

    pub fn with_period(mut self, period: ReportPeriod) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_meal_type(mut self, meal_type: MealType) -> Self {
        self.hints.meal_type = Some(meal_type);
        self
    }

    /// Provenance handle for records extracted from this document.
    pub fn source_ref(&self, seq: usize) -> SourceRef {
        SourceRef {
            document_id: self.id.clone(),
            seq,
            source_type: self.source_type,
            stream: self.stream.clone(),
            period: self.period,
        }
    }
}

/// Where a record came from. `seq` is the ingestion order used for
/// later-wins decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub seq: usize,
    pub source_type: SourceType,
    /// Which recurring report this is, see [`report_stream`].
    pub stream: String,
    pub period: Option<ReportPeriod>,
}

static RE_NAME_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}(?:-\d{2})?|\d{8}").unwrap());

static RE_REVISION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[-_ .]+(?:v|rev)\d+|\s*\(\d+\))$").unwrap());

static RE_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Report stream of a document id: the file stem lowercased, with dates and
/// a trailing revision marker (`_v2`, `-rev1`, ` (1)`) removed.
///
/// `sales_2023-09-05.html` and `sales_2023-09-05_v2.pdf` share the stream
/// `sales`; `production_2023-09-05.html` is `production`.
pub fn report_stream(id: &str) -> String {
    let name = id.rsplit(['/', '\\']).next().unwrap_or(id);
    let stem = match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => name,
    };
    let lower = stem.to_lowercase();
    let undated = RE_NAME_DATE.replace_all(&lower, "");
    let trimmed = undated.trim_end_matches(|c: char| !c.is_ascii_alphanumeric() && c != ')');
    let unrevised = RE_REVISION.replace(trimmed, "");
    RE_SEPARATORS
        .replace_all(&unrevised, "_")
        .trim_matches('_')
        .to_string()
}

// ── Enumerations ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
}

impl MealType {
    pub const ALL: [MealType; 2] = [MealType::Breakfast, MealType::Lunch];

    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Meal eligibility category. The set is closed: unknown labels are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Free,
    Reduced,
    #[serde(rename = "Full-price")]
    FullPrice,
    Adult,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Free,
        Category::Reduced,
        Category::FullPrice,
        Category::Adult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Free => "Free",
            Category::Reduced => "Reduced",
            Category::FullPrice => "Full-price",
            Category::Adult => "Adult",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical column of a [`MealRecord`], in export order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    SchoolId,
    Date,
    MealType,
    Category,
    ItemId,
    ServedQty,
    PlannedQty,
    UnitCost,
    WasteQty,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::SchoolId,
        Field::Date,
        Field::MealType,
        Field::Category,
        Field::ItemId,
        Field::ServedQty,
        Field::PlannedQty,
        Field::UnitCost,
        Field::WasteQty,
    ];

    /// Column name in the exported dataset.
    pub fn column(&self) -> &'static str {
        match self {
            Field::SchoolId => "school_id",
            Field::Date => "date",
            Field::MealType => "meal_type",
            Field::Category => "category",
            Field::ItemId => "item_id",
            Field::ServedQty => "served_qty",
            Field::PlannedQty => "planned_qty",
            Field::UnitCost => "unit_cost",
            Field::WasteQty => "waste_qty",
        }
    }

    /// Columns whose cells must hold a number.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::ServedQty | Field::PlannedQty | Field::UnitCost | Field::WasteQty
        )
    }

}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

// ── Records ──────────────────────────────────────────────────────────────

/// Identity of a record. Unique across the merged dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub school_id: String,
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub category: Category,
    pub item_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.school_id, self.date, self.meal_type, self.category, self.item_id
        )
    }
}

/// The canonical atomic fact: one item served at one school on one day for
/// one meal and eligibility category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealRecord {
    pub school_id: String,
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub category: Category,
    pub item_id: String,
    pub served_qty: u64,
    pub planned_qty: u64,
    pub unit_cost: Cents,
    pub waste_qty: u64,
}

impl MealRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            school_id: self.school_id.clone(),
            date: self.date,
            meal_type: self.meal_type,
            category: self.category,
            item_id: self.item_id.clone(),
        }
    }

    /// Unit cost × served quantity.
    pub fn actual_cost(&self) -> Cents {
        self.unit_cost * self.served_qty as Cents
    }

    /// Unit cost × planned quantity.
    pub fn planned_cost(&self) -> Cents {
        self.unit_cost * self.planned_qty as Cents
    }
}

/// A normalised record still carrying its provenance, as handed to the
/// merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedRecord {
    pub record: MealRecord,
    pub source: SourceRef,
    /// False when the source had no unit cost; `record.unit_cost` is then 0
    /// and the merge leaves it out of cost agreement.
    pub cost_reported: bool,
}
