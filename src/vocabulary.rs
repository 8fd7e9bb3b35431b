//! Alias and vocabulary table: the configuration that teaches the pipeline
//! how reports label things.
//!
//! Field aliases, category and meal-type variants, header keywords, total-row
//! markers and excluded schools are data, not code. They load once per run
//! from TOML into a [`Vocabulary`], which is wrapped in an `Arc` and never
//! mutated afterwards. The same file may carry a `[[schools]]` table for the
//! [`SchoolDirectory`].
//!
//! ```toml
//! header_keywords = ["Notes"]
//! total_markers   = ["total"]
//!
//! [field_aliases]
//! school_id = ["Bldg", "Site"]
//! unit_cost = ["Meal Cost"]
//!
//! [category_variants]
//! Full-price = ["Paid"]
//!
//! [[schools]]
//! id = "041"
//! name = "Lane ES"
//! region = "Region 3"
//! ```
//!
//! Entries in the file extend the built-in defaults unless
//! `replace_defaults = true`.

use crate::error::PipelineError;
use crate::model::{Category, Field, MealType};
use crate::schools::{School, SchoolDirectory, DEFAULT_FUZZY_THRESHOLD};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

const DEFAULT_TABLE_SELECTOR: &str = "table";

/// Compiled lookup tables. All keys are stored in [`normalize_label`] form.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    field_by_label: HashMap<String, Field>,
    header_terms: HashSet<String>,
    category_by_label: HashMap<String, Category>,
    meal_by_label: HashMap<String, MealType>,
    total_markers: Vec<String>,
    excluded_schools: HashSet<String>,
    table_selector: String,
}

/// Raw shape of the vocabulary file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VocabularyFile {
    pub replace_defaults: bool,
    pub header_keywords: Vec<String>,
    pub total_markers: Vec<String>,
    pub excluded_schools: Vec<String>,
    pub table_selector: Option<String>,
    pub fuzzy_threshold: Option<f64>,
    pub field_aliases: BTreeMap<Field, Vec<String>>,
    pub category_variants: BTreeMap<Category, Vec<String>>,
    pub meal_type_variants: BTreeMap<MealType, Vec<String>>,
    pub schools: Vec<School>,
}

/// Everything loaded from one vocabulary file.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub vocabulary: Vocabulary,
    pub schools: SchoolDirectory,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::compile(&VocabularyFile::default())
    }
}

impl Vocabulary {
    /// Build lookups from a file description, layering it over the defaults
    /// unless it asks to replace them.
    pub fn compile(file: &VocabularyFile) -> Self {
        let mut vocab = if file.replace_defaults {
            Self::empty()
        } else {
            Self::builtin()
        };
        for (field, aliases) in &file.field_aliases {
            for alias in aliases {
                vocab.add_field_alias(*field, alias);
            }
        }
        for (category, variants) in &file.category_variants {
            for v in variants {
                vocab.category_by_label.insert(normalize_label(v), *category);
            }
        }
        for (meal, variants) in &file.meal_type_variants {
            for v in variants {
                vocab.meal_by_label.insert(normalize_label(v), *meal);
            }
        }
        for kw in &file.header_keywords {
            vocab.header_terms.insert(normalize_label(kw));
        }
        for marker in &file.total_markers {
            let m = normalize_label(marker);
            if !m.is_empty() && !vocab.total_markers.contains(&m) {
                vocab.total_markers.push(m);
            }
        }
        for school in &file.excluded_schools {
            vocab.excluded_schools.insert(normalize_label(school));
        }
        if let Some(sel) = &file.table_selector {
            vocab.table_selector = sel.clone();
        }
        vocab
    }

    fn empty() -> Self {
        let mut vocab = Self {
            field_by_label: HashMap::new(),
            header_terms: HashSet::new(),
            category_by_label: HashMap::new(),
            meal_by_label: HashMap::new(),
            total_markers: Vec::new(),
            excluded_schools: HashSet::new(),
            table_selector: DEFAULT_TABLE_SELECTOR.to_string(),
        };
        // Canonical names always resolve to themselves.
        for field in Field::ALL {
            vocab.add_field_alias(field, field.column());
        }
        for category in Category::ALL {
            vocab
                .category_by_label
                .insert(normalize_label(category.as_str()), category);
        }
        for meal in MealType::ALL {
            vocab.meal_by_label.insert(normalize_label(meal.as_str()), meal);
        }
        vocab
    }

    fn builtin() -> Self {
        let mut vocab = Self::empty();
        let aliases: &[(Field, &[&str])] = &[
            (
                Field::SchoolId,
                &["School", "School Name", "School_Name", "Bldg", "Building", "Site", "Location"],
            ),
            (
                Field::Date,
                &["Date", "Serving Date", "Service Date", "Sale Date", "Day"],
            ),
            (Field::MealType, &["Meal", "Meal Type", "Service"]),
            (
                Field::Category,
                &["Category", "Eligibility", "Meal Category", "Price Category", "Status"],
            ),
            (
                Field::ItemId,
                &["Item", "Menu Item", "Item Name", "Recipe", "Description"],
            ),
            (
                Field::ServedQty,
                &["Served", "Qty Served", "Quantity Served", "Total Served", "Sold", "Served Total"],
            ),
            (
                Field::PlannedQty,
                &["Planned", "Planned Qty", "Qty Planned", "Planned Total", "Projected", "Prepared"],
            ),
            (
                Field::UnitCost,
                &["Meal Cost", "Unit Cost", "Cost", "Price", "Cost Per Serving", "Unit Price"],
            ),
            (
                Field::WasteQty,
                &["Waste", "Wasted", "Qty Wasted", "Discarded", "Leftover", "Waste Qty"],
            ),
        ];
        for (field, labels) in aliases {
            for label in *labels {
                vocab.add_field_alias(*field, label);
            }
        }

        let categories: &[(Category, &[&str])] = &[
            (Category::Free, &["F", "Free Meals", "Free Meal"]),
            (Category::Reduced, &["R", "Reduced Price", "Reduced Meals", "Red"]),
            (
                Category::FullPrice,
                &["Paid", "P", "Full Price", "Full", "Full Pay", "Regular"],
            ),
            (Category::Adult, &["A", "Adults", "Staff", "Adult Meals"]),
        ];
        for (category, labels) in categories {
            for label in *labels {
                vocab.category_by_label.insert(normalize_label(label), *category);
            }
        }

        let meals: &[(MealType, &[&str])] = &[
            (MealType::Breakfast, &["B", "BRK", "Bkfst", "Brkfst", "AM"]),
            (MealType::Lunch, &["L", "LUN", "LCH", "Noon"]),
        ];
        for (meal, labels) in meals {
            for label in *labels {
                vocab.meal_by_label.insert(normalize_label(label), *meal);
            }
        }

        for kw in ["Total Cost", "Notes", "Line", "Percent", "Variance", "Cost Total"] {
            vocab.header_terms.insert(normalize_label(kw));
        }
        vocab.total_markers = ["total", "totals", "grand total", "subtotal", "sub total"]
            .iter()
            .map(|m| m.to_string())
            .collect();
        for s in ["Test Site Elementary School", "Test Site Elementary"] {
            vocab.excluded_schools.insert(normalize_label(s));
        }
        vocab
    }

    fn add_field_alias(&mut self, field: Field, alias: &str) {
        let label = normalize_label(alias);
        if label.is_empty() {
            return;
        }
        if let Some(prev) = self.field_by_label.insert(label.clone(), field) {
            if prev != field {
                warn!(alias, from = %prev, to = %field, "field alias remapped");
            }
        }
        self.header_terms.insert(label);
    }

    /// Canonical field for a source column label.
    pub fn field_for(&self, label: &str) -> Option<Field> {
        self.field_by_label.get(&normalize_label(label)).copied()
    }

    /// True if the cell is a known column heading.
    pub fn is_header_term(&self, cell: &str) -> bool {
        let label = normalize_label(cell);
        !label.is_empty() && self.header_terms.contains(&label)
    }

    /// True if the cell marks a total/footer row ("Total", "Grand Total",
    /// "Daily Total", "Totals for Lane ES").
    pub fn is_total_marker(&self, cell: &str) -> bool {
        let label = normalize_label(cell);
        if label.is_empty() {
            return false;
        }
        self.total_markers.iter().any(|m| {
            label == *m || label.starts_with(&format!("{m} ")) || label.ends_with(&format!(" {m}"))
        })
    }

    /// Category for a label: exact canonical spelling first, then the
    /// case- and punctuation-insensitive variant table. Never guesses.
    pub fn category(&self, raw: &str) -> Option<Category> {
        let raw = raw.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == raw)
            .or_else(|| self.category_by_label.get(&normalize_label(raw)).copied())
    }

    pub fn meal_type(&self, raw: &str) -> Option<MealType> {
        self.meal_by_label.get(&normalize_label(raw)).copied()
    }

    pub fn is_excluded_school(&self, raw: &str) -> bool {
        self.excluded_schools.contains(&normalize_label(raw))
    }

    /// CSS selector for tabular elements in HTML reports.
    pub fn table_selector(&self) -> &str {
        &self.table_selector
    }
}

impl ReferenceData {
    /// Parse a vocabulary file from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let file: VocabularyFile = toml::from_str(text)?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: VocabularyFile) -> Self {
        let vocabulary = Vocabulary::compile(&file);
        let threshold = file.fuzzy_threshold.unwrap_or(DEFAULT_FUZZY_THRESHOLD);
        let schools = SchoolDirectory::new(file.schools).with_fuzzy_threshold(threshold);
        debug!(schools = schools.len(), "reference data compiled");
        Self {
            vocabulary,
            schools,
        }
    }

    /// Load and compile a vocabulary file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| PipelineError::VocabularyReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::from_toml_str(&text).map_err(|e| PipelineError::InvalidVocabulary {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

/// Lower-case, collapse every run of non-alphanumeric characters to one
/// space, trim. `"Qty_Served"`, `"qty  served"` and `"QTY-SERVED"` all
/// become `"qty served"`.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_space = false;
    for c in label.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}
