//! Export: canonical dataset as delimited text, reports as JSON.
//!
//! The dataset layout is fixed: one header line with [`DATASET_COLUMNS`],
//! then one line per record in key order. `unit_cost` is printed as a decimal
//! amount (`0.45`), dates as ISO `YYYY-MM-DD`. Fields containing the
//! delimiter, a quote or a line break are quoted with doubled inner quotes.
//!
//! File writes are atomic: the content goes to a sibling `.tmp` file that is
//! then renamed over the target, so readers never see a partial dataset.

use crate::error::PipelineError;
use crate::model::{Field, MealRecord};
use crate::pipeline::merge::Dataset;
use crate::units::format_cents;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

/// Header of the exported dataset, in column order.
pub const DATASET_COLUMNS: [&str; 9] = [
    "school_id",
    "date",
    "meal_type",
    "category",
    "item_id",
    "served_qty",
    "planned_qty",
    "unit_cost",
    "waste_qty",
];

fn needs_quotes(field: &str, sep: char) -> bool {
    field.contains(sep) || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write one delimited row.
pub fn write_row<W: Write, S: AsRef<str>>(mut w: W, row: &[S], sep: char) -> io::Result<()> {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            write!(w, "{sep}")?;
        }
        let cell = cell.as_ref();
        if needs_quotes(cell, sep) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            w.write_all(cell.as_bytes())?;
        }
    }
    writeln!(w)
}

/// Cells of one record in [`DATASET_COLUMNS`] order.
pub fn record_cells(record: &MealRecord) -> [String; 9] {
    Field::ALL.map(|field| match field {
        Field::SchoolId => record.school_id.clone(),
        Field::Date => record.date.format("%Y-%m-%d").to_string(),
        Field::MealType => record.meal_type.to_string(),
        Field::Category => record.category.to_string(),
        Field::ItemId => record.item_id.clone(),
        Field::ServedQty => record.served_qty.to_string(),
        Field::PlannedQty => record.planned_qty.to_string(),
        Field::UnitCost => format_cents(record.unit_cost),
        Field::WasteQty => record.waste_qty.to_string(),
    })
}

/// Write the header and every record.
pub fn write_dataset<W: Write>(mut w: W, dataset: &Dataset, sep: char) -> io::Result<()> {
    write_row(&mut w, &DATASET_COLUMNS, sep)?;
    for record in dataset.records() {
        write_row(&mut w, &record_cells(record), sep)?;
    }
    w.flush()
}

/// The full delimited export as a string.
pub fn dataset_to_string(dataset: &Dataset, sep: char) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_dataset(&mut buf, dataset, sep);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Write the dataset to `path` atomically.
pub async fn write_dataset_file(
    dataset: &Dataset,
    path: impl AsRef<Path>,
    sep: char,
) -> Result<(), PipelineError> {
    write_atomic(path.as_ref(), dataset_to_string(dataset, sep).as_bytes()).await
}

/// Pretty-printed JSON of any serialisable report.
pub fn to_json_string<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("Failed to serialise report: {e}")))
}

/// Write a serialisable report to `path` as JSON, atomically.
pub async fn write_json_file<T: Serialize>(
    value: &T,
    path: impl AsRef<Path>,
) -> Result<(), PipelineError> {
    let json = to_json_string(value)?;
    write_atomic(path.as_ref(), json.as_bytes()).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let failed = |source: io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, bytes).await.map_err(failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(failed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, MealType};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn dataset() -> Dataset {
        Dataset::new(
            vec![
                MealRecord {
                    school_id: "207".into(),
                    date: NaiveDate::from_ymd_opt(2023, 9, 5).unwrap(),
                    meal_type: MealType::Lunch,
                    category: Category::FullPrice,
                    item_id: "Pizza, cheese".into(),
                    served_qty: 50,
                    planned_qty: 60,
                    unit_cost: 125,
                    waste_qty: 2,
                },
                MealRecord {
                    school_id: "041".into(),
                    date: NaiveDate::from_ymd_opt(2023, 9, 5).unwrap(),
                    meal_type: MealType::Breakfast,
                    category: Category::Free,
                    item_id: "Milk".into(),
                    served_qty: 120,
                    planned_qty: 100,
                    unit_cost: 45,
                    waste_qty: 8,
                },
            ],
            Arc::default(),
        )
    }

    #[test]
    fn csv_export_has_fixed_columns_and_quotes() {
        let text = dataset_to_string(&dataset(), ',');
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "school_id,date,meal_type,category,item_id,served_qty,planned_qty,unit_cost,waste_qty",
                "041,2023-09-05,breakfast,Free,Milk,120,100,0.45,8",
                "207,2023-09-05,lunch,Full-price,\"Pizza, cheese\",50,60,1.25,2",
            ]
        );
    }

    #[test]
    fn tab_export_needs_no_quotes_for_commas() {
        let text = dataset_to_string(&dataset(), '\t');
        assert!(text.contains("\tPizza, cheese\t"));
    }

    #[test]
    fn quotes_are_doubled() {
        let mut buf = Vec::new();
        write_row(&mut buf, &["a\"b", "c"], ',').unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "\"a\"\"b\",c\n");
    }

    #[tokio::test]
    async fn file_write_is_atomic_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("dataset.csv");
        write_dataset_file(&dataset(), &path, ',').await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("school_id,"));
        assert!(!dir.path().join("out").join("dataset.csv.tmp").exists());
    }
}
