//! Integration tests for schoolmeal-metrics.
//!
//! These drive the public API with in-memory HTML reports and `tempfile`
//! directories. PDF input needs the pdfium shared library and is covered by
//! the reader's unit tests instead.
//!
//! Run with:
//!   cargo test --test pipeline

use chrono::NaiveDate;
use schoolmeal_metrics::export::{dataset_to_string, write_dataset_file};
use schoolmeal_metrics::metrics::{Filter, GroupBy, GroupKey, Measure, TrendPeriod};
use schoolmeal_metrics::{
    run, run_documents, Category, Issue, MealType, PipelineConfig, RawDocument, RecordKey,
    ReportPeriod, School, SchoolDirectory,
};

// ── Test helpers ─────────────────────────────────────────────────────────────

const HEADER: &str = "<tr><th>School</th><th>Date</th><th>Meal</th><th>Category</th>\
    <th>Item</th><th>Served</th><th>Planned</th><th>Cost</th><th>Waste</th></tr>";

/// One report table with the standard header.
fn report(rows: &[[&str; 9]]) -> String {
    let mut html = String::from("<h1>Production Record</h1><table>");
    html.push_str(HEADER);
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{cell}</td>"));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

fn directory() -> SchoolDirectory {
    SchoolDirectory::new(vec![
        School::new("041", "Lane ES").with_region("Region 3"),
        School::new("207", "Washington MS").with_region("Region 1"),
    ])
}

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .schools(directory())
        .build()
        .unwrap()
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 9, d).unwrap()
}

fn pizza_key() -> RecordKey {
    RecordKey {
        school_id: "041".into(),
        date: date(5),
        meal_type: MealType::Lunch,
        category: Category::Free,
        item_id: "Pizza".into(),
    }
}

const MILK: [&str; 9] = [
    "Lane ES", "2023-09-05", "Breakfast", "Free", "Milk", "120", "100", "$0.45", "8",
];

fn pizza(served: &'static str, cost: &'static str) -> [&'static str; 9] {
    [
        "Lane ES", "09/05/2023", "Lunch", "Free", "Pizza", served, "110", cost, "4",
    ]
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn lane_breakfast_row_becomes_canonical_record() {
    let docs = vec![RawDocument::html("daily.html", report(&[MILK]))];
    let out = run_documents(docs, &config()).await.unwrap();

    assert_eq!(out.dataset.len(), 1);
    let r = &out.dataset.records()[0];
    assert_eq!(r.school_id, "041");
    assert_eq!(r.date, date(5));
    assert_eq!(r.meal_type, MealType::Breakfast);
    assert_eq!(r.category, Category::Free);
    assert_eq!(r.item_id, "Milk");
    assert_eq!((r.served_qty, r.planned_qty, r.unit_cost, r.waste_qty), (120, 100, 45, 8));

    let metrics = out.dataset.metrics();
    let deviation = metrics.deviation(&Filter::all(), GroupBy::All);
    assert!((deviation[0].value.unwrap() - 0.20).abs() < 1e-9);
    let waste = metrics.waste_rate(&Filter::all(), GroupBy::Region);
    assert_eq!(waste[0].group, GroupKey::Region("Region 3".into()));
    assert!((waste[0].value.unwrap() - 0.08).abs() < 1e-9);
}

#[tokio::test]
async fn document_without_rows_is_skipped_and_the_rest_merge() {
    let docs = vec![
        RawDocument::html("notice.html", "<h1>Kitchen closed</h1><p>No service.</p>"),
        RawDocument::html("daily.html", report(&[MILK])),
        RawDocument::html(
            "headers-only.html",
            format!("<table>{HEADER}<tr><td>Total</td><td></td><td></td><td></td><td></td><td>0</td><td>0</td><td></td><td>0</td></tr></table>"),
        ),
    ];
    let out = run_documents(docs, &config()).await.unwrap();

    assert_eq!(out.dataset.len(), 1);
    assert_eq!(out.summary.documents_total, 3);
    assert_eq!(out.summary.documents_failed, 2);
    let skipped: Vec<&str> = out
        .summary
        .issues
        .iter()
        .filter_map(|i| match i {
            Issue::NoDataExtracted { document, .. } => Some(document.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["notice.html", "headers-only.html"]);
}

#[tokio::test]
async fn unknown_school_row_is_rejected_and_counted() {
    let mut stray = MILK;
    stray[0] = "Nowhere Academy";
    let docs = vec![RawDocument::html("daily.html", report(&[MILK, stray]))];
    let out = run_documents(docs, &config()).await.unwrap();

    assert_eq!(out.dataset.len(), 1);
    assert_eq!(out.summary.rows_rejected, 1);
    assert!(out
        .summary
        .issues
        .iter()
        .any(|i| i.kind() == "schema_mapping_error"));
}

// ── Reconciliation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_reports_with_matching_cost_are_summed() {
    let docs = vec![
        RawDocument::html("sales.html", report(&[pizza("100", "$1.25")])),
        RawDocument::html("production.html", report(&[pizza("30", "1.25")])),
    ];
    let out = run_documents(docs, &config()).await.unwrap();

    assert_eq!(out.dataset.len(), 1);
    let r = out.dataset.get(&pizza_key()).unwrap();
    assert_eq!((r.served_qty, r.planned_qty, r.waste_qty), (130, 220, 8));
    assert_eq!(r.unit_cost, 125);
    assert_eq!(out.reconciliation.summed, 1);
}

#[tokio::test]
async fn reissued_report_for_the_same_period_overrides() {
    let period = ReportPeriod::day(date(5));
    let docs = vec![
        RawDocument::html("lunch-v1.html", report(&[pizza("100", "$1.25")])).with_period(period),
        RawDocument::html("lunch-v2.html", report(&[pizza("90", "$1.25")])).with_period(period),
    ];
    let out = run_documents(docs, &config()).await.unwrap();

    let r = out.dataset.get(&pizza_key()).unwrap();
    assert_eq!(r.served_qty, 90);
    assert_eq!(out.reconciliation.overridden, 1);
    assert_eq!(out.reconciliation.overrides[0].by, "lunch-v2.html");
}

#[tokio::test]
async fn cost_conflict_is_held_back_from_aggregates() {
    let docs = vec![
        RawDocument::html("sales.html", report(&[pizza("100", "$1.25"), MILK])),
        RawDocument::html("production.html", report(&[pizza("30", "$1.50")])),
    ];
    let out = run_documents(docs, &config()).await.unwrap();

    assert!(out.dataset.get(&pizza_key()).is_none());
    assert_eq!(out.dataset.len(), 1);
    assert_eq!(out.reconciliation.conflicting, 1);
    let conflict = out
        .summary
        .issues
        .iter()
        .find(|i| i.kind() == "cost_conflict")
        .unwrap();
    match conflict {
        Issue::CostConflict { sources, unit_costs, .. } => {
            assert_eq!(sources, &vec!["sales.html".to_string(), "production.html".to_string()]);
            assert_eq!(unit_costs, &vec![Some(125), Some(150)]);
        }
        other => panic!("unexpected issue {other:?}"),
    }

    // Only the milk record contributes: 45¢ × 120.
    let total = out.dataset.metrics().total_cost(&Filter::all(), GroupBy::All);
    assert_eq!(total[0].value, Some(5400.0));
}

#[tokio::test]
async fn unparsable_cost_rejects_the_row() {
    let docs = vec![RawDocument::html("sales.html", report(&[pizza("100", "N/A"), MILK]))];
    let out = run_documents(docs, &config()).await.unwrap();

    assert!(out.dataset.get(&pizza_key()).is_none());
    assert_eq!(out.dataset.len(), 1);
    assert_eq!(out.summary.rows_rejected, 1);
    let total = out.dataset.metrics().total_cost(&Filter::all(), GroupBy::All);
    assert_eq!(total[0].value, Some(5400.0));
}

#[tokio::test]
async fn report_without_cost_column_does_not_conflict() {
    let production = "<h1>Production Record</h1><table>\
        <tr><th>School</th><th>Date</th><th>Meal</th><th>Category</th><th>Item</th><th>Served</th></tr>\
        <tr><td>Lane ES</td><td>2023-09-05</td><td>Lunch</td><td>Free</td><td>Pizza</td><td>30</td></tr>\
        </table>";
    let docs = vec![
        RawDocument::html("sales.html", report(&[pizza("100", "$1.25")])),
        RawDocument::html("production.html", production),
    ];
    let out = run_documents(docs, &config()).await.unwrap();

    assert_eq!(out.reconciliation.conflicting, 0);
    let r = out.dataset.get(&pizza_key()).unwrap();
    assert_eq!((r.served_qty, r.unit_cost), (130, 125));
}

#[tokio::test]
async fn resolved_conflict_uses_the_agreed_cost() {
    let config = PipelineConfig::builder()
        .schools(directory())
        .resolve_cost(pizza_key(), 140)
        .build()
        .unwrap();
    let docs = vec![
        RawDocument::html("sales.html", report(&[pizza("100", "$1.25")])),
        RawDocument::html("production.html", report(&[pizza("30", "$1.50")])),
    ];
    let out = run_documents(docs, &config).await.unwrap();

    let r = out.dataset.get(&pizza_key()).unwrap();
    assert_eq!((r.served_qty, r.unit_cost), (130, 140));
    assert_eq!(out.reconciliation.resolved, 1);
    assert!(out.summary.issues.iter().all(|i| i.kind() != "cost_conflict"));
}

#[tokio::test]
async fn rerun_on_unchanged_input_is_identical() {
    let docs = || {
        vec![
            RawDocument::html("a.html", report(&[pizza("100", "$1.25"), MILK])),
            RawDocument::html("b.html", report(&[pizza("30", "$1.25")])),
            RawDocument::html("c.html", report(&[pizza("5", "$2.00")])),
        ]
    };
    let config = PipelineConfig::builder()
        .schools(directory())
        .concurrency(3)
        .build()
        .unwrap();
    let first = run_documents(docs(), &config).await.unwrap();
    let second = run_documents(docs(), &config).await.unwrap();

    assert_eq!(first.dataset.records(), second.dataset.records());
    assert_eq!(first.reconciliation, second.reconciliation);
    assert_eq!(first.summary.issues, second.summary.issues);
    assert_eq!(
        dataset_to_string(&first.dataset, ','),
        dataset_to_string(&second.dataset, ',')
    );
}

// ── Metrics over a run ───────────────────────────────────────────────────────

#[tokio::test]
async fn proportions_and_trends_over_a_week() {
    let rows = [
        ["Lane ES", "2023-09-04", "Lunch", "Free", "Pizza", "40", "50", "1.25", "5"],
        ["Lane ES", "2023-09-05", "Lunch", "Free", "Pizza", "60", "50", "1.25", "0"],
        ["Washington MS", "2023-09-04", "Lunch", "Paid", "Pizza", "100", "90", "2.50", "2"],
    ];
    let out = run_documents(vec![RawDocument::html("week.html", report(&rows))], &config())
        .await
        .unwrap();
    let metrics = out.dataset.metrics();

    let shares = metrics.sales_proportion(&Filter::all(), GroupBy::School);
    let total: f64 = shares.iter().filter_map(|r| r.value).sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert_eq!(shares[0].group, GroupKey::School("041".into()));
    assert!((shares[0].value.unwrap() - 0.5).abs() < 1e-9);

    let lane = Filter::all().school("041");
    let variation = metrics.daily_variation(&lane, GroupBy::All);
    assert!((variation[0].value.unwrap() - 10.0).abs() < 1e-9);

    let weekdays = metrics.trend(&Filter::all(), TrendPeriod::Weekday, Measure::Served);
    let series: Vec<(String, f64)> = weekdays
        .iter()
        .map(|p| (p.period.to_string(), p.value))
        .collect();
    assert_eq!(
        series,
        vec![("Monday".to_string(), 140.0), ("Tuesday".to_string(), 60.0)]
    );

    let none = Filter::all().between(date(20), date(30));
    assert_eq!(metrics.waste_rate(&none, GroupBy::All)[0].value, None);
}

// ── Directory input ──────────────────────────────────────────────────────────

#[tokio::test]
async fn directory_run_writes_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("breakfast_2023-09-05.html"), report(&[MILK])).unwrap();
    std::fs::write(
        dir.path().join("lunch_2023-09-05.html"),
        report(&[pizza("100", "$1.25")]),
    )
    .unwrap();
    std::fs::write(dir.path().join("README.txt"), "not a report").unwrap();

    let out = run(dir.path(), &config()).await.unwrap();
    assert_eq!(out.summary.documents_total, 2);
    assert_eq!(out.dataset.len(), 2);
    assert_eq!(out.documents[0].document, "breakfast_2023-09-05.html");

    let path = dir.path().join("out").join("dataset.csv");
    write_dataset_file(&out.dataset, &path, ',').await.unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "school_id,date,meal_type,category,item_id,served_qty,planned_qty,unit_cost,waste_qty\n\
         041,2023-09-05,breakfast,Free,Milk,120,100,0.45,8\n\
         041,2023-09-05,lunch,Free,Pizza,100,110,1.25,4\n"
    );
}

#[tokio::test]
async fn different_reports_for_the_same_day_sum() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sales_2023-09-05.html"),
        report(&[pizza("100", "$1.25")]),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("production_2023-09-05.html"),
        report(&[pizza("30", "$1.25")]),
    )
    .unwrap();

    let out = run(dir.path(), &config()).await.unwrap();
    let r = out.dataset.get(&pizza_key()).unwrap();
    assert_eq!(r.served_qty, 130);
    assert_eq!((out.reconciliation.summed, out.reconciliation.overridden), (1, 0));
}

#[tokio::test]
async fn reissued_file_for_the_same_day_overrides() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sales_2023-09-05.html"),
        report(&[pizza("100", "$1.25")]),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("sales_2023-09-05_v2.html"),
        report(&[pizza("95", "$1.25")]),
    )
    .unwrap();

    let out = run(dir.path(), &config()).await.unwrap();
    assert_eq!(out.dataset.get(&pizza_key()).unwrap().served_qty, 95);
    assert_eq!(out.reconciliation.overridden, 1);
}

#[tokio::test]
async fn missing_input_directory_is_fatal() {
    let err = run("/definitely/not/here", &config()).await.unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here"));
}
