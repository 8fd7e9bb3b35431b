//! Merge engine: reconcile records from overlapping documents into one
//! deduplicated [`Dataset`].
//!
//! Records are folded in ingestion order, one key at a time:
//!
//! * quantities from different reports **sum** (a weekly and a daily report
//!   for different sites of the same kitchen),
//! * unless the incoming report covers the **same reporting period** as an
//!   earlier one (the same document ingested again, or the same report
//!   stream with an identical explicit period). A re-issued report replaces
//!   the earlier numbers; a sales and a production report for one day sum.
//! * unit costs must agree within the tolerance across every contribution
//!   that reported one; otherwise the key becomes a [`CostConflict`] and
//!   stays out of the dataset until a resolution supplies the agreed cost.
//!
//! [`reconcile`] is the pure per-key step; [`merge`] drives it.

use crate::config::CostResolutions;
use crate::error::Issue;
use crate::metrics::Metrics;
use crate::model::{Cents, MealRecord, RecordKey, SourceRef, SourcedRecord};
use crate::schools::SchoolDirectory;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Per-key state ────────────────────────────────────────────────────────────

/// One source's measures for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub source: SourceRef,
    pub served_qty: u64,
    pub planned_qty: u64,
    pub waste_qty: u64,
    /// `None` when the source had no cost column.
    pub unit_cost: Option<Cents>,
}

impl Contribution {
    pub fn from_record(record: &SourcedRecord) -> Self {
        Self {
            source: record.source.clone(),
            served_qty: record.record.served_qty,
            planned_qty: record.record.planned_qty,
            waste_qty: record.record.waste_qty,
            unit_cost: record.cost_reported.then_some(record.record.unit_cost),
        }
    }
}

/// Every surviving contribution for one key, in ingestion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEntry {
    pub key: RecordKey,
    pub contributions: Vec<Contribution>,
}

impl MergeEntry {
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            contributions: Vec::new(),
        }
    }

    /// Build the merged record at a given unit cost.
    pub fn to_record(&self, unit_cost: Cents) -> MealRecord {
        let sum = |f: fn(&Contribution) -> u64| -> u64 { self.contributions.iter().map(f).sum() };
        MealRecord {
            school_id: self.key.school_id.clone(),
            date: self.key.date,
            meal_type: self.key.meal_type,
            category: self.key.category,
            item_id: self.key.item_id.clone(),
            served_qty: sum(|c| c.served_qty),
            planned_qty: sum(|c| c.planned_qty),
            unit_cost,
            waste_qty: sum(|c| c.waste_qty),
        }
    }
}

/// How the incoming quantities were combined with the existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityPolicy {
    /// First contribution for the key.
    Insert,
    /// Added to the existing contributions.
    Sum,
    /// Replaced contributions from the same reporting period.
    Override,
}

/// Result of folding one record into a key's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub entry: MergeEntry,
    pub policy: QuantityPolicy,
    /// Sources whose contributions were dropped by an override.
    pub replaced: Vec<SourceRef>,
    /// Agreed unit cost across the entry, `None` on disagreement.
    pub agreed_cost: Option<Cents>,
}

/// True when `incoming` re-reports the period `existing` covered: the same
/// document ingested again, or a document of the same report stream with an
/// identical explicit period. Contributions from one ingested document never
/// replace each other.
pub fn same_reporting_period(existing: &SourceRef, incoming: &SourceRef) -> bool {
    if existing.seq == incoming.seq {
        return false;
    }
    existing.document_id == incoming.document_id
        || (existing.period.is_some()
            && existing.period == incoming.period
            && existing.stream == incoming.stream)
}

/// Unit cost shared by all contributions that reported one, within
/// `tolerance` cents; the earliest reported cost is kept. With no reported
/// cost at all the key costs 0.
pub fn agreed_cost(contributions: &[Contribution], tolerance: Cents) -> Option<Cents> {
    let mut costs = contributions.iter().filter_map(|c| c.unit_cost);
    let Some(first) = costs.next() else {
        return Some(0);
    };
    let (min, max) = costs.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c)));
    (max - min <= tolerance).then_some(first)
}

/// Fold one incoming record into the existing entry for its key.
pub fn reconcile(
    existing: Option<&MergeEntry>,
    incoming: &SourcedRecord,
    tolerance: Cents,
) -> Reconciliation {
    let mut entry = existing
        .cloned()
        .unwrap_or_else(|| MergeEntry::new(incoming.record.key()));

    let (kept, dropped): (Vec<Contribution>, Vec<Contribution>) = entry
        .contributions
        .into_iter()
        .partition(|c| !same_reporting_period(&c.source, &incoming.source));

    let policy = if !dropped.is_empty() {
        QuantityPolicy::Override
    } else if kept.is_empty() {
        QuantityPolicy::Insert
    } else {
        QuantityPolicy::Sum
    };

    let mut replaced: Vec<SourceRef> = Vec::new();
    for c in dropped {
        if !replaced.contains(&c.source) {
            replaced.push(c.source);
        }
    }

    entry.contributions = kept;
    entry.contributions.push(Contribution::from_record(incoming));
    let agreed_cost = agreed_cost(&entry.contributions, tolerance);

    Reconciliation {
        entry,
        policy,
        replaced,
        agreed_cost,
    }
}

// ── Report types ─────────────────────────────────────────────────────────────

/// A later report replaced an earlier one for the same period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverrideEvent {
    pub key: RecordKey,
    pub replaced: Vec<String>,
    pub by: String,
}

/// Sources disagree on the unit cost of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostConflict {
    pub key: RecordKey,
    /// Every contributing source, in ingestion order.
    pub sources: Vec<Contribution>,
}

impl CostConflict {
    /// The merged record at a manually agreed unit cost.
    pub fn resolve(&self, unit_cost: Cents) -> MealRecord {
        MergeEntry {
            key: self.key.clone(),
            contributions: self.sources.clone(),
        }
        .to_record(unit_cost)
    }

    pub fn to_issue(&self) -> Issue {
        Issue::CostConflict {
            key: self.key.to_string(),
            sources: self.sources.iter().map(|c| c.source.document_id.clone()).collect(),
            unit_costs: self.sources.iter().map(|c| c.unit_cost).collect(),
        }
    }
}

/// What the merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub input_records: usize,
    pub output_records: usize,
    /// Incoming records added to an existing key.
    pub summed: usize,
    /// Incoming records that replaced a same-period report.
    pub overridden: usize,
    /// Keys held back because of an unresolved cost conflict.
    pub conflicting: usize,
    /// Conflicting keys settled by the resolution table.
    pub resolved: usize,
    pub overrides: Vec<OverrideEvent>,
    pub conflicts: Vec<CostConflict>,
}

impl ReconciliationReport {
    /// Conflicts as run issues.
    pub fn issues(&self) -> Vec<Issue> {
        self.conflicts.iter().map(CostConflict::to_issue).collect()
    }
}

// ── Dataset ──────────────────────────────────────────────────────────────────

/// The finalised canonical dataset: records unique per key, sorted by key,
/// immutable. Metric queries borrow it.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Vec<MealRecord>,
    schools: Arc<SchoolDirectory>,
}

impl Dataset {
    /// Build a dataset from records that already have unique keys.
    pub fn new(mut records: Vec<MealRecord>, schools: Arc<SchoolDirectory>) -> Self {
        records.sort_by_key(MealRecord::key);
        Self { records, schools }
    }

    pub fn records(&self) -> &[MealRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&MealRecord> {
        self.records
            .binary_search_by(|r| r.key().cmp(key))
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn schools(&self) -> &SchoolDirectory {
        &self.schools
    }

    /// Query interface over this dataset.
    pub fn metrics(&self) -> Metrics<'_> {
        Metrics::new(self)
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Merge all normalised records into a dataset.
///
/// Records are processed in ingestion order (`source.seq`, stable within a
/// document). The result is identical for identical input.
pub fn merge(
    mut records: Vec<SourcedRecord>,
    tolerance: Cents,
    resolutions: &CostResolutions,
    schools: Arc<SchoolDirectory>,
) -> (Dataset, ReconciliationReport) {
    records.sort_by_key(|r| r.source.seq);

    let mut report = ReconciliationReport {
        input_records: records.len(),
        ..ReconciliationReport::default()
    };
    let mut entries: BTreeMap<RecordKey, (MergeEntry, Option<Cents>)> = BTreeMap::new();

    for incoming in &records {
        let key = incoming.record.key();
        let existing = entries.get(&key).map(|(entry, _)| entry);
        let step = reconcile(existing, incoming, tolerance);
        match step.policy {
            QuantityPolicy::Insert => {}
            QuantityPolicy::Sum => report.summed += 1,
            QuantityPolicy::Override => {
                report.overridden += 1;
                let event = OverrideEvent {
                    key: key.clone(),
                    replaced: step.replaced.iter().map(|s| s.document_id.clone()).collect(),
                    by: incoming.source.document_id.clone(),
                };
                debug!(key = %key, replaced = ?event.replaced, by = %event.by, "duplicate overridden");
                report.overrides.push(event);
            }
        }
        entries.insert(key, (step.entry, step.agreed_cost));
    }

    let mut output = Vec::with_capacity(entries.len());
    for (key, (entry, agreed)) in entries {
        match agreed {
            Some(cost) => output.push(entry.to_record(cost)),
            None => {
                let conflict = CostConflict {
                    key,
                    sources: entry.contributions,
                };
                if let Some(&cost) = resolutions.get(&conflict.key) {
                    debug!(key = %conflict.key, cost, "cost conflict resolved");
                    report.resolved += 1;
                    output.push(conflict.resolve(cost));
                } else {
                    warn!("{}", conflict.to_issue());
                    report.conflicting += 1;
                    report.conflicts.push(conflict);
                }
            }
        }
    }

    report.output_records = output.len();
    info!(
        input = report.input_records,
        output = report.output_records,
        summed = report.summed,
        overridden = report.overridden,
        conflicts = report.conflicting,
        "merge complete"
    );
    (Dataset::new(output, schools), report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{report_stream, Category, MealType, ReportPeriod, SourceType};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 9, d).unwrap()
    }

    fn source(doc: &str, seq: usize, period: Option<ReportPeriod>) -> SourceRef {
        SourceRef {
            document_id: doc.into(),
            seq,
            source_type: SourceType::Html,
            stream: report_stream(doc),
            period,
        }
    }

    fn rec(src: SourceRef, served: u64, cost: Cents) -> SourcedRecord {
        SourcedRecord {
            record: MealRecord {
                school_id: "041".into(),
                date: day(5),
                meal_type: MealType::Lunch,
                category: Category::Free,
                item_id: "Pizza".into(),
                served_qty: served,
                planned_qty: served + 10,
                unit_cost: cost,
                waste_qty: 1,
            },
            source: src,
            cost_reported: true,
        }
    }

    fn run(records: Vec<SourcedRecord>) -> (Dataset, ReconciliationReport) {
        merge(records, 1, &CostResolutions::new(), Arc::default())
    }

    #[test]
    fn overlapping_sources_with_matching_cost_are_summed() {
        let (ds, report) = run(vec![
            rec(source("a.html", 0, None), 100, 125),
            rec(source("b.pdf", 1, None), 30, 125),
        ]);
        assert_eq!(ds.len(), 1);
        let r = &ds.records()[0];
        assert_eq!((r.served_qty, r.planned_qty, r.waste_qty), (130, 150, 2));
        assert_eq!(report.summed, 1);
        assert_eq!(report.output_records, 1);
    }

    #[test]
    fn same_period_from_later_document_overrides() {
        let p = Some(ReportPeriod::day(day(5)));
        let (ds, report) = run(vec![
            rec(source("lunch_v1.html", 0, p), 100, 125),
            rec(source("lunch_v2.html", 1, p), 90, 125),
        ]);
        assert_eq!(ds.records()[0].served_qty, 90);
        assert_eq!(report.overridden, 1);
        assert_eq!(report.overrides[0].replaced, vec!["lunch_v1.html".to_string()]);
        assert_eq!(report.overrides[0].by, "lunch_v2.html");
    }

    #[test]
    fn same_period_from_another_report_stream_sums() {
        let p = Some(ReportPeriod::day(day(5)));
        let (ds, report) = run(vec![
            rec(source("sales_2023-09-05.html", 0, p), 100, 125),
            rec(source("production_2023-09-05.html", 1, p), 30, 125),
        ]);
        assert_eq!(ds.records()[0].served_qty, 130);
        assert_eq!((report.summed, report.overridden), (1, 0));
    }

    #[test]
    fn unreported_cost_takes_no_part_in_agreement() {
        let mut no_cost = rec(source("production", 1, None), 30, 0);
        no_cost.cost_reported = false;
        let (ds, report) = run(vec![rec(source("sales", 0, None), 100, 125), no_cost.clone()]);
        assert!(report.conflicts.is_empty());
        assert_eq!((ds.records()[0].served_qty, ds.records()[0].unit_cost), (130, 125));

        let (ds, _) = run(vec![no_cost]);
        assert_eq!(ds.records()[0].unit_cost, 0);
    }

    #[test]
    fn rows_of_one_document_sum_and_reingest_overrides() {
        let (ds, report) = run(vec![
            rec(source("a.html", 0, None), 10, 125),
            rec(source("a.html", 0, None), 5, 125),
            rec(source("a.html", 3, None), 7, 125),
        ]);
        assert_eq!(ds.records()[0].served_qty, 7);
        assert_eq!((report.summed, report.overridden), (1, 1));
    }

    #[test]
    fn costs_within_tolerance_keep_first_cost() {
        let (ds, report) = run(vec![
            rec(source("a", 0, None), 1, 125),
            rec(source("b", 1, None), 1, 126),
        ]);
        assert_eq!(ds.records()[0].unit_cost, 125);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn multi_way_conflict_lists_every_source_and_excludes_record() {
        let (ds, report) = run(vec![
            rec(source("a", 0, None), 1, 125),
            rec(source("b", 1, None), 1, 150),
            rec(source("c", 2, None), 1, 125),
        ]);
        assert!(ds.is_empty());
        assert_eq!(report.conflicting, 1);
        let issue = report.conflicts[0].to_issue();
        assert_eq!(
            issue,
            Issue::CostConflict {
                key: "041/2023-09-05/lunch/Free/Pizza".into(),
                sources: vec!["a".into(), "b".into(), "c".into()],
                unit_costs: vec![Some(125), Some(150), Some(125)],
            }
        );
        let resolved = report.conflicts[0].resolve(130);
        assert_eq!((resolved.served_qty, resolved.unit_cost), (3, 130));
    }

    #[test]
    fn resolution_table_settles_conflicts() {
        let records = vec![
            rec(source("a", 0, None), 1, 125),
            rec(source("b", 1, None), 1, 150),
        ];
        let key = records[0].record.key();
        let mut resolutions = CostResolutions::new();
        resolutions.insert(key.clone(), 140);
        let (ds, report) = merge(records, 1, &resolutions, Arc::default());
        assert_eq!(ds.get(&key).map(|r| r.unit_cost), Some(140));
        assert_eq!((report.resolved, report.conflicting), (1, 0));
    }

    #[test]
    fn override_clears_an_earlier_conflict() {
        let p = Some(ReportPeriod::day(day(5)));
        let (ds, report) = run(vec![
            rec(source("lunch_v1", 0, p), 1, 100),
            rec(source("other", 1, None), 1, 125),
            rec(source("lunch_v2", 2, p), 1, 125),
        ]);
        assert_eq!(ds.len(), 1);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn reconcile_is_pure() {
        let first = reconcile(None, &rec(source("a", 0, None), 4, 125), 1);
        assert_eq!(first.policy, QuantityPolicy::Insert);
        let before = first.entry.clone();
        let second = reconcile(Some(&first.entry), &rec(source("b", 1, None), 6, 200), 1);
        assert_eq!(first.entry, before);
        assert_eq!(second.policy, QuantityPolicy::Sum);
        assert_eq!(second.agreed_cost, None);
        assert_eq!(second.entry.contributions.len(), 2);
    }

    #[test]
    fn merge_is_deterministic() {
        let input = || {
            vec![
                rec(source("b", 1, None), 2, 125),
                rec(source("a", 0, None), 1, 125),
            ]
        };
        let (d1, r1) = run(input());
        let (d2, r2) = run(input());
        assert_eq!(d1.records(), d2.records());
        assert_eq!(r1, r2);
    }
}
