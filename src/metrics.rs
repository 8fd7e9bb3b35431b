//! Metrics engine: stateless aggregates over a finalised [`Dataset`].
//!
//! Every query takes a [`Filter`] and a [`GroupBy`] dimension and recomputes
//! from the dataset; nothing is cached between calls. Results come back in
//! group order (schools by id, dates chronologically, weekdays Monday first).
//! A metric whose denominator is zero is reported as `None`, never as 0 or
//! NaN.
//!
//! ```rust
//! use schoolmeal_metrics::metrics::{Filter, GroupBy};
//! use schoolmeal_metrics::Dataset;
//!
//! let dataset = Dataset::default();
//! let results = dataset.metrics().waste_rate(&Filter::all(), GroupBy::All);
//! assert_eq!(results[0].value, None);
//! ```

use crate::model::{Category, MealRecord, MealType};
use crate::pipeline::merge::Dataset;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Region label for schools without one in the reference table.
pub const UNASSIGNED_REGION: &str = "unassigned";

// ── Filter ───────────────────────────────────────────────────────────────────

/// Record selection. Empty sets and `None` bounds match everything; date
/// bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub schools: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meal_type: Option<MealType>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<Category>,
}

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn school(mut self, id: impl Into<String>) -> Self {
        self.schools.insert(id.into());
        self
    }

    pub fn schools<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schools.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, date: NaiveDate) -> Self {
        self.from = Some(date);
        self
    }

    pub fn until(mut self, date: NaiveDate) -> Self {
        self.to = Some(date);
        self
    }

    pub fn between(self, from: NaiveDate, to: NaiveDate) -> Self {
        self.since(from.min(to)).until(from.max(to))
    }

    pub fn meal_type(mut self, meal: MealType) -> Self {
        self.meal_type = Some(meal);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn matches(&self, r: &MealRecord) -> bool {
        (self.schools.is_empty() || self.schools.contains(&r.school_id))
            && self.from.is_none_or(|d| r.date >= d)
            && self.to.is_none_or(|d| r.date <= d)
            && self.meal_type.is_none_or(|m| r.meal_type == m)
            && (self.categories.is_empty() || self.categories.contains(&r.category))
    }
}

// ── Grouping ─────────────────────────────────────────────────────────────────

/// Grouping dimension of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    All,
    School,
    Region,
    MealType,
    Category,
    Item,
    Date,
    Month,
    Weekday,
}

impl GroupBy {
    pub const ALL: [GroupBy; 9] = [
        GroupBy::All,
        GroupBy::School,
        GroupBy::Region,
        GroupBy::MealType,
        GroupBy::Category,
        GroupBy::Item,
        GroupBy::Date,
        GroupBy::Month,
        GroupBy::Weekday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::All => "all",
            GroupBy::School => "school",
            GroupBy::Region => "region",
            GroupBy::MealType => "meal",
            GroupBy::Category => "category",
            GroupBy::Item => "item",
            GroupBy::Date => "date",
            GroupBy::Month => "month",
            GroupBy::Weekday => "weekday",
        }
    }
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let s = match s.as_str() {
            "meal_type" | "meal-type" => "meal",
            "day" => "date",
            other => other,
        };
        GroupBy::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| format!("unknown grouping '{s}'"))
    }
}

/// Day of week ordered Monday → Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for DayOfWeek {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Value of the grouping dimension for one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    All,
    School(String),
    Region(String),
    MealType(MealType),
    Category(Category),
    Item(String),
    Date(NaiveDate),
    Month { year: i32, month: u32 },
    Weekday(DayOfWeek),
}

impl GroupKey {
    fn of(record: &MealRecord, group_by: GroupBy, dataset: &Dataset) -> Self {
        match group_by {
            GroupBy::All => GroupKey::All,
            GroupBy::School => GroupKey::School(record.school_id.clone()),
            GroupBy::Region => GroupKey::Region(
                dataset
                    .schools()
                    .region_of(&record.school_id)
                    .unwrap_or(UNASSIGNED_REGION)
                    .to_string(),
            ),
            GroupBy::MealType => GroupKey::MealType(record.meal_type),
            GroupBy::Category => GroupKey::Category(record.category),
            GroupBy::Item => GroupKey::Item(record.item_id.clone()),
            GroupBy::Date => GroupKey::Date(record.date),
            GroupBy::Month => GroupKey::Month {
                year: record.date.year(),
                month: record.date.month(),
            },
            GroupBy::Weekday => GroupKey::Weekday(record.date.weekday().into()),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::All => f.write_str("all"),
            GroupKey::School(s) | GroupKey::Region(s) | GroupKey::Item(s) => f.write_str(s),
            GroupKey::MealType(m) => write!(f, "{m}"),
            GroupKey::Category(c) => write!(f, "{c}"),
            GroupKey::Date(d) => write!(f, "{d}"),
            GroupKey::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            GroupKey::Weekday(d) => write!(f, "{d}"),
        }
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Metric computed by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Σ(unit cost × served), cents.
    TotalCost,
    /// Mean of unit cost × served per record, cents.
    AverageCost,
    /// Σwaste / Σplanned.
    WasteRate,
    /// (Σactual cost − Σplanned cost) / Σplanned cost.
    Deviation,
    /// Group Σserved / filter Σserved.
    SalesProportion,
    /// Population standard deviation of daily Σserved.
    DailyVariation,
    /// Σserved.
    ServedTotal,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::TotalCost,
        MetricKind::AverageCost,
        MetricKind::WasteRate,
        MetricKind::Deviation,
        MetricKind::SalesProportion,
        MetricKind::DailyVariation,
        MetricKind::ServedTotal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::TotalCost => "total_cost",
            MetricKind::AverageCost => "average_cost",
            MetricKind::WasteRate => "waste_rate",
            MetricKind::Deviation => "deviation",
            MetricKind::SalesProportion => "sales_proportion",
            MetricKind::DailyVariation => "daily_variation",
            MetricKind::ServedTotal => "served_total",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase().replace('-', "_");
        let s = match s.as_str() {
            "consistency" => "daily_variation",
            "proportion" => "sales_proportion",
            "served" => "served_total",
            other => other,
        }
        .to_string();
        MetricKind::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

/// One value of a metric for one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub group: GroupKey,
    pub metric: MetricKind,
    /// `None` when the metric is undefined for the group (zero denominator,
    /// no data).
    pub value: Option<f64>,
    pub filter: Filter,
}

/// A metric was undefined for its group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{metric} is undefined for group '{group}'")]
pub struct NullMetric {
    pub metric: MetricKind,
    pub group: String,
}

impl MetricResult {
    pub fn try_value(&self) -> Result<f64, NullMetric> {
        self.value.ok_or_else(|| NullMetric {
            metric: self.metric,
            group: self.group.to_string(),
        })
    }
}

/// Period granularity of a trend series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendPeriod {
    Daily,
    Monthly,
    Weekday,
}

impl TrendPeriod {
    fn group_by(self) -> GroupBy {
        match self {
            TrendPeriod::Daily => GroupBy::Date,
            TrendPeriod::Monthly => GroupBy::Month,
            TrendPeriod::Weekday => GroupBy::Weekday,
        }
    }
}

impl FromStr for TrendPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(TrendPeriod::Daily),
            "monthly" | "month" => Ok(TrendPeriod::Monthly),
            "weekday" | "weekly" => Ok(TrendPeriod::Weekday),
            other => Err(format!("unknown trend period '{other}'")),
        }
    }
}

/// Quantity summed by a trend series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Served,
    Planned,
    Waste,
    /// Actual cost in cents.
    Cost,
}

impl Measure {
    fn of(self, r: &MealRecord) -> i128 {
        match self {
            Measure::Served => i128::from(r.served_qty),
            Measure::Planned => i128::from(r.planned_qty),
            Measure::Waste => i128::from(r.waste_qty),
            Measure::Cost => i128::from(r.actual_cost()),
        }
    }
}

impl FromStr for Measure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "served" => Ok(Measure::Served),
            "planned" => Ok(Measure::Planned),
            "waste" => Ok(Measure::Waste),
            "cost" => Ok(Measure::Cost),
            other => Err(format!("unknown measure '{other}'")),
        }
    }
}

/// One point of a trend series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub period: GroupKey,
    pub value: f64,
}

// ── Queries ──────────────────────────────────────────────────────────────────

/// Borrowing query interface; see [`Dataset::metrics`].
#[derive(Debug, Clone, Copy)]
pub struct Metrics<'a> {
    dataset: &'a Dataset,
}

type Groups<'a> = BTreeMap<GroupKey, Vec<&'a MealRecord>>;

impl<'a> Metrics<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self { dataset }
    }

    /// Dispatch by metric kind.
    pub fn query(&self, metric: MetricKind, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        match metric {
            MetricKind::TotalCost => self.total_cost(filter, group_by),
            MetricKind::AverageCost => self.average_cost(filter, group_by),
            MetricKind::WasteRate => self.waste_rate(filter, group_by),
            MetricKind::Deviation => self.deviation(filter, group_by),
            MetricKind::SalesProportion => self.sales_proportion(filter, group_by),
            MetricKind::DailyVariation => self.daily_variation(filter, group_by),
            MetricKind::ServedTotal => self.served_total(filter, group_by),
        }
    }

    pub fn total_cost(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::TotalCost, |records| {
            Some(sum(records, |r| i128::from(r.actual_cost())) as f64)
        })
    }

    pub fn average_cost(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::AverageCost, |records| {
            (!records.is_empty())
                .then(|| sum(records, |r| i128::from(r.actual_cost())) as f64 / records.len() as f64)
        })
    }

    pub fn waste_rate(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::WasteRate, |records| {
            ratio(
                sum(records, |r| i128::from(r.waste_qty)),
                sum(records, |r| i128::from(r.planned_qty)),
            )
        })
    }

    pub fn deviation(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::Deviation, |records| {
            let actual = sum(records, |r| i128::from(r.actual_cost()));
            let planned = sum(records, |r| i128::from(r.planned_cost()));
            ratio(actual - planned, planned)
        })
    }

    /// Share of the filter's total served per group. Sums to 1 across
    /// groups whenever anything was served.
    pub fn sales_proportion(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        let total: i128 = self
            .dataset
            .records()
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| i128::from(r.served_qty))
            .sum();
        self.per_group(filter, group_by, MetricKind::SalesProportion, |records| {
            ratio(sum(records, |r| i128::from(r.served_qty)), total)
        })
    }

    /// Population standard deviation of daily total served, over the days
    /// present in each group.
    pub fn daily_variation(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::DailyVariation, |records| {
            let mut daily: BTreeMap<NaiveDate, u64> = BTreeMap::new();
            for r in records {
                *daily.entry(r.date).or_default() += r.served_qty;
            }
            population_std_dev(daily.values().map(|&v| v as f64))
        })
    }

    pub fn served_total(&self, filter: &Filter, group_by: GroupBy) -> Vec<MetricResult> {
        self.per_group(filter, group_by, MetricKind::ServedTotal, |records| {
            Some(sum(records, |r| i128::from(r.served_qty)) as f64)
        })
    }

    /// Period sums of a measure in chronological order (weekday series run
    /// Monday → Sunday).
    pub fn trend(&self, filter: &Filter, period: TrendPeriod, measure: Measure) -> Vec<TrendPoint> {
        self.groups(filter, period.group_by())
            .into_iter()
            .map(|(key, records)| TrendPoint {
                period: key,
                value: sum(&records, |r| measure.of(r)) as f64,
            })
            .collect()
    }

    fn groups(&self, filter: &Filter, group_by: GroupBy) -> Groups<'a> {
        let mut groups: Groups<'a> = BTreeMap::new();
        if group_by == GroupBy::All {
            groups.insert(GroupKey::All, Vec::new());
        }
        for record in self.dataset.records().iter().filter(|r| filter.matches(r)) {
            groups
                .entry(GroupKey::of(record, group_by, self.dataset))
                .or_default()
                .push(record);
        }
        groups
    }

    fn per_group(
        &self,
        filter: &Filter,
        group_by: GroupBy,
        metric: MetricKind,
        value: impl Fn(&[&MealRecord]) -> Option<f64>,
    ) -> Vec<MetricResult> {
        self.groups(filter, group_by)
            .into_iter()
            .map(|(group, records)| MetricResult {
                value: value(&records),
                group,
                metric,
                filter: filter.clone(),
            })
            .collect()
    }
}

fn sum(records: &[&MealRecord], f: impl Fn(&MealRecord) -> i128) -> i128 {
    records.iter().map(|r| f(r)).sum()
}

fn ratio(numerator: i128, denominator: i128) -> Option<f64> {
    (denominator != 0).then(|| numerator as f64 / denominator as f64)
}

fn population_std_dev(values: impl Iterator<Item = f64>) -> Option<f64> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}
