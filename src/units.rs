//! Cell-level value parsing: money, counts and dates.
//!
//! Report cells arrive with currency symbols, thousands separators and half a
//! dozen date spellings. Everything here is a pure `&str → Option<T>` so the
//! layout parser and normaliser agree on what "numeric" means.

use crate::model::Cents;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_NON_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.\-]").unwrap());

static RE_SHORT_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}/\d{1,2}/\d{2}$").unwrap());

static RE_COMPACT_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8}$").unwrap());

/// Date formats tried in order. Two-digit years and `YYYYMMDD` are handled
/// separately because `%Y` happily accepts them.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%A, %B %d, %Y",
];

/// True when the trimmed cell parses as a plain decimal number.
pub fn is_plain_number(cell: &str) -> bool {
    let t = cell.trim();
    !t.is_empty() && t.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Strip everything except digits, `.` and `-`, then check the remainder is
/// a number. Returns the cleaned text.
pub fn clean_numeric(cell: &str) -> Option<String> {
    let cleaned = RE_NON_NUMERIC.replace_all(cell, "").to_string();
    is_plain_number(&cleaned).then_some(cleaned)
}

/// Parse a money cell into cents without going through floating point.
///
/// Accepts `$0.45`, `1,234.5`, `-2.10`, `45¢`. The third decimal rounds half
/// up; further decimals are ignored.
pub fn parse_cents(cell: &str) -> Option<Cents> {
    let t = cell.trim();
    if let Some(c) = t.strip_suffix('¢') {
        return c.trim().replace(',', "").parse::<Cents>().ok();
    }
    let t: String = t
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' ' | '\u{a0}'))
        .collect();
    let (negative, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest.to_string()),
        None => (false, t),
    };
    let (whole, frac) = match t.split_once('.') {
        Some((w, f)) => (w, f),
        None => (t.as_str(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: Cents = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let digits: Vec<Cents> = frac
        .chars()
        .take(3)
        .map(|c| c as Cents - '0' as Cents)
        .collect();
    let tenths = digits.first().copied().unwrap_or(0);
    let hundredths = digits.get(1).copied().unwrap_or(0);
    let round_up = digits.get(2).is_some_and(|d| *d >= 5);
    let cents = whole
        .checked_mul(100)?
        .checked_add(tenths * 10 + hundredths + Cents::from(round_up))?;
    Some(if negative { -cents } else { cents })
}

/// Parse a count cell into a non-negative integer, rounding fractional
/// counts to the nearest unit.
pub fn parse_quantity(cell: &str) -> Option<u64> {
    let t: String = cell
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}'))
        .collect();
    let value: f64 = t.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value.round() as u64)
}

/// Parse a report date in any of the spellings seen in the source reports.
/// A trailing time component (`2023-09-05 00:00:00`) is ignored.
pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    let t = cell.trim();
    if t.is_empty() {
        return None;
    }
    parse_date_exact(t).or_else(|| {
        let first = t.split_whitespace().next()?;
        (first != t).then(|| parse_date_exact(first)).flatten()
    })
}

fn parse_date_exact(t: &str) -> Option<NaiveDate> {
    if RE_SHORT_YEAR.is_match(t) {
        return NaiveDate::parse_from_str(t, "%m/%d/%y").ok();
    }
    if RE_COMPACT_DATE.is_match(t) {
        let year = t[..4].parse().ok()?;
        let month = t[4..6].parse().ok()?;
        let day = t[6..].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(t, fmt).ok())
}

/// Render cents as a decimal currency amount (`45` → `0.45`).
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}
