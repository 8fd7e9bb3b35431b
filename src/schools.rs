//! School reference table and name resolution.
//!
//! Reports spell the same building many ways ("Lane ES", "Lane Elementary",
//! "LANE ELEMENTARY SCHOOL"). Resolution tries, in order: exact id, exact
//! name or alias, normalised name, then Levenshtein similarity against every
//! normalised name with a configurable floor.
//!
//! Every resolution reports how it matched so a run can list the raw →
//! official mappings it made.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Default similarity floor for fuzzy name matching.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;

/// A school as listed in the reference table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Extra spellings seen in reports.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl School {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            region: None,
            address: None,
            zipcode: None,
            latitude: None,
            longitude: None,
            aliases: Vec::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }
}

/// How a raw school name was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Id,
    Exact,
    Normalized,
    Fuzzy,
    /// Empty directory: the trimmed raw value is the id.
    Passthrough,
    Unmapped,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMethod::Id => "id",
            MatchMethod::Exact => "exact",
            MatchMethod::Normalized => "normalized",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::Passthrough => "passthrough",
            MatchMethod::Unmapped => "unmapped",
        })
    }
}

/// A successful resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchoolMatch<'a> {
    pub school: &'a School,
    pub method: MatchMethod,
    /// 1.0 for every method but [`MatchMethod::Fuzzy`].
    pub score: f64,
}

/// One raw name and what it resolved to, as listed in the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolMapping {
    pub raw: String,
    pub school_id: Option<String>,
    pub method: MatchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl SchoolMapping {
    pub fn matched(raw: &str, m: &SchoolMatch<'_>) -> Self {
        Self {
            raw: raw.trim().to_string(),
            school_id: Some(m.school.id.clone()),
            method: m.method,
            score: (m.method == MatchMethod::Fuzzy).then_some(m.score),
        }
    }

    pub fn passthrough(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        Self {
            school_id: Some(raw.clone()),
            raw,
            method: MatchMethod::Passthrough,
            score: None,
        }
    }

    pub fn unmapped(raw: &str) -> Self {
        Self {
            raw: raw.trim().to_string(),
            school_id: None,
            method: MatchMethod::Unmapped,
            score: None,
        }
    }
}

/// Immutable lookup over the school table, shared by all workers.
#[derive(Debug, Clone)]
pub struct SchoolDirectory {
    schools: Vec<School>,
    by_id: HashMap<String, usize>,
    by_exact: HashMap<String, usize>,
    by_normalised: HashMap<String, usize>,
    fuzzy_threshold: f64,
}

impl Default for SchoolDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl SchoolDirectory {
    pub fn new(schools: Vec<School>) -> Self {
        let mut by_id = HashMap::new();
        let mut by_exact = HashMap::new();
        let mut by_normalised = HashMap::new();
        for (idx, school) in schools.iter().enumerate() {
            by_id.entry(school.id.trim().to_string()).or_insert(idx);
            for name in std::iter::once(&school.name).chain(school.aliases.iter()) {
                by_exact.entry(name.trim().to_lowercase()).or_insert(idx);
                let norm = normalize_school_name(name);
                if !norm.is_empty() {
                    by_normalised.entry(norm).or_insert(idx);
                }
            }
        }
        Self {
            schools,
            by_id,
            by_exact,
            by_normalised,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }

    /// Set the similarity floor (clamped to 0.0–1.0).
    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn fuzzy_threshold(&self) -> f64 {
        self.fuzzy_threshold
    }

    pub fn is_empty(&self) -> bool {
        self.schools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.schools.len()
    }

    pub fn get(&self, id: &str) -> Option<&School> {
        self.by_id.get(id).map(|&i| &self.schools[i])
    }

    pub fn region_of(&self, id: &str) -> Option<&str> {
        self.get(id).and_then(|s| s.region.as_deref())
    }

    fn matched(&self, idx: usize, method: MatchMethod, score: f64) -> SchoolMatch<'_> {
        SchoolMatch {
            school: &self.schools[idx],
            method,
            score,
        }
    }

    /// Resolve a school as spelled in a report to its table entry.
    pub fn resolve(&self, raw: &str) -> Option<SchoolMatch<'_>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(&i) = self.by_id.get(raw) {
            return Some(self.matched(i, MatchMethod::Id, 1.0));
        }
        if let Some(&i) = self.by_exact.get(&raw.to_lowercase()) {
            return Some(self.matched(i, MatchMethod::Exact, 1.0));
        }
        let norm = normalize_school_name(raw);
        if norm.is_empty() {
            return None;
        }
        if let Some(&i) = self.by_normalised.get(&norm) {
            return Some(self.matched(i, MatchMethod::Normalized, 1.0));
        }

        // Deterministic best match: highest score, ties broken by table order.
        let mut best: Option<(usize, f64)> = None;
        for (idx, school) in self.schools.iter().enumerate() {
            for name in std::iter::once(&school.name).chain(school.aliases.iter()) {
                let score = similarity(&norm, &normalize_school_name(name));
                if score >= self.fuzzy_threshold && best.is_none_or(|(_, b)| score > b) {
                    best = Some((idx, score));
                }
            }
        }
        best.map(|(i, score)| {
            tracing::debug!(raw, school = %self.schools[i].id, score, "fuzzy school match");
            self.matched(i, MatchMethod::Fuzzy, score)
        })
    }
}

/// Replacement table applied to lower-cased names, in order. Longer phrases
/// come first so "elementary school" wins over "elementary".
const NAME_REPLACEMENTS: &[(&str, &str)] = &[
    (" elementary school", " es"),
    (" middle school", " ms"),
    (" high school", " hs"),
    (" secondary school", " ss"),
    (" elementary", " es"),
    (" middle", " ms"),
    (" high", " hs"),
    (" secondary", " ss"),
    (" school", ""),
    (" center", " ctr"),
    (" centre", " ctr"),
    (" academy", " acad"),
    (" alternative", " alt"),
    (" international", " intl"),
    (" magnet", " mag"),
    (" charter", " chtr"),
    (" campus", ""),
    (" facility", ""),
    (" program", ""),
];

/// Canonical comparison form of a school name.
pub fn normalize_school_name(name: &str) -> String {
    let mut s = name.trim().to_lowercase();
    for (from, to) in NAME_REPLACEMENTS {
        s = s.replace(from, to);
    }
    let s: String = s
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in 0.0–1.0 from normalised Levenshtein distance.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    if len_a == 0 || len_b == 0 {
        return 0.0;
    }
    let distance = levenshtein(a, b);
    1.0 - distance as f64 / len_a.max(len_b) as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> SchoolDirectory {
        SchoolDirectory::new(vec![
            School::new("041", "Lane ES").with_region("Region 3"),
            School::new("112", "Washington Middle School").with_alias("Wash MS"),
            School::new("207", "Aldrin Elementary"),
        ])
    }

    #[test]
    fn test_normalize_school_name() {
        assert_eq!(normalize_school_name("Lane Elementary School"), "lane es");
        assert_eq!(normalize_school_name("  LANE ES. "), "lane es");
        assert_eq!(normalize_school_name("Bryant Alternative High School"), "bryant alt hs");
        assert_eq!(normalize_school_name("Hutchison Elementary"), "hutchison es");
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("", "abc"), 0.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
    }

    #[test]
    fn resolves_by_id_name_alias_and_normalised_name() {
        let dir = directory();
        let hit = |raw: &str| dir.resolve(raw).map(|m| (m.school.id.clone(), m.method));
        assert_eq!(hit("041"), Some(("041".into(), MatchMethod::Id)));
        assert_eq!(hit("lane es"), Some(("041".into(), MatchMethod::Exact)));
        assert_eq!(hit("Wash MS"), Some(("112".into(), MatchMethod::Exact)));
        assert_eq!(
            hit("Lane Elementary School"),
            Some(("041".into(), MatchMethod::Normalized))
        );
        assert_eq!(
            hit("washington middle"),
            Some(("112".into(), MatchMethod::Normalized))
        );
    }

    #[test]
    fn resolves_misspelling_above_threshold_only() {
        let dir = directory();
        let m = dir.resolve("Aldren Elementary").unwrap();
        assert_eq!((m.school.id.as_str(), m.method), ("207", MatchMethod::Fuzzy));
        assert!(m.score >= DEFAULT_FUZZY_THRESHOLD && m.score < 1.0);
        assert!(dir.resolve("Robinson Secondary").is_none());
        assert!(dir.resolve("").is_none());
    }

    #[test]
    fn mapping_keeps_score_for_fuzzy_matches_only() {
        let dir = directory();
        let m = dir.resolve("Aldren Elementary").unwrap();
        let fuzzy = SchoolMapping::matched(" Aldren Elementary ", &m);
        assert_eq!(fuzzy.raw, "Aldren Elementary");
        assert_eq!(fuzzy.school_id.as_deref(), Some("207"));
        assert!(fuzzy.score.is_some());

        let exact = SchoolMapping::matched("Lane ES", &dir.resolve("Lane ES").unwrap());
        assert_eq!(exact.score, None);
        let json = serde_json::to_value(&exact).unwrap();
        assert_eq!(json["method"], "exact");

        let missing = SchoolMapping::unmapped("Nowhere");
        assert_eq!((missing.school_id, missing.method), (None, MatchMethod::Unmapped));
    }

    #[test]
    fn region_lookup() {
        let dir = directory();
        assert_eq!(dir.region_of("041"), Some("Region 3"));
        assert_eq!(dir.region_of("112"), None);
        assert_eq!(dir.region_of("999"), None);
    }
}
