use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A question covers an LO iff its similarity score is strictly above this.
/// An exact 0.3 does not count.
pub const RELEVANCE_THRESHOLD: f64 = 0.3;

pub const COVERED_MIN_PERCENT: i64 = 70;
pub const PARTIAL_MIN_PERCENT: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomLevel {
    Remember,
    Understand,
    Apply,
    Analyze,
    Evaluate,
    Create,
}

impl BloomLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "remember" => Some(BloomLevel::Remember),
            "understand" => Some(BloomLevel::Understand),
            "apply" => Some(BloomLevel::Apply),
            "analyze" => Some(BloomLevel::Analyze),
            "evaluate" => Some(BloomLevel::Evaluate),
            "create" => Some(BloomLevel::Create),
            _ => None,
        }
    }

    /// Storage form (lower case).
    pub fn as_str(self) -> &'static str {
        match self {
            BloomLevel::Remember => "remember",
            BloomLevel::Understand => "understand",
            BloomLevel::Apply => "apply",
            BloomLevel::Analyze => "analyze",
            BloomLevel::Evaluate => "evaluate",
            BloomLevel::Create => "create",
        }
    }

    /// Display form used on the wire.
    pub fn label(self) -> &'static str {
        match self {
            BloomLevel::Remember => "Remember",
            BloomLevel::Understand => "Understand",
            BloomLevel::Apply => "Apply",
            BloomLevel::Analyze => "Analyze",
            BloomLevel::Evaluate => "Evaluate",
            BloomLevel::Create => "Create",
        }
    }

    pub fn display_label(stored: &str) -> String {
        match BloomLevel::parse(stored) {
            Some(level) => level.label().to_string(),
            None => "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageStatus {
    Covered,
    PartiallyCovered,
    NotCovered,
}

impl CoverageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverageStatus::Covered => "covered",
            CoverageStatus::PartiallyCovered => "partial",
            CoverageStatus::NotCovered => "not_covered",
        }
    }

    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw {
            "covered" => Some(CoverageStatus::Covered),
            "partial" => Some(CoverageStatus::PartiallyCovered),
            "not_covered" => Some(CoverageStatus::NotCovered),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CoverageStatus::Covered => "Covered",
            CoverageStatus::PartiallyCovered => "Partially Covered",
            CoverageStatus::NotCovered => "Not Covered",
        }
    }
}

/// Percentage from the covering scores only: round(mean * 100), capped at 100.
/// No covering questions means 0.
pub fn coverage_percentage(covering_scores: &[f64]) -> i64 {
    if covering_scores.is_empty() {
        return 0;
    }
    let mean = covering_scores.iter().sum::<f64>() / covering_scores.len() as f64;
    let pct = (mean * 100.0).round() as i64;
    pct.clamp(0, 100)
}

/// Inclusive lower bounds: >=70 covered, >=30 partial, else not covered.
pub fn status_for(percentage: i64) -> CoverageStatus {
    if percentage >= COVERED_MIN_PERCENT {
        CoverageStatus::Covered
    } else if percentage >= PARTIAL_MIN_PERCENT {
        CoverageStatus::PartiallyCovered
    } else {
        CoverageStatus::NotCovered
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionMatch {
    pub question_id: String,
    pub score: f64,
}

/// One coverage_records row as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub rowid: i64,
    pub lo_ref: String,
    pub percentage: i64,
    pub status: String,
    pub matches: Vec<QuestionMatch>,
    pub question_count: i64,
    pub analyzed_question_ids: Option<Vec<String>>,
    pub created_at: String,
}

/// The read path's safety net: keep exactly one record per lo_ref, the one
/// with the greatest created_at (rowid breaks ties). The write path deletes
/// its own scope before inserting, but a crashed or interleaved run can leave
/// more than one row per LO, and those must never surface to the caller.
pub fn dedup_latest(records: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let mut latest: HashMap<String, StoredRecord> = HashMap::new();
    for rec in records {
        match latest.get(&rec.lo_ref) {
            Some(existing)
                if (existing.created_at.as_str(), existing.rowid)
                    >= (rec.created_at.as_str(), rec.rowid) => {}
            _ => {
                latest.insert(rec.lo_ref.clone(), rec);
            }
        }
    }
    let mut out: Vec<StoredRecord> = latest.into_values().collect();
    out.sort_by(|a, b| a.lo_ref.cmp(&b.lo_ref));
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageStats {
    #[serde(rename = "totalLOs")]
    pub total_los: usize,
    pub covered: usize,
    pub partially_covered: usize,
    pub not_covered: usize,
    pub average_coverage: i64,
}

/// Plain tallies over an already-deduplicated record set.
pub fn aggregate_stats(records: &[StoredRecord]) -> CoverageStats {
    let mut covered = 0usize;
    let mut partially = 0usize;
    let mut not_covered = 0usize;
    let mut sum = 0i64;
    for rec in records {
        match CoverageStatus::from_stored(&rec.status) {
            Some(CoverageStatus::Covered) => covered += 1,
            Some(CoverageStatus::PartiallyCovered) => partially += 1,
            _ => not_covered += 1,
        }
        sum += rec.percentage;
    }
    let average = if records.is_empty() {
        0
    } else {
        ((sum as f64) / (records.len() as f64)).round() as i64
    };
    CoverageStats {
        total_los: records.len(),
        covered,
        partially_covered: partially,
        not_covered,
        average_coverage: average,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomRollup {
    pub level: String,
    pub lo_count: usize,
    pub average_coverage: i64,
    pub covered: usize,
    pub partially_covered: usize,
    pub not_covered: usize,
}

/// Presentation-only rollup: group deduplicated records by the bloom level of
/// their current LO definition. Records whose LO no longer exists group under
/// "Unknown". Levels with no LOs are omitted entirely.
pub fn bloom_rollup(
    records: &[StoredRecord],
    levels_by_ref: &HashMap<String, String>,
) -> Vec<BloomRollup> {
    let mut grouped: HashMap<String, Vec<&StoredRecord>> = HashMap::new();
    for rec in records {
        let level = levels_by_ref
            .get(&rec.lo_ref)
            .map(|stored| BloomLevel::display_label(stored))
            .unwrap_or_else(|| "Unknown".to_string());
        grouped.entry(level).or_default().push(rec);
    }

    let mut out = Vec::new();
    // Fixed taxonomy order first, then Unknown last.
    let order = [
        "Remember",
        "Understand",
        "Apply",
        "Analyze",
        "Evaluate",
        "Create",
        "Unknown",
    ];
    for level in order {
        let Some(group) = grouped.get(level) else {
            continue;
        };
        let mut covered = 0usize;
        let mut partially = 0usize;
        let mut not_covered = 0usize;
        let mut sum = 0i64;
        for rec in group {
            match CoverageStatus::from_stored(&rec.status) {
                Some(CoverageStatus::Covered) => covered += 1,
                Some(CoverageStatus::PartiallyCovered) => partially += 1,
                _ => not_covered += 1,
            }
            sum += rec.percentage;
        }
        out.push(BloomRollup {
            level: level.to_string(),
            lo_count: group.len(),
            average_coverage: ((sum as f64) / (group.len() as f64)).round() as i64,
            covered,
            partially_covered: partially,
            not_covered,
        });
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoverageError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl std::fmt::Display for CoverageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CoverageError {}
