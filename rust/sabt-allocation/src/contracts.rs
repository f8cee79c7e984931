//! Core contracts for allocation

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

/// Rule identifiers, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCode {
    GenderMatch,
    GroupAllowed,
    CenterAllowed,
    RegStatusAllowed,
    CapacityAvailable,
    SchoolTypeCompatible,
    GraduateNotToSchool,
    ManagerCenterGate,
}

impl RuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCode::GenderMatch => "GENDER_MATCH",
            RuleCode::GroupAllowed => "GROUP_ALLOWED",
            RuleCode::CenterAllowed => "CENTER_ALLOWED",
            RuleCode::RegStatusAllowed => "REG_STATUS_ALLOWED",
            RuleCode::CapacityAvailable => "CAPACITY_AVAILABLE",
            RuleCode::SchoolTypeCompatible => "SCHOOL_TYPE_COMPATIBLE",
            RuleCode::GraduateNotToSchool => "GRADUATE_NOT_TO_SCHOOL",
            RuleCode::ManagerCenterGate => "MANAGER_CENTER_GATE",
        }
    }
}

impl std::fmt::Display for RuleCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mentor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MentorType {
    Normal,
    School,
}

/// Validated gender code (0 or 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Gender(u8);

impl Gender {
    pub fn new(value: i64) -> Option<Self> {
        matches!(value, 0 | 1).then_some(Self(value as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Validated registration center (0, 1, or 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegCenter(u8);

impl RegCenter {
    pub fn new(value: i64) -> Option<Self> {
        matches!(value, 0..=2).then_some(Self(value as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Validated registration status (0, 1, or 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegStatus(u8);

impl RegStatus {
    pub fn new(value: i64) -> Option<Self> {
        matches!(value, 0 | 1 | 3).then_some(Self(value as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Raw student input before normalization.
///
/// Fields arrive as loosely-typed text (CSV cells, API payloads), possibly
/// carrying Persian digits and zero-width characters.
#[derive(Debug, Clone, Default)]
pub struct RawStudent {
    pub gender: Option<String>,
    pub group_code: Option<String>,
    pub reg_center: Option<String>,
    pub reg_status: Option<String>,
    pub edu_status: Option<String>,
    pub school_code: Option<String>,
    pub student_type: Option<String>,
    pub roster_year: Option<String>,
}

/// Raw mentor input before normalization
#[derive(Debug, Clone, Default)]
pub struct RawMentor {
    pub mentor_id: Option<String>,
    pub gender: Option<String>,
    pub allowed_groups: Vec<String>,
    pub allowed_centers: Vec<String>,
    pub capacity: Option<String>,
    pub current_load: Option<String>,
    pub is_active: Option<String>,
    pub mentor_type: Option<String>,
    pub special_schools: Vec<String>,
    pub manager_id: Option<String>,
}

/// Normalized student, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStudent {
    pub gender: Gender,
    pub group_code: String,
    pub reg_center: RegCenter,
    pub reg_status: RegStatus,
    pub edu_status: i64,
    pub school_code: Option<i64>,
    pub student_type: u8,
    pub roster_year: Option<i64>,
    pub warnings: BTreeSet<String>,
}

/// Normalized mentor used by rules and ranking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMentor {
    pub mentor_id: i64,
    pub gender: Gender,
    pub allowed_groups: BTreeSet<String>,
    pub allowed_centers: BTreeSet<RegCenter>,
    pub capacity: i64,
    pub current_load: i64,
    pub is_active: bool,
    pub mentor_type: MentorType,
    pub special_schools: BTreeSet<i64>,
    pub manager_id: Option<i64>,
}

impl NormalizedMentor {
    /// `current_load / capacity`, treated as full when capacity is
    /// non-positive
    pub fn occupancy_ratio(&self) -> f64 {
        if self.capacity <= 0 {
            1.0
        } else {
            self.current_load as f64 / self.capacity as f64
        }
    }
}

/// Ranking tuple; winners minimize it lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankingKey {
    pub occupancy_ratio: f64,
    pub current_load: i64,
    pub mentor_id: i64,
}

impl RankingKey {
    pub fn for_mentor(mentor: &NormalizedMentor) -> Self {
        Self {
            occupancy_ratio: mentor.occupancy_ratio(),
            current_load: mentor.current_load,
            mentor_id: mentor.mentor_id,
        }
    }
}

impl Eq for RankingKey {}

impl PartialOrd for RankingKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankingKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.occupancy_ratio
            .total_cmp(&other.occupancy_ratio)
            .then(self.current_load.cmp(&other.current_load))
            .then(self.mentor_id.cmp(&other.mentor_id))
    }
}

/// One rule evaluation in a trace
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub code: RuleCode,
    pub passed: bool,
    pub details: Map<String, Value>,
}

/// Evaluation configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationConfig {
    /// Stop at the first failing rule
    pub fast_fail: bool,
    /// Truncate the trace of a rejected mentor to at most N entries
    pub trace_limit_rejected: Option<usize>,
}

/// Raised when raw input cannot be normalized
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NormalizationError {
    pub rule_code: RuleCode,
    pub message: String,
    pub details: Map<String, Value>,
}

impl NormalizationError {
    pub fn new(rule_code: RuleCode, message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            rule_code,
            message: message.into(),
            details,
        }
    }

    /// Single-entry trace carrying the offending rule code
    pub fn into_trace(self) -> Vec<TraceEntry> {
        let mut details = self.details;
        details.insert("message".into(), Value::String(self.message));
        vec![TraceEntry {
            code: self.rule_code,
            passed: false,
            details,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_key_orders_by_ratio_then_load_then_id() {
        let a = RankingKey {
            occupancy_ratio: 0.5,
            current_load: 2,
            mentor_id: 200,
        };
        let b = RankingKey {
            occupancy_ratio: 0.5,
            current_load: 2,
            mentor_id: 150,
        };
        let c = RankingKey {
            occupancy_ratio: 0.25,
            current_load: 1,
            mentor_id: 900,
        };
        let mut keys = vec![a, b, c];
        keys.sort();
        assert_eq!(keys[0].mentor_id, 900);
        assert_eq!(keys[1].mentor_id, 150);
        assert_eq!(keys[2].mentor_id, 200);
    }

    #[test]
    fn occupancy_ratio_is_full_for_zero_capacity() {
        let mentor = NormalizedMentor {
            mentor_id: 1,
            gender: Gender::new(0).unwrap(),
            allowed_groups: BTreeSet::new(),
            allowed_centers: BTreeSet::new(),
            capacity: 0,
            current_load: 0,
            is_active: true,
            mentor_type: MentorType::Normal,
            special_schools: BTreeSet::new(),
            manager_id: None,
        };
        assert_eq!(mentor.occupancy_ratio(), 1.0);
    }

    #[test]
    fn enum_codes_render_stable_names() {
        assert_eq!(RuleCode::ManagerCenterGate.as_str(), "MANAGER_CENTER_GATE");
        assert_eq!(RuleCode::GenderMatch.to_string(), "GENDER_MATCH");
    }

    #[test]
    fn reg_status_rejects_two() {
        assert!(RegStatus::new(2).is_none());
        assert!(RegStatus::new(3).is_some());
    }
}
