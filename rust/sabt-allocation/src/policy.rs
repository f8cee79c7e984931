//! Normalization and rule execution policy

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::contracts::{
    AllocationConfig, Gender, MentorType, NormalizationError, NormalizedMentor, NormalizedStudent,
    RawMentor, RawStudent, RegCenter, RegStatus, RuleCode, TraceEntry,
};
use crate::providers::{ManagerCentersProvider, SpecialSchoolsProvider};
use crate::rules::{build_rules, Rule};

fn normalize_text(value: Option<&str>) -> String {
    sabt_text::normalize_token(value)
}

fn field_detail(field: &str, value: Option<&str>) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("field".into(), json!(field));
    if let Some(value) = value {
        details.insert("value".into(), json!(value));
    }
    details
}

fn normalize_int(
    value: Option<&str>,
    rule_code: RuleCode,
    field: &str,
    allow_none: bool,
) -> Result<Option<i64>, NormalizationError> {
    let text = normalize_text(value);
    if text.is_empty() {
        if allow_none {
            return Ok(None);
        }
        return Err(NormalizationError::new(
            rule_code,
            format!("مقدار {field} خالی است."),
            field_detail(field, None),
        ));
    }
    text.parse::<i64>().map(Some).map_err(|_| {
        NormalizationError::new(
            rule_code,
            format!("امکان تبدیل {field} به عدد وجود ندارد."),
            field_detail(field, Some(&text)),
        )
    })
}

fn normalize_bool(value: Option<&str>, field: &str) -> Result<bool, NormalizationError> {
    let text = normalize_text(value).to_lowercase();
    match text.as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(NormalizationError::new(
            RuleCode::CapacityAvailable,
            format!("مقدار بولی {field} قابل تفسیر نیست."),
            field_detail(field, Some(&text)),
        )),
    }
}

fn out_of_range(rule_code: RuleCode, field: &str, value: i64) -> NormalizationError {
    let mut details = Map::new();
    details.insert("field".into(), json!(field));
    details.insert("value".into(), json!(value));
    NormalizationError::new(
        rule_code,
        format!("مقدار {field} خارج از مقادیر مجاز است."),
        details,
    )
}

/// Evaluate mentors against the ordered allocation rules
pub struct EligibilityPolicy {
    special_schools: Arc<dyn SpecialSchoolsProvider>,
    rules: Vec<Box<dyn Rule>>,
    config: AllocationConfig,
}

impl EligibilityPolicy {
    pub fn new(
        special_schools: Arc<dyn SpecialSchoolsProvider>,
        manager_centers: Arc<dyn ManagerCentersProvider>,
        config: AllocationConfig,
    ) -> Self {
        Self {
            special_schools,
            rules: build_rules(manager_centers),
            config,
        }
    }

    pub fn config(&self) -> AllocationConfig {
        self.config
    }

    pub fn normalize_student(
        &self,
        raw: &RawStudent,
    ) -> Result<NormalizedStudent, NormalizationError> {
        let mut warnings = BTreeSet::new();

        let gender_value = normalize_int(
            raw.gender.as_deref(),
            RuleCode::GenderMatch,
            "gender",
            false,
        )?
        .unwrap_or_default();
        let gender = Gender::new(gender_value)
            .ok_or_else(|| out_of_range(RuleCode::GenderMatch, "gender", gender_value))?;

        let group_code = normalize_text(raw.group_code.as_deref());
        if group_code.is_empty() {
            return Err(NormalizationError::new(
                RuleCode::GroupAllowed,
                "کد گروه دانش‌آموز خالی است.",
                field_detail("group_code", None),
            ));
        }

        let center_value = normalize_int(
            raw.reg_center.as_deref(),
            RuleCode::CenterAllowed,
            "reg_center",
            false,
        )?
        .unwrap_or_default();
        let reg_center = RegCenter::new(center_value)
            .ok_or_else(|| out_of_range(RuleCode::CenterAllowed, "reg_center", center_value))?;

        let status_value = normalize_int(
            raw.reg_status.as_deref(),
            RuleCode::RegStatusAllowed,
            "reg_status",
            false,
        )?
        .unwrap_or_default();
        let reg_status = RegStatus::new(status_value)
            .ok_or_else(|| out_of_range(RuleCode::RegStatusAllowed, "reg_status", status_value))?;

        let edu_status = normalize_int(
            raw.edu_status.as_deref(),
            RuleCode::GraduateNotToSchool,
            "edu_status",
            true,
        )?
        .unwrap_or(0);

        let school_code = normalize_int(
            raw.school_code.as_deref(),
            RuleCode::SchoolTypeCompatible,
            "school_code",
            true,
        )?;
        let roster_year = normalize_int(
            raw.roster_year.as_deref(),
            RuleCode::SchoolTypeCompatible,
            "roster_year",
            true,
        )?;

        let provided_type = match normalize_int(
            raw.student_type.as_deref(),
            RuleCode::SchoolTypeCompatible,
            "student_type",
            true,
        )? {
            Some(value) if matches!(value, 0 | 1) => value as u8,
            Some(value) => {
                return Err(out_of_range(
                    RuleCode::SchoolTypeCompatible,
                    "student_type",
                    value,
                ))
            }
            None => 0,
        };

        let student_type = match self.derive_student_type(roster_year, school_code) {
            Some(derived) => {
                if derived != provided_type {
                    warnings.insert("student_type_mismatch_roster".to_string());
                }
                derived
            }
            None => provided_type,
        };

        Ok(NormalizedStudent {
            gender,
            group_code,
            reg_center,
            reg_status,
            edu_status,
            school_code,
            student_type,
            roster_year,
            warnings,
        })
    }

    fn derive_student_type(&self, roster_year: Option<i64>, school_code: Option<i64>) -> Option<u8> {
        let year = roster_year?;
        let code = school_code?;
        let schools = self.special_schools.special_schools(year)?;
        Some(u8::from(schools.contains(&code)))
    }

    pub fn normalize_mentor(&self, raw: &RawMentor) -> Result<NormalizedMentor, NormalizationError> {
        let mentor_id = normalize_int(
            raw.mentor_id.as_deref(),
            RuleCode::CapacityAvailable,
            "mentor_id",
            false,
        )?
        .unwrap_or_default();

        let gender_value = normalize_int(
            raw.gender.as_deref(),
            RuleCode::GenderMatch,
            "mentor_gender",
            false,
        )?
        .unwrap_or_default();
        let gender = Gender::new(gender_value)
            .ok_or_else(|| out_of_range(RuleCode::GenderMatch, "mentor_gender", gender_value))?;

        let allowed_groups: BTreeSet<String> = raw
            .allowed_groups
            .iter()
            .map(|value| normalize_text(Some(value)))
            .filter(|value| !value.is_empty())
            .collect();

        let mut allowed_centers = BTreeSet::new();
        for value in &raw.allowed_centers {
            let numeric = normalize_int(
                Some(value),
                RuleCode::CenterAllowed,
                "allowed_center",
                false,
            )?
            .unwrap_or_default();
            let center = RegCenter::new(numeric)
                .ok_or_else(|| out_of_range(RuleCode::CenterAllowed, "allowed_center", numeric))?;
            allowed_centers.insert(center);
        }

        let capacity = normalize_int(
            raw.capacity.as_deref(),
            RuleCode::CapacityAvailable,
            "capacity",
            false,
        )?
        .unwrap_or_default();
        let current_load = normalize_int(
            raw.current_load.as_deref(),
            RuleCode::CapacityAvailable,
            "current_load",
            false,
        )?
        .unwrap_or_default();

        let is_active = normalize_bool(raw.is_active.as_deref(), "is_active")?;

        let mentor_type_text = normalize_text(raw.mentor_type.as_deref()).to_uppercase();
        let mentor_type = match mentor_type_text.as_str() {
            "NORMAL" => MentorType::Normal,
            "SCHOOL" => MentorType::School,
            _ => {
                return Err(NormalizationError::new(
                    RuleCode::SchoolTypeCompatible,
                    "نوع منتور مجاز نیست.",
                    field_detail("mentor_type", Some(&mentor_type_text)),
                ))
            }
        };

        let mut special_schools = BTreeSet::new();
        for value in &raw.special_schools {
            let numeric = normalize_int(
                Some(value),
                RuleCode::SchoolTypeCompatible,
                "special_school",
                false,
            )?
            .unwrap_or_default();
            special_schools.insert(numeric);
        }

        let manager_id = normalize_int(
            raw.manager_id.as_deref(),
            RuleCode::ManagerCenterGate,
            "manager_id",
            true,
        )?;

        Ok(NormalizedMentor {
            mentor_id,
            gender,
            allowed_groups,
            allowed_centers,
            capacity,
            current_load,
            is_active,
            mentor_type,
            special_schools,
            manager_id,
        })
    }

    /// Run the ordered rules; returns overall pass plus the trace
    pub fn run_rules(
        &self,
        student: &NormalizedStudent,
        mentor: &NormalizedMentor,
    ) -> (bool, Vec<TraceEntry>) {
        let mut trace = Vec::with_capacity(self.rules.len());
        let mut passed = true;
        for rule in &self.rules {
            let outcome = rule.check(student, mentor);
            trace.push(TraceEntry {
                code: rule.code(),
                passed: outcome.passed,
                details: outcome.details,
            });
            if !outcome.passed {
                passed = false;
                if self.config.fast_fail {
                    break;
                }
            }
        }
        if !passed {
            if let Some(limit) = self.config.trace_limit_rejected {
                trace.truncate(limit);
            }
        }
        (passed, trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{InMemoryManagerCenters, InMemorySpecialSchools};
    use std::collections::HashMap;

    fn policy(config: AllocationConfig) -> EligibilityPolicy {
        EligibilityPolicy::new(
            Arc::new(InMemorySpecialSchools::new(HashMap::from([(
                1403,
                BTreeSet::from([654321]),
            )]))),
            Arc::new(InMemoryManagerCenters::default()),
            config,
        )
    }

    fn raw_student() -> RawStudent {
        RawStudent {
            gender: Some("0".into()),
            group_code: Some("A".into()),
            reg_center: Some("0".into()),
            reg_status: Some("1".into()),
            edu_status: Some("1".into()),
            school_code: None,
            student_type: None,
            roster_year: None,
        }
    }

    fn raw_mentor() -> RawMentor {
        RawMentor {
            mentor_id: Some("150".into()),
            gender: Some("0".into()),
            allowed_groups: vec!["A".into()],
            allowed_centers: vec!["0".into(), "1".into()],
            capacity: Some("4".into()),
            current_load: Some("2".into()),
            is_active: Some("true".into()),
            mentor_type: Some("NORMAL".into()),
            special_schools: vec![],
            manager_id: None,
        }
    }

    #[test]
    fn normalizes_persian_digit_input() {
        let policy = policy(AllocationConfig::default());
        let mut raw = raw_student();
        raw.gender = Some("۰".into());
        raw.reg_center = Some("۲".into());
        let student = policy.normalize_student(&raw).unwrap();
        assert_eq!(student.gender.value(), 0);
        assert_eq!(student.reg_center.value(), 2);
    }

    #[test]
    fn rejects_reg_status_two() {
        let policy = policy(AllocationConfig::default());
        let mut raw = raw_student();
        raw.reg_status = Some("2".into());
        let err = policy.normalize_student(&raw).unwrap_err();
        assert_eq!(err.rule_code, RuleCode::RegStatusAllowed);
    }

    #[test]
    fn derives_student_type_from_roster_with_mismatch_warning() {
        let policy = policy(AllocationConfig::default());
        let mut raw = raw_student();
        raw.school_code = Some("654321".into());
        raw.roster_year = Some("1403".into());
        raw.student_type = Some("0".into());
        let student = policy.normalize_student(&raw).unwrap();
        assert_eq!(student.student_type, 1);
        assert!(student.warnings.contains("student_type_mismatch_roster"));
    }

    #[test]
    fn missing_roster_keeps_provided_type() {
        let policy = policy(AllocationConfig::default());
        let mut raw = raw_student();
        raw.school_code = Some("111111".into());
        raw.roster_year = Some("1300".into());
        raw.student_type = Some("1".into());
        let student = policy.normalize_student(&raw).unwrap();
        assert_eq!(student.student_type, 1);
        assert!(student.warnings.is_empty());
    }

    #[test]
    fn mentor_type_must_be_known() {
        let policy = policy(AllocationConfig::default());
        let mut raw = raw_mentor();
        raw.mentor_type = Some("VIRTUAL".into());
        let err = policy.normalize_mentor(&raw).unwrap_err();
        assert_eq!(err.rule_code, RuleCode::SchoolTypeCompatible);
    }

    #[test]
    fn full_rule_run_passes_matching_pair() {
        let policy = policy(AllocationConfig::default());
        let student = policy.normalize_student(&raw_student()).unwrap();
        let mentor = policy.normalize_mentor(&raw_mentor()).unwrap();
        let (passed, trace) = policy.run_rules(&student, &mentor);
        assert!(passed);
        assert_eq!(trace.len(), 8);
        assert!(trace.iter().all(|entry| entry.passed));
    }

    #[test]
    fn fast_fail_stops_at_first_failure() {
        let policy = policy(AllocationConfig {
            fast_fail: true,
            trace_limit_rejected: None,
        });
        let student = policy.normalize_student(&raw_student()).unwrap();
        let mut raw = raw_mentor();
        raw.gender = Some("1".into());
        let mentor = policy.normalize_mentor(&raw).unwrap();
        let (passed, trace) = policy.run_rules(&student, &mentor);
        assert!(!passed);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].code, RuleCode::GenderMatch);
    }

    #[test]
    fn rejected_trace_is_truncated_but_passing_is_not() {
        let policy = policy(AllocationConfig {
            fast_fail: false,
            trace_limit_rejected: Some(2),
        });
        let student = policy.normalize_student(&raw_student()).unwrap();

        let mentor = policy.normalize_mentor(&raw_mentor()).unwrap();
        let (passed, trace) = policy.run_rules(&student, &mentor);
        assert!(passed);
        assert_eq!(trace.len(), 8);

        let mut raw = raw_mentor();
        raw.capacity = Some("0".into());
        let full_mentor = policy.normalize_mentor(&raw).unwrap();
        let (passed, trace) = policy.run_rules(&student, &full_mentor);
        assert!(!passed);
        assert_eq!(trace.len(), 2);
    }
}
