//! The fixed, ordered eligibility rule list

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::contracts::{MentorType, NormalizedMentor, NormalizedStudent, RuleCode};
use crate::providers::ManagerCentersProvider;

/// Outcome of a single rule check
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub passed: bool,
    pub details: Map<String, Value>,
}

impl RuleOutcome {
    fn passed() -> Self {
        Self {
            passed: true,
            details: Map::new(),
        }
    }

    fn failed(details: Map<String, Value>) -> Self {
        Self {
            passed: false,
            details,
        }
    }
}

fn detail(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

/// One eligibility rule
pub trait Rule: Send + Sync {
    fn code(&self) -> RuleCode;
    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome;
}

pub struct GenderMatchRule;

impl Rule for GenderMatchRule {
    fn code(&self) -> RuleCode {
        RuleCode::GenderMatch
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        if student.gender == mentor.gender {
            RuleOutcome::passed()
        } else {
            RuleOutcome::failed(detail(
                "mentor_gender",
                json!(mentor.gender.value()),
            ))
        }
    }
}

pub struct GroupAllowedRule;

impl Rule for GroupAllowedRule {
    fn code(&self) -> RuleCode {
        RuleCode::GroupAllowed
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        if mentor.allowed_groups.contains(&student.group_code) {
            RuleOutcome::passed()
        } else {
            RuleOutcome::failed(detail("group_code", json!(student.group_code)))
        }
    }
}

pub struct CenterAllowedRule;

impl Rule for CenterAllowedRule {
    fn code(&self) -> RuleCode {
        RuleCode::CenterAllowed
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        if mentor.allowed_centers.contains(&student.reg_center) {
            RuleOutcome::passed()
        } else {
            RuleOutcome::failed(detail("reg_center", json!(student.reg_center.value())))
        }
    }
}

pub struct RegStatusAllowedRule;

impl Rule for RegStatusAllowedRule {
    fn code(&self) -> RuleCode {
        RuleCode::RegStatusAllowed
    }

    fn check(&self, student: &NormalizedStudent, _mentor: &NormalizedMentor) -> RuleOutcome {
        // RegStatus is validated at normalization; the rule re-asserts the
        // membership so a rejected status always shows up in traces.
        if matches!(student.reg_status.value(), 0 | 1 | 3) {
            RuleOutcome::passed()
        } else {
            RuleOutcome::failed(detail("reg_status", json!(student.reg_status.value())))
        }
    }
}

pub struct CapacityAvailableRule;

impl Rule for CapacityAvailableRule {
    fn code(&self) -> RuleCode {
        RuleCode::CapacityAvailable
    }

    fn check(&self, _student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        let available = mentor.is_active
            && mentor.capacity > 0
            && mentor.current_load >= 0
            && mentor.current_load < mentor.capacity;
        if available {
            RuleOutcome::passed()
        } else {
            let mut details = Map::new();
            details.insert("capacity".into(), json!(mentor.capacity));
            details.insert("current_load".into(), json!(mentor.current_load));
            details.insert("is_active".into(), json!(mentor.is_active));
            RuleOutcome::failed(details)
        }
    }
}

pub struct SchoolTypeCompatibleRule;

impl Rule for SchoolTypeCompatibleRule {
    fn code(&self) -> RuleCode {
        RuleCode::SchoolTypeCompatible
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        match student.student_type {
            1 => {
                let school_listed = student
                    .school_code
                    .map(|code| mentor.special_schools.contains(&code))
                    .unwrap_or(false);
                if mentor.mentor_type == MentorType::School && school_listed {
                    RuleOutcome::passed()
                } else {
                    RuleOutcome::failed(detail("school_code", json!(student.school_code)))
                }
            }
            _ => {
                if mentor.mentor_type == MentorType::Normal {
                    RuleOutcome::passed()
                } else {
                    RuleOutcome::failed(detail("mentor_type", json!("SCHOOL")))
                }
            }
        }
    }
}

pub struct GraduateNotToSchoolRule;

impl Rule for GraduateNotToSchoolRule {
    fn code(&self) -> RuleCode {
        RuleCode::GraduateNotToSchool
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        if student.edu_status == 0 && mentor.mentor_type == MentorType::School {
            RuleOutcome::failed(detail("edu_status", json!(0)))
        } else {
            RuleOutcome::passed()
        }
    }
}

/// Gate mentors behind their manager's allowed centers.
///
/// Mentors without a manager pass unconditionally. An unknown manager fails
/// with `manager_centers_not_found` rather than passing open.
pub struct ManagerCenterGateRule {
    provider: Arc<dyn ManagerCentersProvider>,
}

impl ManagerCenterGateRule {
    pub fn new(provider: Arc<dyn ManagerCentersProvider>) -> Self {
        Self { provider }
    }
}

impl Rule for ManagerCenterGateRule {
    fn code(&self) -> RuleCode {
        RuleCode::ManagerCenterGate
    }

    fn check(&self, student: &NormalizedStudent, mentor: &NormalizedMentor) -> RuleOutcome {
        let Some(manager_id) = mentor.manager_id else {
            return RuleOutcome::passed();
        };
        match self.provider.allowed_centers(manager_id) {
            Some(centers) if centers.contains(&student.reg_center) => RuleOutcome::passed(),
            Some(_) => RuleOutcome::failed(detail(
                "reg_center",
                json!(student.reg_center.value()),
            )),
            None => RuleOutcome::failed(detail("reason", json!("manager_centers_not_found"))),
        }
    }
}

/// Build the rule chain in specification order
pub fn build_rules(manager_centers: Arc<dyn ManagerCentersProvider>) -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(GenderMatchRule),
        Box::new(GroupAllowedRule),
        Box::new(CenterAllowedRule),
        Box::new(RegStatusAllowedRule),
        Box::new(CapacityAvailableRule),
        Box::new(SchoolTypeCompatibleRule),
        Box::new(GraduateNotToSchoolRule),
        Box::new(ManagerCenterGateRule::new(manager_centers)),
    ]
}
