//! Allocation engine orchestrating policy evaluation and ranking

use std::sync::Arc;

use sabt_metrics::ServiceMetrics;

use crate::contracts::{NormalizedMentor, RankingKey, RawMentor, RawStudent, TraceEntry};
use crate::policy::EligibilityPolicy;

/// Evaluation record for one mentor against one student
#[derive(Debug, Clone)]
pub struct MentorEvaluation {
    /// Raw mentor position in the input slice
    pub index: usize,
    pub normalized: Option<NormalizedMentor>,
    pub passed: bool,
    pub trace: Vec<TraceEntry>,
    pub ranking_key: Option<RankingKey>,
}

/// Outcome of one allocation round
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub winner: Option<NormalizedMentor>,
    pub evaluations: Vec<MentorEvaluation>,
}

/// Execute policy checks and select the best mentor
pub struct AllocationEngine {
    policy: EligibilityPolicy,
    metrics: Option<Arc<ServiceMetrics>>,
}

impl AllocationEngine {
    pub fn new(policy: EligibilityPolicy, metrics: Option<Arc<ServiceMetrics>>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    fn record_no_candidate(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.allocation_no_candidate_total.inc();
        }
    }

    /// Allocate a whole batch sequentially.
    ///
    /// Mentors are normalized once; every assignment bumps the winner's
    /// working load so later students see the updated occupancy. Results
    /// come back in student order.
    pub fn evaluate_batch(
        &self,
        students: &[RawStudent],
        mentors: &[RawMentor],
    ) -> Vec<AllocationResult> {
        let mut pool: Vec<Result<NormalizedMentor, crate::contracts::NormalizationError>> =
            mentors
                .iter()
                .map(|mentor| self.policy.normalize_mentor(mentor))
                .collect();

        let mut results = Vec::with_capacity(students.len());
        for student in students {
            let normalized_student = match self.policy.normalize_student(student) {
                Ok(normalized) => normalized,
                Err(error) => {
                    self.record_no_candidate();
                    results.push(AllocationResult {
                        winner: None,
                        evaluations: vec![MentorEvaluation {
                            index: 0,
                            normalized: None,
                            passed: false,
                            trace: error.into_trace(),
                            ranking_key: None,
                        }],
                    });
                    continue;
                }
            };

            let mut evaluations = Vec::with_capacity(pool.len());
            let mut best: Option<(RankingKey, usize)> = None;
            for (index, entry) in pool.iter().enumerate() {
                match entry {
                    Err(error) => evaluations.push(MentorEvaluation {
                        index,
                        normalized: None,
                        passed: false,
                        trace: error.clone().into_trace(),
                        ranking_key: None,
                    }),
                    Ok(mentor) => {
                        let (passed, trace) = self.policy.run_rules(&normalized_student, mentor);
                        let ranking_key = passed.then(|| RankingKey::for_mentor(mentor));
                        if let Some(key) = ranking_key {
                            let better = match &best {
                                Some((current, _)) => key < *current,
                                None => true,
                            };
                            if better {
                                best = Some((key, index));
                            }
                        }
                        evaluations.push(MentorEvaluation {
                            index,
                            normalized: Some(mentor.clone()),
                            passed,
                            trace,
                            ranking_key,
                        });
                    }
                }
            }

            let winner = match best {
                Some((_, index)) => {
                    if let Ok(mentor) = &mut pool[index] {
                        mentor.current_load += 1;
                        Some(mentor.clone())
                    } else {
                        None
                    }
                }
                None => {
                    self.record_no_candidate();
                    None
                }
            };
            results.push(AllocationResult {
                winner,
                evaluations,
            });
        }
        results
    }

    /// Evaluate every mentor for `student` and pick the ranking minimum.
    ///
    /// A student that fails normalization yields a single-entry evaluation
    /// and no winner. Mentors that fail normalization stay in the trace but
    /// never reach the rules.
    pub fn evaluate(&self, student: &RawStudent, mentors: &[RawMentor]) -> AllocationResult {
        let normalized_student = match self.policy.normalize_student(student) {
            Ok(normalized) => normalized,
            Err(error) => {
                self.record_no_candidate();
                return AllocationResult {
                    winner: None,
                    evaluations: vec![MentorEvaluation {
                        index: 0,
                        normalized: None,
                        passed: false,
                        trace: error.into_trace(),
                        ranking_key: None,
                    }],
                };
            }
        };

        let mut evaluations = Vec::with_capacity(mentors.len());
        let mut best: Option<(RankingKey, NormalizedMentor)> = None;

        for (index, mentor) in mentors.iter().enumerate() {
            let normalized_mentor = match self.policy.normalize_mentor(mentor) {
                Ok(normalized) => normalized,
                Err(error) => {
                    evaluations.push(MentorEvaluation {
                        index,
                        normalized: None,
                        passed: false,
                        trace: error.into_trace(),
                        ranking_key: None,
                    });
                    continue;
                }
            };

            let (passed, trace) = self.policy.run_rules(&normalized_student, &normalized_mentor);
            let ranking_key = passed.then(|| RankingKey::for_mentor(&normalized_mentor));

            if let Some(key) = ranking_key {
                let better = match &best {
                    Some((current, _)) => key < *current,
                    None => true,
                };
                if better {
                    best = Some((key, normalized_mentor.clone()));
                }
            }

            evaluations.push(MentorEvaluation {
                index,
                normalized: Some(normalized_mentor),
                passed,
                trace,
                ranking_key,
            });
        }

        let winner = best.map(|(_, mentor)| mentor);
        if winner.is_none() {
            self.record_no_candidate();
        }
        AllocationResult {
            winner,
            evaluations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{AllocationConfig, RegCenter, RuleCode};
    use crate::providers::{InMemoryManagerCenters, InMemorySpecialSchools};
    use std::collections::{BTreeSet, HashMap};
    use test_case::test_case;

    fn engine_with(
        manager_centers: InMemoryManagerCenters,
        metrics: Option<Arc<ServiceMetrics>>,
    ) -> AllocationEngine {
        let policy = EligibilityPolicy::new(
            Arc::new(InMemorySpecialSchools::new(HashMap::from([(
                1403,
                BTreeSet::from([654321]),
            )]))),
            Arc::new(manager_centers),
            AllocationConfig::default(),
        );
        AllocationEngine::new(policy, metrics)
    }

    fn engine() -> AllocationEngine {
        engine_with(InMemoryManagerCenters::default(), None)
    }

    fn student() -> RawStudent {
        RawStudent {
            gender: Some("0".into()),
            group_code: Some("A".into()),
            reg_center: Some("0".into()),
            reg_status: Some("0".into()),
            edu_status: Some("1".into()),
            school_code: None,
            student_type: None,
            roster_year: None,
        }
    }

    fn mentor(id: i64, capacity: i64, load: i64) -> RawMentor {
        RawMentor {
            mentor_id: Some(id.to_string()),
            gender: Some("0".into()),
            allowed_groups: vec!["A".into()],
            allowed_centers: vec!["0".into()],
            capacity: Some(capacity.to_string()),
            current_load: Some(load.to_string()),
            is_active: Some("true".into()),
            mentor_type: Some("NORMAL".into()),
            special_schools: vec![],
            manager_id: None,
        }
    }

    #[test]
    fn tie_breaks_on_lower_mentor_id() {
        let engine = engine();
        let result = engine.evaluate(&student(), &[mentor(200, 4, 2), mentor(150, 4, 2)]);
        assert_eq!(result.winner.unwrap().mentor_id, 150);
    }

    #[test]
    fn lower_occupancy_wins_over_lower_id() {
        let engine = engine();
        let result = engine.evaluate(&student(), &[mentor(1, 4, 3), mentor(900, 4, 1)]);
        assert_eq!(result.winner.unwrap().mentor_id, 900);
    }

    #[test]
    fn passing_mentor_is_in_candidate_set() {
        let engine = engine();
        let result = engine.evaluate(&student(), &[mentor(7, 2, 1)]);
        assert!(result.evaluations[0].passed);
        assert!(result.evaluations[0].ranking_key.is_some());
        assert_eq!(result.winner.unwrap().mentor_id, 7);
    }

    #[test_case(1, 0 ; "last slot open")]
    #[test_case(1, 1 ; "exactly full")]
    fn capacity_boundary(capacity: i64, load: i64) {
        let engine = engine();
        let result = engine.evaluate(&student(), &[mentor(5, capacity, load)]);
        let expect_pass = load < capacity;
        assert_eq!(result.winner.is_some(), expect_pass);
    }

    #[test]
    fn no_candidate_increments_metric_and_returns_full_trace() {
        let metrics = Arc::new(ServiceMetrics::new("alloc_engine_test").unwrap());
        let engine = engine_with(InMemoryManagerCenters::default(), Some(Arc::clone(&metrics)));
        let mut m = mentor(9, 4, 2);
        m.gender = Some("1".into());
        let result = engine.evaluate(&student(), &[m]);
        assert!(result.winner.is_none());
        assert_eq!(result.evaluations.len(), 1);
        assert_eq!(result.evaluations[0].trace.len(), 8);
        assert_eq!(metrics.allocation_no_candidate_total.get(), 1);
    }

    #[test]
    fn unknown_manager_fails_gate_with_reason() {
        let engine = engine();
        let mut m = mentor(3, 4, 0);
        m.manager_id = Some("77".into());
        let result = engine.evaluate(&student(), &[m]);
        assert!(result.winner.is_none());
        let gate = result.evaluations[0]
            .trace
            .iter()
            .find(|entry| entry.code == RuleCode::ManagerCenterGate)
            .unwrap();
        assert!(!gate.passed);
        assert_eq!(
            gate.details.get("reason").and_then(|v| v.as_str()),
            Some("manager_centers_not_found")
        );
    }

    #[test]
    fn manager_gate_passes_when_center_allowed() {
        let centers = InMemoryManagerCenters::new(HashMap::from([(
            77,
            BTreeSet::from([RegCenter::new(0).unwrap()]),
        )]));
        let engine = engine_with(centers, None);
        let mut m = mentor(3, 4, 0);
        m.manager_id = Some("77".into());
        let result = engine.evaluate(&student(), &[m]);
        assert_eq!(result.winner.unwrap().mentor_id, 3);
    }

    #[test]
    fn student_normalization_failure_yields_single_trace() {
        let engine = engine();
        let mut s = student();
        s.gender = Some("9".into());
        let result = engine.evaluate(&s, &[mentor(1, 4, 0)]);
        assert!(result.winner.is_none());
        assert_eq!(result.evaluations.len(), 1);
        assert_eq!(result.evaluations[0].trace[0].code, RuleCode::GenderMatch);
    }

    #[test]
    fn graduate_never_assigned_to_school_mentor() {
        let engine = engine();
        let mut s = student();
        s.edu_status = Some("0".into());
        let mut m = mentor(4, 4, 0);
        m.mentor_type = Some("SCHOOL".into());
        m.special_schools = vec!["654321".into()];
        let result = engine.evaluate(&s, &[m]);
        assert!(result.winner.is_none());
    }

    #[test]
    fn batch_allocation_spreads_load_across_equals() {
        let engine = engine();
        let students = vec![student(), student(), student()];
        let mentors = vec![mentor(1, 2, 0), mentor(2, 2, 0)];
        let results = engine.evaluate_batch(&students, &mentors);

        // First pick ties to the lower id; the bumped load then routes the
        // second student to the other mentor.
        assert_eq!(results[0].winner.as_ref().unwrap().mentor_id, 1);
        assert_eq!(results[1].winner.as_ref().unwrap().mentor_id, 2);
        assert_eq!(results[2].winner.as_ref().unwrap().mentor_id, 1);
    }

    #[test]
    fn batch_allocation_stops_when_capacity_is_exhausted() {
        let engine = engine();
        let students = vec![student(), student(), student()];
        let mentors = vec![mentor(5, 2, 0)];
        let results = engine.evaluate_batch(&students, &mentors);

        assert!(results[0].winner.is_some());
        assert!(results[1].winner.is_some());
        assert!(results[2].winner.is_none());
        let capacity_entry = results[2].evaluations[0]
            .trace
            .iter()
            .find(|entry| entry.code == RuleCode::CapacityAvailable)
            .unwrap();
        assert!(!capacity_entry.passed);
    }

    #[test]
    fn batch_allocation_keeps_student_order_on_mixed_validity() {
        let engine = engine();
        let mut broken = student();
        broken.gender = Some("x".into());
        let students = vec![student(), broken, student()];
        let mentors = vec![mentor(9, 10, 0)];
        let results = engine.evaluate_batch(&students, &mentors);
        assert!(results[0].winner.is_some());
        assert!(results[1].winner.is_none());
        assert!(results[2].winner.is_some());
    }

    #[test]
    fn school_student_requires_rostered_school_mentor() {
        let engine = engine();
        let mut s = student();
        s.school_code = Some("654321".into());
        s.roster_year = Some("1403".into());

        let mut school_mentor = mentor(11, 4, 0);
        school_mentor.mentor_type = Some("SCHOOL".into());
        school_mentor.special_schools = vec!["654321".into()];

        let normal_mentor = mentor(12, 4, 0);

        let result = engine.evaluate(&s, &[school_mentor, normal_mentor]);
        assert_eq!(result.winner.unwrap().mentor_id, 11);
        assert!(!result.evaluations[1].passed);
    }
}
