// sabt-allocation: Eligibility rules and mentor ranking
//
// A student is matched against mentors through a fixed, ordered rule list;
// every evaluation leaves a trace. Among mentors passing all rules the
// winner minimizes (occupancy_ratio, current_load, mentor_id).

pub mod contracts;
pub mod engine;
pub mod policy;
pub mod providers;
pub mod rules;

pub use contracts::{
    AllocationConfig, Gender, MentorType, NormalizationError, NormalizedMentor, NormalizedStudent,
    RankingKey, RawMentor, RawStudent, RegCenter, RegStatus, RuleCode, TraceEntry,
};
pub use engine::{AllocationEngine, AllocationResult, MentorEvaluation};
pub use policy::EligibilityPolicy;
pub use providers::{
    InMemoryManagerCenters, InMemorySpecialSchools, ManagerCentersProvider, SpecialSchoolsProvider,
};
