//! Provider interfaces for manager centers and special schools

use std::collections::{BTreeSet, HashMap};

use crate::contracts::RegCenter;

/// Allowed centers per manager; `None` when the manager is unknown
pub trait ManagerCentersProvider: Send + Sync {
    fn allowed_centers(&self, manager_id: i64) -> Option<BTreeSet<RegCenter>>;
}

/// Special school codes per academic year; `None` when the roster is missing
pub trait SpecialSchoolsProvider: Send + Sync {
    fn special_schools(&self, year: i64) -> Option<BTreeSet<i64>>;
}

/// Map-backed provider for tests and CSV-fed runs
#[derive(Debug, Default)]
pub struct InMemoryManagerCenters {
    mapping: HashMap<i64, BTreeSet<RegCenter>>,
}

impl InMemoryManagerCenters {
    pub fn new(mapping: HashMap<i64, BTreeSet<RegCenter>>) -> Self {
        Self { mapping }
    }
}

impl ManagerCentersProvider for InMemoryManagerCenters {
    fn allowed_centers(&self, manager_id: i64) -> Option<BTreeSet<RegCenter>> {
        self.mapping.get(&manager_id).cloned()
    }
}

/// Map-backed roster of special schools
#[derive(Debug, Default)]
pub struct InMemorySpecialSchools {
    mapping: HashMap<i64, BTreeSet<i64>>,
}

impl InMemorySpecialSchools {
    pub fn new(mapping: HashMap<i64, BTreeSet<i64>>) -> Self {
        Self { mapping }
    }
}

impl SpecialSchoolsProvider for InMemorySpecialSchools {
    fn special_schools(&self, year: i64) -> Option<BTreeSet<i64>> {
        self.mapping.get(&year).cloned()
    }
}
