//! Per-mutant test coverage derived from a dry run.
//!
//! Answers "which tests cover mutant X" and "how often was X hit" while
//! mutants are scheduled. The model is built once from the dry run and only
//! ever grows afterwards, so concurrent readers never observe a removal.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::mutant::{MutantId, TestId};
use crate::runner::test_runner::{CoverageData, MutantCoverage, TestResult};

#[derive(Debug, Default)]
struct CoverageState {
    tests_by_id: BTreeMap<TestId, TestResult>,
    coverage_by_mutant_id: BTreeMap<MutantId, BTreeSet<TestId>>,
    hits_by_mutant_id: BTreeMap<MutantId, u64>,
    static_coverage: CoverageData,
}

/// Coverage lookups for the scheduler.
#[derive(Debug, Default)]
pub struct TestCoverage {
    state: RwLock<CoverageState>,
    has_coverage: bool,
}

impl TestCoverage {
    /// Build the model from a dry run's tests and optional coverage report.
    ///
    /// Hits are summed over static and per-test counts. A test covers a
    /// mutant when it hit it, or when the mutant has static hits and the test
    /// reported the mutant at all. Coverage of tests the dry run did not
    /// report is dropped with a warning.
    pub fn from_dry_run(tests: &[TestResult], coverage: Option<&MutantCoverage>) -> Self {
        let mut state = CoverageState {
            tests_by_id: tests.iter().map(|t| (t.id.clone(), t.clone())).collect(),
            ..Default::default()
        };

        if let Some(coverage) = coverage {
            for (mutant_id, &hits) in &coverage.static_coverage {
                *state.hits_by_mutant_id.entry(mutant_id.clone()).or_default() += hits;
                state.coverage_by_mutant_id.entry(mutant_id.clone()).or_default();
            }
            state.static_coverage = coverage.static_coverage.clone();

            for (test_id, counts) in &coverage.per_test {
                if !state.tests_by_id.contains_key(test_id) {
                    warn!(
                        test_id = %test_id,
                        "Found coverage for test {} which was not reported by the dry run, ignoring it",
                        test_id
                    );
                    continue;
                }
                for (mutant_id, &hits) in counts {
                    *state.hits_by_mutant_id.entry(mutant_id.clone()).or_default() += hits;
                    let covering = state.coverage_by_mutant_id.entry(mutant_id.clone()).or_default();
                    let statically_hit = coverage.static_coverage.get(mutant_id).copied().unwrap_or(0) > 0;
                    if hits > 0 || statically_hit {
                        covering.insert(test_id.clone());
                    }
                }
            }
        }

        Self {
            state: RwLock::new(state),
            has_coverage: coverage.is_some(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CoverageState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CoverageState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the dry run reported coverage at all.
    pub fn has_coverage(&self) -> bool {
        self.has_coverage
    }

    /// Whether the mutant was hit outside of any test.
    pub fn has_static_coverage(&self, mutant_id: &str) -> bool {
        self.read()
            .static_coverage
            .get(mutant_id)
            .is_some_and(|&hits| hits > 0)
    }

    /// Tests covering the mutant, in id order.
    pub fn covering_tests(&self, mutant_id: &str) -> Vec<TestId> {
        self.read()
            .coverage_by_mutant_id
            .get(mutant_id)
            .map(|tests| tests.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total hits of the mutant during the dry run.
    pub fn hits(&self, mutant_id: &str) -> u64 {
        self.read()
            .hits_by_mutant_id
            .get(mutant_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn test_count(&self) -> usize {
        self.read().tests_by_id.len()
    }

    pub fn test(&self, test_id: &str) -> Option<TestResult> {
        self.read().tests_by_id.get(test_id).cloned()
    }

    /// Register a test discovered after the dry run.
    pub fn add_test(&self, test: TestResult) {
        self.write().tests_by_id.insert(test.id.clone(), test);
    }

    /// Add tests to a mutant's covering set; unknown test ids are skipped.
    pub fn add_coverage(&self, mutant_id: &str, test_ids: impl IntoIterator<Item = TestId>) {
        let mut state = self.write();
        let known: Vec<TestId> = test_ids
            .into_iter()
            .filter(|id| state.tests_by_id.contains_key(id))
            .collect();
        state
            .coverage_by_mutant_id
            .entry(mutant_id.to_string())
            .or_default()
            .extend(known);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::test_runner::TestStatus;

    fn tests(ids: &[&str]) -> Vec<TestResult> {
        ids.iter()
            .map(|id| TestResult::new(*id, TestStatus::Success))
            .collect()
    }

    fn counts(entries: &[(&str, u64)]) -> CoverageData {
        entries.iter().map(|(id, n)| (id.to_string(), *n)).collect()
    }

    fn sample_coverage() -> MutantCoverage {
        MutantCoverage {
            static_coverage: counts(&[("1", 1)]),
            per_test: [
                ("spec1", counts(&[("1", 2), ("2", 100)])),
                ("spec2", counts(&[("2", 100)])),
                ("spec3", counts(&[("1", 3), ("2", 0)])),
            ]
            .into_iter()
            .map(|(id, c)| (id.to_string(), c))
            .collect(),
        }
    }

    #[test]
    fn test_aggregates_static_and_per_test_hits() {
        let coverage =
            TestCoverage::from_dry_run(&tests(&["spec1", "spec2", "spec3"]), Some(&sample_coverage()));

        assert!(coverage.has_coverage());
        assert_eq!(coverage.covering_tests("1"), vec!["spec1", "spec3"]);
        assert_eq!(coverage.covering_tests("2"), vec!["spec1", "spec2"]);
        assert_eq!(coverage.hits("1"), 6);
        assert_eq!(coverage.hits("2"), 200);
        assert!(coverage.has_static_coverage("1"));
        assert!(!coverage.has_static_coverage("2"));
    }

    #[test]
    fn test_static_hit_adds_reporting_tests() {
        let report = MutantCoverage {
            static_coverage: counts(&[("1", 4)]),
            per_test: [("spec1".to_string(), counts(&[("1", 0)]))].into(),
        };
        let coverage = TestCoverage::from_dry_run(&tests(&["spec1"]), Some(&report));
        assert_eq!(coverage.covering_tests("1"), vec!["spec1"]);
        assert_eq!(coverage.hits("1"), 4);
    }

    #[test]
    fn test_unknown_test_is_dropped() {
        let coverage = TestCoverage::from_dry_run(&tests(&["spec1", "spec3"]), Some(&sample_coverage()));

        assert_eq!(coverage.covering_tests("2"), vec!["spec1"]);
        assert_eq!(coverage.hits("2"), 100);
        assert!(coverage.test("spec2").is_none());
    }

    #[test]
    fn test_without_coverage() {
        let coverage = TestCoverage::from_dry_run(&tests(&["spec1"]), None);
        assert!(!coverage.has_coverage());
        assert!(coverage.covering_tests("1").is_empty());
        assert_eq!(coverage.hits("1"), 0);
        assert!(!coverage.has_static_coverage("1"));

        let empty = TestCoverage::from_dry_run(&[], Some(&MutantCoverage::default()));
        assert!(empty.has_coverage());
        assert_eq!(empty.test_count(), 0);
    }

    #[test]
    fn test_add_coverage_is_union_of_known_tests() {
        let coverage = TestCoverage::from_dry_run(&tests(&["spec1", "spec2", "spec3"]), Some(&sample_coverage()));

        coverage.add_coverage("2", ["spec3".to_string(), "ghost".to_string()]);
        assert_eq!(coverage.covering_tests("2"), vec!["spec1", "spec2", "spec3"]);

        coverage.add_test(TestResult::new("spec4", TestStatus::Success));
        coverage.add_coverage("3", ["spec4".to_string()]);
        assert_eq!(coverage.covering_tests("3"), vec!["spec4"]);
        assert_eq!(coverage.test_count(), 4);
    }
}
