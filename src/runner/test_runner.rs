//! Test-runner call shapes and the status derivation shared by both sides.

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::config::CoverageAnalysis;
use crate::mutant::{MutantId, TestId};
use crate::worker::value::ErrorValue;

/// Outcome of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: TestId,
    pub name: String,
    pub status: TestStatus,
    #[serde(default)]
    pub time_spent_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl TestResult {
    pub fn new(id: impl Into<String>, status: TestStatus) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status,
            time_spent_ms: 0,
            failure_message: None,
        }
    }
}

/// Hit counts per mutant.
pub type CoverageData = BTreeMap<MutantId, u64>;

/// Coverage reported by a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutantCoverage {
    /// Hits recorded outside of any test, e.g. at module load.
    #[serde(default, rename = "static")]
    pub static_coverage: CoverageData,
    #[serde(default)]
    pub per_test: BTreeMap<TestId, CoverageData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DryRunResult {
    Complete {
        tests: Vec<TestResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mutant_coverage: Option<MutantCoverage>,
    },
    Error {
        error_message: String,
    },
    Timeout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunOptions {
    pub coverage_analysis: CoverageAnalysis,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_filter: Option<Vec<TestId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutantRunOptions {
    /// The mutant the worker must activate for this run.
    pub active_mutant: MutantId,
    pub timeout_ms: u64,
    /// Tests to run; `None` runs the whole suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_filter: Option<Vec<TestId>>,
    #[serde(default)]
    pub disable_bail: bool,
    /// Abort once the mutant was hit this many times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum MutantRunResult {
    Killed {
        failure_message: String,
        killed_by: Vec<TestId>,
        nr_of_tests: usize,
    },
    Survived {
        nr_of_tests: usize,
    },
    Timeout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        error_message: String,
    },
}

/// Derive a mutant-run verdict from the per-test outcomes of a run.
///
/// Any failing test kills the mutant. `killed_by` holds the first failing test,
/// or every failing test with `disable_bail`. Skipped tests are not counted.
pub fn to_mutant_run_result(tests: &[TestResult], disable_bail: bool) -> MutantRunResult {
    let nr_of_tests = tests
        .iter()
        .filter(|t| t.status != TestStatus::Skipped)
        .count();
    let mut failed = tests.iter().filter(|t| t.status == TestStatus::Failed);

    let Some(first) = failed.next() else {
        return MutantRunResult::Survived { nr_of_tests };
    };

    let mut killed_by = vec![first.id.clone()];
    if disable_bail {
        killed_by.extend(failed.map(|t| t.id.clone()));
    }
    MutantRunResult::Killed {
        failure_message: first
            .failure_message
            .clone()
            .unwrap_or_else(|| format!("{} failed", first.name)),
        killed_by,
        nr_of_tests,
    }
}

/// A test runner hosted inside a worker process.
pub trait TestRunner: Send + Sync + 'static {
    fn dry_run(
        &self,
        options: DryRunOptions,
    ) -> impl Future<Output = Result<DryRunResult, ErrorValue>> + Send;

    fn mutant_run(
        &self,
        options: MutantRunOptions,
    ) -> impl Future<Output = Result<MutantRunResult, ErrorValue>> + Send;
}
