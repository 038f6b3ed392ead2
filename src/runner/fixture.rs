//! Scripted test runner and checker.
//!
//! Both are driven by a JSON fixture given as plugin options, either inline or
//! as a path to a file (relative to the worker's working directory). They
//! exist for demos and end-to-end tests of the worker pool: a fixture can make
//! a mutant get killed, hang, loop until the hit limit, crash the worker,
//! exhaust its memory, report an error or throw.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::checker::{CheckResult, CheckResults, Checker};
use super::test_runner::{
    DryRunOptions, DryRunResult, MutantCoverage, MutantRunOptions, MutantRunResult, TestResult,
    TestRunner, TestStatus, to_mutant_run_result,
};
use crate::config::CoverageAnalysis;
use crate::mutant::{Mutant, MutantId, TestId};
use crate::worker::value::{ErrorValue, Value};

/// Exit code of a worker crashed on purpose.
pub const CRASH_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureTest {
    pub id: TestId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_time_spent_ms")]
    pub time_spent_ms: u64,
    /// Fail this test during the dry run.
    #[serde(default)]
    pub fails_dry_run: bool,
}

fn default_time_spent_ms() -> u64 {
    1
}

/// Script of the fixture test runner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerFixture {
    pub tests: Vec<FixtureTest>,
    /// Coverage reported by the dry run, unless coverage analysis is off.
    pub coverage: Option<MutantCoverage>,
    /// Tests that fail while a mutant is active.
    pub kills: BTreeMap<MutantId, Vec<TestId>>,
    /// Mutants whose run never finishes.
    pub hangs: BTreeSet<MutantId>,
    /// Mutants that loop until the hit limit stops them.
    pub infinite_loops: BTreeSet<MutantId>,
    /// Mutants that make the worker exit abruptly.
    pub crashes: BTreeSet<MutantId>,
    /// Mutants that make the worker die of an allocation failure.
    pub out_of_memory: BTreeSet<MutantId>,
    /// Mutants the runner reports as `error`.
    pub errors: BTreeSet<MutantId>,
    /// Mutants whose run throws inside the worker.
    pub rejects: BTreeSet<MutantId>,
    /// Report the dry run itself as errored.
    pub dry_run_error: Option<String>,
    /// Mutants whose run allocates this many MiB and then never finishes.
    pub memory_hogs: BTreeMap<MutantId, usize>,
    /// Extra wall-clock time of every mutant run.
    pub run_delay_ms: u64,
    /// Extra wall-clock time of the dry run.
    pub dry_run_delay_ms: u64,
    /// Refuse to start more runners than this, counted across worker
    /// processes through marker files in `instance_dir`.
    pub max_instances: Option<usize>,
    pub instance_dir: Option<PathBuf>,
}

/// Read fixture options: `null` means empty, a string is a file path.
fn load_fixture<T: DeserializeOwned + Default>(options: Value) -> Result<T, ErrorValue> {
    match options {
        Value::Null => Ok(T::default()),
        Value::String(path) => {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                ErrorValue::new("FixtureError", format!("Cannot read fixture {}: {}", path, e))
            })?;
            serde_json::from_str(&contents).map_err(|e| {
                ErrorValue::new("FixtureError", format!("Invalid fixture {}: {}", path, e))
            })
        }
        other => other
            .decode()
            .map_err(|e| ErrorValue::new("FixtureError", format!("Invalid fixture: {}", e))),
    }
}

/// Take the first free instance number below `max`.
fn claim_instance(dir: &Path, max: usize) -> Result<usize, ErrorValue> {
    for instance in 0..max {
        let marker = dir.join(format!("runner-{}", instance));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
        {
            Ok(_) => return Ok(instance),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(ErrorValue::new(
                    "FixtureError",
                    format!("Cannot create {}: {}", marker.display(), e),
                ));
            }
        }
    }
    Err(ErrorValue::new(
        "FixtureError",
        format!("No more than {} test runner(s) may start", max),
    ))
}

pub struct FixtureTestRunner {
    fixture: RunnerFixture,
}

impl FixtureTestRunner {
    pub fn new(options: Value) -> Result<Self, ErrorValue> {
        let fixture: RunnerFixture = load_fixture(options)?;
        if let (Some(max), Some(dir)) = (fixture.max_instances, &fixture.instance_dir) {
            let instance = claim_instance(dir, max)?;
            debug!(instance, max, "Claimed fixture runner instance");
        }
        Ok(Self::from_fixture(fixture))
    }

    pub fn from_fixture(fixture: RunnerFixture) -> Self {
        Self { fixture }
    }

    fn selected_tests<'a>(&'a self, filter: &'a Option<Vec<TestId>>) -> Vec<&'a FixtureTest> {
        match filter {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.fixture.tests.iter().find(|t| &t.id == id))
                .collect(),
            None => self.fixture.tests.iter().collect(),
        }
    }

    fn coverage(&self, analysis: CoverageAnalysis) -> Option<MutantCoverage> {
        let coverage = self.fixture.coverage.as_ref()?;
        match analysis {
            CoverageAnalysis::Off => None,
            CoverageAnalysis::PerTest => Some(coverage.clone()),
            // Without per-test detail every hit counts as static.
            CoverageAnalysis::All => {
                let mut all = coverage.static_coverage.clone();
                for hits in coverage.per_test.values() {
                    for (mutant, count) in hits {
                        *all.entry(mutant.clone()).or_default() += count;
                    }
                }
                Some(MutantCoverage {
                    static_coverage: all,
                    per_test: BTreeMap::new(),
                })
            }
        }
    }
}

impl TestRunner for FixtureTestRunner {
    async fn dry_run(&self, options: DryRunOptions) -> Result<DryRunResult, ErrorValue> {
        if self.fixture.dry_run_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.dry_run_delay_ms)).await;
        }
        if let Some(message) = &self.fixture.dry_run_error {
            return Ok(DryRunResult::Error {
                error_message: message.clone(),
            });
        }

        let tests: Vec<TestResult> = self
            .selected_tests(&options.test_filter)
            .into_iter()
            .map(|test| TestResult {
                id: test.id.clone(),
                name: test.name.clone().unwrap_or_else(|| test.id.clone()),
                status: if test.fails_dry_run {
                    TestStatus::Failed
                } else {
                    TestStatus::Success
                },
                time_spent_ms: test.time_spent_ms,
                failure_message: test
                    .fails_dry_run
                    .then(|| format!("{} failed without any mutant active", test.id)),
            })
            .collect();

        info!(
            tests = tests.len(),
            coverage = %options.coverage_analysis,
            "Fixture dry run finished"
        );
        Ok(DryRunResult::Complete {
            tests,
            mutant_coverage: self.coverage(options.coverage_analysis),
        })
    }

    async fn mutant_run(&self, options: MutantRunOptions) -> Result<MutantRunResult, ErrorValue> {
        let id = &options.active_mutant;
        debug!(mutant_id = %id, "Fixture mutant run");

        if self.fixture.run_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.run_delay_ms)).await;
        }

        if self.fixture.crashes.contains(id) {
            std::process::exit(CRASH_EXIT_CODE);
        }
        if self.fixture.out_of_memory.contains(id) {
            eprintln!("memory allocation of 17179869184 bytes failed");
            std::process::abort();
        }
        if let Some(&mib) = self.fixture.memory_hogs.get(id) {
            let hog = vec![1u8; mib * 1024 * 1024];
            std::hint::black_box(&hog);
            return std::future::pending().await;
        }
        if self.fixture.hangs.contains(id) {
            return std::future::pending().await;
        }
        if self.fixture.infinite_loops.contains(id) {
            return match options.hit_limit {
                Some(limit) => Ok(MutantRunResult::Timeout {
                    reason: Some(format!("Hit limit reached ({}/{})", limit + 1, limit)),
                }),
                None => std::future::pending().await,
            };
        }
        if self.fixture.errors.contains(id) {
            return Ok(MutantRunResult::Error {
                error_message: format!("Mutant {} could not be activated", id),
            });
        }
        if self.fixture.rejects.contains(id) {
            return Err(ErrorValue::new(
                "TypeError",
                format!("Cannot read properties of undefined (mutant {})", id),
            ));
        }

        let killers = self.fixture.kills.get(id);
        let mut results = Vec::new();
        for test in self.selected_tests(&options.test_filter) {
            let failed = killers.is_some_and(|k| k.contains(&test.id));
            results.push(TestResult {
                id: test.id.clone(),
                name: test.name.clone().unwrap_or_else(|| test.id.clone()),
                status: if failed {
                    TestStatus::Failed
                } else {
                    TestStatus::Success
                },
                time_spent_ms: test.time_spent_ms,
                failure_message: failed.then(|| format!("Mutant {} was detected", id)),
            });
            if failed && !options.disable_bail {
                break;
            }
        }
        Ok(to_mutant_run_result(&results, options.disable_bail))
    }
}

/// Script of the fixture checker.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckerFixture {
    /// Mutants rejected as compile errors, with the reason.
    pub compile_errors: BTreeMap<MutantId, String>,
    /// Mutants whose check throws inside the worker.
    pub rejects: BTreeSet<MutantId>,
}

pub struct FixtureChecker {
    fixture: CheckerFixture,
}

impl FixtureChecker {
    pub fn new(options: Value) -> Result<Self, ErrorValue> {
        Ok(Self::from_fixture(load_fixture(options)?))
    }

    pub fn from_fixture(fixture: CheckerFixture) -> Self {
        Self { fixture }
    }
}

impl Checker for FixtureChecker {
    async fn check(&self, mutants: Vec<Mutant>) -> Result<CheckResults, ErrorValue> {
        if let Some(mutant) = mutants.iter().find(|m| self.fixture.rejects.contains(&m.id)) {
            return Err(ErrorValue::new(
                "Error",
                format!("Checker could not process {}", mutant.file_name),
            ));
        }

        Ok(mutants
            .into_iter()
            .map(|mutant| {
                let result = match self.fixture.compile_errors.get(&mutant.id) {
                    Some(reason) => CheckResult::compile_error(reason.clone()),
                    None => CheckResult::passed(),
                };
                (mutant.id, result)
            })
            .collect())
    }
}
