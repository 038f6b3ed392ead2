//! The initial test run establishing the baseline.

use std::time::{Duration, Instant};

use tracing::{info, instrument};

use super::TestRunnerPool;
use crate::config::{CoverageAnalysis, StryxOptions};
use crate::coverage::TestCoverage;
use crate::error::{Result, StryxError};
use crate::runner::test_runner::{DryRunOptions, DryRunResult, MutantCoverage, TestResult, TestStatus};

/// Baseline derived from a successful dry run.
#[derive(Debug)]
pub struct DryRunOutcome {
    pub tests: Vec<TestResult>,
    pub coverage: TestCoverage,
    /// Wall-clock time of the dry run call, the base of every mutant timeout.
    pub baseline_ms: u64,
}

/// Run the whole suite once without an active mutant.
#[instrument(skip_all, fields(coverage_analysis = %options.coverage_analysis))]
pub async fn run_dry_run(pool: &TestRunnerPool, options: &StryxOptions) -> Result<DryRunOutcome> {
    let timeout = options.dry_run_timeout();
    let dry_run_options = DryRunOptions {
        coverage_analysis: options.coverage_analysis,
        timeout_ms: timeout.as_millis() as u64,
        test_filter: None,
    };

    info!("Starting initial test run");
    let (result, elapsed) = pool
        .schedule(move |runner| async move {
            let started = Instant::now();
            let result = runner.dry_run(dry_run_options, timeout).await?;
            Ok::<_, StryxError>((result, started.elapsed()))
        })
        .await
        .map_err(|e| match e {
            e if e.is_setup_failure() => e,
            StryxError::CallTimeout { .. } => StryxError::DryRun(format!(
                "Initial test run timed out after {} minutes",
                options.dry_run_timeout_minutes
            )),
            e => StryxError::DryRun(format!("Initial test run failed: {}", e)),
        })?;

    let (tests, mutant_coverage) = validate_dry_run(result, options.allow_empty)?;
    if options.coverage_analysis != CoverageAnalysis::Off && mutant_coverage.is_none() {
        info!("Test runner reported no coverage; every mutant runs the full suite");
    }
    let coverage = TestCoverage::from_dry_run(&tests, mutant_coverage.as_ref());
    let net_ms: u64 = tests.iter().map(|t| t.time_spent_ms).sum();
    let baseline_ms = baseline_with_overhead(net_ms, elapsed);

    info!(
        tests = tests.len(),
        net_ms,
        overhead_ms = baseline_ms - net_ms,
        baseline_ms,
        "Initial test run succeeded"
    );

    Ok(DryRunOutcome {
        tests,
        coverage,
        baseline_ms,
    })
}

/// Test time plus the runner's own overhead, measured around the call.
///
/// Falls back to the reported test time if that is larger.
pub fn baseline_with_overhead(net_ms: u64, elapsed: Duration) -> u64 {
    net_ms.max(elapsed.as_millis() as u64)
}

/// Accept only a complete dry run without failing tests.
///
/// An empty test list is rejected unless `allow_empty` is set.
pub fn validate_dry_run(
    result: DryRunResult,
    allow_empty: bool,
) -> Result<(Vec<TestResult>, Option<MutantCoverage>)> {
    match result {
        DryRunResult::Complete {
            tests,
            mutant_coverage,
        } => {
            let failed: Vec<&TestResult> = tests
                .iter()
                .filter(|t| t.status == TestStatus::Failed)
                .collect();
            if !failed.is_empty() {
                let details: Vec<String> = failed
                    .iter()
                    .map(|t| match &t.failure_message {
                        Some(message) => format!("  {}: {}", t.name, message),
                        None => format!("  {}", t.name),
                    })
                    .collect();
                return Err(StryxError::DryRun(format!(
                    "There were failed tests in the initial test run:\n{}",
                    details.join("\n")
                )));
            }
            if tests.is_empty() && !allow_empty {
                return Err(StryxError::DryRun(
                    "No tests were executed. Set allowEmpty to run anyway".to_string(),
                ));
            }
            Ok((tests, mutant_coverage))
        }
        DryRunResult::Error { error_message } => Err(StryxError::DryRun(format!(
            "Something went wrong in the initial test run: {}",
            error_message
        ))),
        DryRunResult::Timeout { reason } => Err(StryxError::DryRun(match reason {
            Some(reason) => format!("Initial test run timed out: {}", reason),
            None => "Initial test run timed out".to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(tests: Vec<TestResult>) -> DryRunResult {
        DryRunResult::Complete {
            tests,
            mutant_coverage: None,
        }
    }

    #[test]
    fn test_failed_tests_are_listed() {
        let mut broken = TestResult::new("math adds", TestStatus::Failed);
        broken.failure_message = Some("expected 3, got 4".to_string());
        let result = complete(vec![TestResult::new("math subtracts", TestStatus::Success), broken]);

        let err = validate_dry_run(result, false).unwrap_err();
        assert!(matches!(err, StryxError::DryRun(_)));
        let message = err.to_string();
        assert!(message.contains("math adds: expected 3, got 4"));
        assert!(!message.contains("math subtracts"));
    }

    #[test]
    fn test_empty_suite_needs_allow_empty() {
        assert!(validate_dry_run(complete(vec![]), false).is_err());
        let (tests, coverage) = validate_dry_run(complete(vec![]), true).unwrap();
        assert!(tests.is_empty());
        assert!(coverage.is_none());
    }

    #[test]
    fn test_error_and_timeout_are_fatal() {
        let err = validate_dry_run(
            DryRunResult::Error {
                error_message: "Cannot find module 'jest'".to_string(),
            },
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cannot find module 'jest'"));

        let err = validate_dry_run(DryRunResult::Timeout { reason: None }, true).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_skipped_tests_are_accepted() {
        let result = complete(vec![
            TestResult::new("a", TestStatus::Success),
            TestResult::new("b", TestStatus::Skipped),
        ]);
        let (tests, _) = validate_dry_run(result, false).unwrap();
        assert_eq!(tests.len(), 2);
    }

    #[test]
    fn test_baseline_includes_overhead() {
        // Tests report 2ms but the call took 350ms
        assert_eq!(baseline_with_overhead(2, Duration::from_millis(350)), 350);
        assert_eq!(baseline_with_overhead(0, Duration::from_millis(40)), 40);
        // A runner reporting more than the wall clock keeps its number
        assert_eq!(baseline_with_overhead(500, Duration::from_millis(120)), 500);
    }
}
