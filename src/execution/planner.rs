//! Per-mutant test plans: which tests to run, within what timeout.

use crate::config::{CoverageAnalysis, StryxOptions};
use crate::coverage::TestCoverage;
use crate::mutant::{Mutant, MutantResult, MutantStatus, TestId};
use crate::runner::test_runner::MutantRunOptions;

/// What to do with one mutant.
#[derive(Debug, Clone, PartialEq)]
pub enum MutantPlan {
    /// The mutant has its final status without any worker call.
    EarlyResult(MutantResult),
    /// The mutant must be run on a test runner.
    Run(MutantRunPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutantRunPlan {
    pub mutant: Mutant,
    pub options: MutantRunOptions,
    /// Tests known to cover the mutant, for reporting.
    pub covered_by: Vec<TestId>,
}

/// Wall-clock budget of one mutant run.
pub fn mutant_timeout_ms(baseline_ms: u64, timeout_factor: f64, timeout_ms: u64) -> u64 {
    (baseline_ms as f64 * timeout_factor).round() as u64 + timeout_ms
}

/// Plan the run of one mutant.
///
/// Ignored mutants are settled right away. With coverage, a mutant nothing
/// covers is `NoCoverage`; otherwise the test subset is the covering set,
/// except for static mutants (unless `ignoreStatic`) and the `all` mode,
/// which run the full suite.
pub fn plan_mutant(
    mutant: &Mutant,
    coverage: &TestCoverage,
    baseline_ms: u64,
    options: &StryxOptions,
) -> MutantPlan {
    if mutant.is_ignored() {
        let mut result = MutantResult::new(mutant, MutantStatus::Ignored);
        result.status_reason = mutant.status_reason.clone();
        return MutantPlan::EarlyResult(result);
    }

    let mut run_options = MutantRunOptions {
        active_mutant: mutant.id.clone(),
        timeout_ms: mutant_timeout_ms(baseline_ms, options.timeout_factor, options.timeout_ms),
        test_filter: None,
        disable_bail: options.disable_bail,
        hit_limit: None,
    };

    if options.coverage_analysis == CoverageAnalysis::Off || !coverage.has_coverage() {
        return run(mutant, run_options, Vec::new());
    }

    let hits = coverage.hits(&mutant.id);
    if hits > 0 {
        run_options.hit_limit = Some(hits.saturating_mul(options.hit_limit_factor));
    }
    let covered_by = coverage.covering_tests(&mutant.id);
    let is_static = mutant.is_static || coverage.has_static_coverage(&mutant.id);

    if is_static && !options.ignore_static {
        return run(mutant, run_options, covered_by);
    }

    match options.coverage_analysis {
        CoverageAnalysis::All if hits == 0 => no_coverage(mutant),
        CoverageAnalysis::All => run(mutant, run_options, covered_by),
        _ if covered_by.is_empty() => no_coverage(mutant),
        _ => {
            run_options.test_filter = Some(covered_by.clone());
            run(mutant, run_options, covered_by)
        }
    }
}

fn run(mutant: &Mutant, options: MutantRunOptions, covered_by: Vec<TestId>) -> MutantPlan {
    MutantPlan::Run(MutantRunPlan {
        mutant: mutant.clone(),
        options,
        covered_by,
    })
}

fn no_coverage(mutant: &Mutant) -> MutantPlan {
    MutantPlan::EarlyResult(MutantResult::new(mutant, MutantStatus::NoCoverage))
}
