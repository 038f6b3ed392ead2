//! The per-mutant control loop.
//!
//! Every mutant becomes one task. Tasks wait for a worker through the pools,
//! so the number of mutants in flight is bounded by the released tokens alone.
//!
//! ```text
//!   plan ──> early result (ignored / no coverage)
//!     │
//!     v
//!   check (optional) ──> compile error
//!     │
//!     v
//!   mutant run ──> crash? ──retry──> fresh worker
//!     │
//!     v
//!   verdict ──> event stream
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::events::{MutationEvent, RunSummary};
use super::planner::{MutantPlan, MutantRunPlan, plan_mutant};
use super::{CheckerPool, TestRunnerPool};
use crate::concurrency::ConcurrencyTokenProvider;
use crate::config::StryxOptions;
use crate::coverage::TestCoverage;
use crate::error::{Result, StryxError};
use crate::mutant::{Mutant, MutantResult, MutantStatus, TestId};
use crate::runner::checker::CheckStatus;
use crate::runner::test_runner::MutantRunResult;

/// Extra attempts on a fresh worker after a crash.
const MAX_CRASH_RETRIES: usize = 2;

/// Drives every mutant to a final status.
pub struct MutationTestExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    options: StryxOptions,
    test_runners: TestRunnerPool,
    checkers: Option<CheckerPool>,
    provider: Arc<ConcurrencyTokenProvider>,
    coverage: Arc<TestCoverage>,
    baseline_ms: u64,
    checks_remaining: AtomicUsize,
}

impl MutationTestExecutor {
    pub fn new(
        options: StryxOptions,
        test_runners: TestRunnerPool,
        checkers: Option<CheckerPool>,
        provider: Arc<ConcurrencyTokenProvider>,
        coverage: Arc<TestCoverage>,
        baseline_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                options,
                test_runners,
                checkers,
                provider,
                coverage,
                baseline_ms,
                checks_remaining: AtomicUsize::new(0),
            }),
        }
    }

    /// Test every mutant; results come back in input order.
    ///
    /// A setup failure (a worker that cannot spawn or initialize) aborts the
    /// run. Every other fault is contained in the status of its mutant.
    #[instrument(skip_all, fields(mutants = mutants.len()))]
    pub async fn execute(
        &self,
        mutants: Vec<Mutant>,
        events: Option<UnboundedSender<MutationEvent>>,
    ) -> Result<Vec<MutantResult>> {
        let inner = &self.inner;
        let plans: Vec<MutantPlan> = mutants
            .iter()
            .map(|m| plan_mutant(m, &inner.coverage, inner.baseline_ms, &inner.options))
            .collect();

        let to_run = plans
            .iter()
            .filter(|p| matches!(p, MutantPlan::Run(_)))
            .count();
        info!(
            total = plans.len(),
            to_run,
            settled = plans.len() - to_run,
            "Planned mutants"
        );

        if inner.checkers.is_some() {
            inner.checks_remaining.store(to_run, Ordering::SeqCst);
            if to_run == 0 {
                inner.release_checkers();
            }
        }

        let emit = |event: MutationEvent| {
            if let Some(events) = &events {
                let _ = events.send(event);
            }
        };

        let mut results: Vec<Option<MutantResult>> = vec![None; plans.len()];
        let mut tasks = JoinSet::new();
        for (index, plan) in plans.into_iter().enumerate() {
            match plan {
                MutantPlan::EarlyResult(result) => {
                    debug!(mutant_id = %result.id, status = %result.status, "Mutant settled without a run");
                    emit(MutationEvent::MutantTested(result.clone()));
                    results[index] = Some(result);
                }
                MutantPlan::Run(run) => {
                    let inner = Arc::clone(inner);
                    tasks.spawn(async move { (index, inner.test_mutant(run).await) });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            match outcome {
                Ok(result) => {
                    emit(MutationEvent::MutantTested(result.clone()));
                    results[index] = Some(result);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let results: Vec<MutantResult> = results.into_iter().flatten().collect();
        let summary = RunSummary::from_results(&results);
        info!(
            killed = summary.killed,
            survived = summary.survived,
            timeout = summary.timeout,
            no_coverage = summary.no_coverage,
            "All mutants tested"
        );
        emit(MutationEvent::AllMutantsTested(summary));
        Ok(results)
    }
}

impl ExecutorInner {
    async fn test_mutant(&self, run: MutantRunPlan) -> Result<MutantResult> {
        if let Some(checkers) = &self.checkers {
            let verdict = self.check_mutant(checkers, &run.mutant).await;
            if self.checks_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.release_checkers();
            }
            if let Some(result) = verdict? {
                return Ok(result);
            }
        }
        self.run_mutant(run).await
    }

    /// `Some` settles the mutant without running it.
    async fn check_mutant(
        &self,
        checkers: &CheckerPool,
        mutant: &Mutant,
    ) -> Result<Option<MutantResult>> {
        let batch = vec![mutant.clone()];
        let outcome = checkers
            .schedule(move |checker| async move { checker.check(&batch).await })
            .await;

        match outcome {
            Ok(verdicts) => Ok(verdicts
                .get(&mutant.id)
                .filter(|v| v.status == CheckStatus::CompileError)
                .map(|v| {
                    let mut result = MutantResult::new(mutant, MutantStatus::CompileError);
                    result.status_reason = v.reason.clone();
                    result
                })),
            Err(e) if e.is_setup_failure() => Err(e),
            Err(e) => {
                warn!(mutant_id = %mutant.id, error = %e, "Checker failed");
                Ok(Some(
                    MutantResult::new(mutant, MutantStatus::RuntimeError).with_reason(e.to_string()),
                ))
            }
        }
    }

    /// Static checking is over: hand the checker slots to the test runners.
    fn release_checkers(&self) {
        let Some(checkers) = self.checkers.clone() else {
            return;
        };
        info!("Checking finished, releasing checker slots to test runners");
        self.provider.free_checkers();
        tokio::spawn(async move { checkers.dispose().await });
    }

    async fn run_mutant(&self, run: MutantRunPlan) -> Result<MutantResult> {
        let MutantRunPlan {
            mutant,
            options,
            covered_by,
        } = run;
        let mut attempt = 0;

        loop {
            let run_options = options.clone();
            let outcome = self
                .test_runners
                .schedule(move |runner| async move { runner.mutant_run(run_options).await })
                .await;

            let result = match outcome {
                Ok(result) => to_mutant_result(&mutant, result, &covered_by),
                Err(StryxError::Crashed(details)) if attempt < MAX_CRASH_RETRIES => {
                    attempt += 1;
                    warn!(
                        mutant_id = %mutant.id,
                        attempt,
                        reason = %details.reason,
                        "Worker crashed, retrying on a fresh worker"
                    );
                    continue;
                }
                Err(StryxError::Crashed(details)) => {
                    warn!(mutant_id = %mutant.id, "{}", details);
                    MutantResult::new(&mutant, MutantStatus::Error).with_reason(format!(
                        "Worker crashed {} times. Last crash: {}",
                        attempt + 1,
                        details
                    ))
                }
                Err(StryxError::OutOfMemory(details)) => {
                    warn!(mutant_id = %mutant.id, "{}", details);
                    MutantResult::new(&mutant, MutantStatus::Timeout).with_reason("out of memory")
                }
                Err(StryxError::CallTimeout { timeout, .. }) => {
                    debug!(mutant_id = %mutant.id, timeout_ms = timeout.as_millis() as u64, "Mutant timed out");
                    MutantResult::new(&mutant, MutantStatus::Timeout)
                }
                Err(StryxError::Rejection { error, .. }) => {
                    MutantResult::new(&mutant, MutantStatus::Error).with_reason(error.to_string())
                }
                Err(e) if e.is_setup_failure() || matches!(e, StryxError::PoolDisposed) => {
                    return Err(e);
                }
                Err(e) => MutantResult::new(&mutant, MutantStatus::Error).with_reason(e.to_string()),
            };

            debug!(mutant_id = %mutant.id, status = %result.status, "Mutant tested");
            return Ok(MutantResult {
                covered_by,
                ..result
            });
        }
    }
}

/// Translate a worker's verdict into the mutant's result.
fn to_mutant_result(mutant: &Mutant, result: MutantRunResult, covered_by: &[TestId]) -> MutantResult {
    let mut mutant_result = match result {
        MutantRunResult::Killed {
            failure_message,
            killed_by,
            nr_of_tests,
        } => MutantResult {
            killed_by,
            tests_completed: Some(nr_of_tests),
            ..MutantResult::new(mutant, MutantStatus::Killed).with_reason(failure_message)
        },
        MutantRunResult::Survived { nr_of_tests } => MutantResult {
            tests_completed: Some(nr_of_tests),
            ..MutantResult::new(mutant, MutantStatus::Survived)
        },
        MutantRunResult::Timeout { reason } => MutantResult {
            status_reason: reason,
            ..MutantResult::new(mutant, MutantStatus::Timeout)
        },
        MutantRunResult::Error { error_message } => {
            MutantResult::new(mutant, MutantStatus::Error).with_reason(error_message)
        }
    };
    mutant_result.covered_by = covered_by.to_vec();
    mutant_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_killed_result_carries_killers() {
        let mutant = Mutant::new("4", "src/add.js");
        let result = to_mutant_result(
            &mutant,
            MutantRunResult::Killed {
                failure_message: "expected 3 to be 4".to_string(),
                killed_by: vec!["add works".to_string()],
                nr_of_tests: 3,
            },
            &["add works".to_string(), "add is pure".to_string()],
        );

        assert_eq!(result.status, MutantStatus::Killed);
        assert_eq!(result.killed_by, vec!["add works"]);
        assert_eq!(result.tests_completed, Some(3));
        assert_eq!(result.status_reason.as_deref(), Some("expected 3 to be 4"));
        assert_eq!(result.covered_by.len(), 2);
        assert_eq!(result.file_name, "src/add.js");
    }

    #[test]
    fn test_worker_verdicts_map_through() {
        let mutant = Mutant::new("1", "a.js");

        let survived = to_mutant_result(&mutant, MutantRunResult::Survived { nr_of_tests: 0 }, &[]);
        assert_eq!(survived.status, MutantStatus::Survived);
        assert_eq!(survived.tests_completed, Some(0));

        let timeout = to_mutant_result(
            &mutant,
            MutantRunResult::Timeout {
                reason: Some("Hit limit reached (101/100)".to_string()),
            },
            &[],
        );
        assert_eq!(timeout.status, MutantStatus::Timeout);
        assert!(timeout.status_reason.unwrap().contains("Hit limit"));

        let error = to_mutant_result(
            &mutant,
            MutantRunResult::Error {
                error_message: "boom".to_string(),
            },
            &[],
        );
        assert_eq!(error.status, MutantStatus::Error);
        assert_eq!(error.status_reason.as_deref(), Some("boom"));
    }
}
