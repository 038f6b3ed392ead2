//! Mutation test execution: dry run, planning and the per-mutant loop.
//!
//! [`run_mutation_test`] wires everything together:
//!
//! 1. split the concurrency budget between checkers and test runners,
//! 2. start the worker pools (workers are spawned lazily),
//! 3. run the suite once to get the baseline and coverage,
//! 4. test every mutant, streaming [`MutationEvent`]s,
//! 5. dispose the pools, whatever happened.

pub mod dry_run;
pub mod events;
pub mod executor;
pub mod planner;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, instrument};

use crate::concurrency::ConcurrencyTokenProvider;
use crate::config::{StryxOptions, WorkerPlugin};
use crate::error::Result;
use crate::mutant::{Mutant, MutantResult};
use crate::pool::ResourcePool;
use crate::runner::proxy::{CheckerFactory, CheckerProxy, TestRunnerFactory, TestRunnerProxy};
use crate::worker::{MemoryWatchdog, WorkerOptions};

pub use dry_run::{DryRunOutcome, run_dry_run, validate_dry_run};
pub use events::{MutationEvent, RunSummary};
pub use executor::MutationTestExecutor;
pub use planner::{MutantPlan, MutantRunPlan, mutant_timeout_ms, plan_mutant};

pub type TestRunnerPool = ResourcePool<TestRunnerProxy, TestRunnerFactory>;
pub type CheckerPool = ResourcePool<CheckerProxy, CheckerFactory>;

/// Run mutation testing with workers started from the current executable.
pub async fn run_mutation_test(
    options: &StryxOptions,
    mutants: Vec<Mutant>,
    events: Option<UnboundedSender<MutationEvent>>,
) -> Result<Vec<MutantResult>> {
    let base = WorkerOptions::for_run(options.test_runner.clone(), options);
    run_mutation_test_with(options, mutants, &base, events).await
}

/// Run mutation testing, deriving every worker's options from `base`.
///
/// `base` supplies the executable, working directory and log level; plugin,
/// label and limits come from `options`.
#[instrument(skip_all, fields(mutants = mutants.len()))]
pub async fn run_mutation_test_with(
    options: &StryxOptions,
    mutants: Vec<Mutant>,
    base: &WorkerOptions,
    events: Option<UnboundedSender<MutationEvent>>,
) -> Result<Vec<MutantResult>> {
    options.validate()?;

    let provider = Arc::new(ConcurrencyTokenProvider::new(
        options.concurrency,
        options.has_checkers(),
    ));
    let watchdog = options
        .max_worker_memory_mib
        .map(|_| Arc::new(MemoryWatchdog::start()));
    let worker_options = |plugin: &WorkerPlugin, label: String| {
        let mut worker = WorkerOptions {
            plugin: plugin.clone(),
            label,
            shutdown_timeout: options.worker_shutdown_timeout(),
            memory_limit_mib: options.max_worker_memory_mib,
            ..base.clone()
        };
        if let Some(watchdog) = &watchdog {
            worker = worker.with_watchdog(Arc::clone(watchdog));
        }
        worker
    };

    let test_runners: TestRunnerPool = ResourcePool::new(
        "test-runner",
        TestRunnerFactory::new(
            worker_options(&options.test_runner, "test-runner".to_string()),
            options.max_test_runner_reuse,
        ),
        provider.test_runner_tokens(),
    );
    let checkers: Option<CheckerPool> = options.has_checkers().then(|| {
        let checker_options = options
            .checkers
            .iter()
            .map(|plugin| worker_options(plugin, format!("checker-{}", plugin.name)))
            .collect();
        ResourcePool::new(
            "checker",
            CheckerFactory::new(checker_options),
            provider.checker_tokens(),
        )
    });

    info!(
        concurrency = provider.concurrency(),
        test_runner = %options.test_runner.name,
        checkers = options.checkers.len(),
        "Starting mutation test run"
    );

    let outcome = async {
        let dry_run = run_dry_run(&test_runners, options).await?;
        let executor = MutationTestExecutor::new(
            options.clone(),
            test_runners.clone(),
            checkers.clone(),
            Arc::clone(&provider),
            Arc::new(dry_run.coverage),
            dry_run.baseline_ms,
        );
        executor.execute(mutants, events).await
    }
    .await;

    provider.dispose();
    if let Some(checkers) = &checkers {
        checkers.dispose().await;
    }
    test_runners.dispose().await;

    outcome
}
