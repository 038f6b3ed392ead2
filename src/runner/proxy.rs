//! Typed parent-side handles for test-runner and checker workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::checker::{CheckResult, CheckResults, CheckStatus};
use super::test_runner::{DryRunOptions, DryRunResult, MutantRunOptions, MutantRunResult};
use crate::concurrency::ConcurrencyToken;
use crate::error::{Result, StryxError};
use crate::mutant::Mutant;
use crate::pool::{Resource, ResourceFactory};
use crate::worker::{Value, WorkerOptions, WorkerProxy};

async fn invoke<A: Serialize, R: DeserializeOwned>(
    worker: &WorkerProxy,
    method: &str,
    arg: &A,
    timeout: Option<Duration>,
) -> Result<R> {
    let result = worker
        .call_with_timeout(method, vec![Value::encode(arg)?], timeout)
        .await?;
    result
        .decode()
        .map_err(|e| StryxError::Protocol(format!("Invalid {} result: {}", method, e)))
}

/// A test runner living in a worker process.
pub struct TestRunnerProxy {
    worker: WorkerProxy,
    /// Mutant runs after which the worker is recycled; 0 means never.
    max_reuse: usize,
    runs: AtomicUsize,
}

impl TestRunnerProxy {
    pub async fn start(options: &WorkerOptions, max_reuse: usize) -> Result<Self> {
        Ok(Self {
            worker: WorkerProxy::start(options).await?,
            max_reuse,
            runs: AtomicUsize::new(0),
        })
    }

    pub fn worker(&self) -> &WorkerProxy {
        &self.worker
    }

    /// Run the whole suite once, bounded by `timeout`.
    pub async fn dry_run(&self, options: DryRunOptions, timeout: Duration) -> Result<DryRunResult> {
        invoke(&self.worker, "dryRun", &options, Some(timeout)).await
    }

    /// Run tests against one active mutant, bounded by the run's own timeout.
    ///
    /// A `Timeout` verdict reported by the worker itself (hit limit) also
    /// retires the worker: the mutated code may still be spinning inside it.
    pub async fn mutant_run(&self, options: MutantRunOptions) -> Result<MutantRunResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let timeout = Duration::from_millis(options.timeout_ms);
        let result: MutantRunResult =
            invoke(&self.worker, "mutantRun", &options, Some(timeout)).await?;
        if matches!(result, MutantRunResult::Timeout { .. }) {
            self.worker.taint();
        }
        Ok(result)
    }
}

impl Resource for TestRunnerProxy {
    fn is_reusable(&self) -> bool {
        if !self.worker.is_usable() {
            return false;
        }
        let runs = self.runs.load(Ordering::SeqCst);
        if self.max_reuse > 0 && runs >= self.max_reuse {
            debug!(pid = self.worker.pid(), runs, "Recycling test runner");
            return false;
        }
        true
    }

    async fn dispose(&self) {
        self.worker.dispose().await;
    }
}

/// The configured checkers of one concurrency slot, one worker each.
pub struct CheckerProxy {
    workers: Vec<WorkerProxy>,
}

impl CheckerProxy {
    pub async fn start(options: &[WorkerOptions]) -> Result<Self> {
        let mut workers = Vec::with_capacity(options.len());
        for checker in options {
            match WorkerProxy::start(checker).await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &workers {
                        worker.dispose().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { workers })
    }

    /// Check `mutants` with every checker; the first compile error wins.
    pub async fn check(&self, mutants: &[Mutant]) -> Result<CheckResults> {
        let mut verdicts = CheckResults::new();
        for worker in &self.workers {
            let results: CheckResults = invoke(worker, "check", &mutants, None).await?;
            for (mutant_id, result) in results {
                let verdict = verdicts.entry(mutant_id).or_insert_with(CheckResult::passed);
                if verdict.status == CheckStatus::Passed {
                    *verdict = result;
                }
            }
        }
        Ok(verdicts)
    }
}

impl Resource for CheckerProxy {
    fn is_reusable(&self) -> bool {
        self.workers.iter().all(WorkerProxy::is_usable)
    }

    async fn dispose(&self) {
        for worker in &self.workers {
            worker.dispose().await;
        }
    }
}

/// Starts one test runner per concurrency token.
pub struct TestRunnerFactory {
    options: WorkerOptions,
    max_reuse: usize,
}

impl TestRunnerFactory {
    pub fn new(options: WorkerOptions, max_reuse: usize) -> Self {
        Self { options, max_reuse }
    }
}

impl ResourceFactory<TestRunnerProxy> for TestRunnerFactory {
    async fn create(&self, token: ConcurrencyToken) -> Result<TestRunnerProxy> {
        let options = self
            .options
            .clone()
            .with_label(format!("{}-{}", self.options.label, token));
        TestRunnerProxy::start(&options, self.max_reuse).await
    }
}

/// Starts the checkers of one concurrency token.
pub struct CheckerFactory {
    options: Vec<WorkerOptions>,
}

impl CheckerFactory {
    pub fn new(options: Vec<WorkerOptions>) -> Self {
        Self { options }
    }
}

impl ResourceFactory<CheckerProxy> for CheckerFactory {
    async fn create(&self, token: ConcurrencyToken) -> Result<CheckerProxy> {
        let options: Vec<WorkerOptions> = self
            .options
            .iter()
            .map(|checker| {
                let label = format!("{}-{}", checker.label, token);
                checker.clone().with_label(label)
            })
            .collect();
        CheckerProxy::start(&options).await
    }
}
