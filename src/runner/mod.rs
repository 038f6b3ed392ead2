//! Test runners and checkers: the subjects hosted in workers and their
//! parent-side proxies.

pub mod checker;
pub mod fixture;
pub mod proxy;
pub mod test_runner;

pub use checker::{CheckResult, CheckResults, CheckStatus, Checker};
pub use proxy::{CheckerFactory, CheckerProxy, TestRunnerFactory, TestRunnerProxy};
pub use test_runner::{
    DryRunOptions, DryRunResult, MutantCoverage, MutantRunOptions, MutantRunResult, TestResult,
    TestRunner, TestStatus,
};
