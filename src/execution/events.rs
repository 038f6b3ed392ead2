//! Progress events emitted while mutants are tested.

use serde::Serialize;

use crate::mutant::{MutantResult, MutantStatus};

/// Progress of a run, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    /// One mutant reached its final status.
    MutantTested(MutantResult),
    /// Every mutant was tested.
    AllMutantsTested(RunSummary),
}

/// Status counts of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub timeout: usize,
    pub no_coverage: usize,
    pub compile_errors: usize,
    pub runtime_errors: usize,
    pub errors: usize,
    pub ignored: usize,
}

impl RunSummary {
    pub fn from_results(results: &[MutantResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            let counter = match result.status {
                MutantStatus::Killed => &mut summary.killed,
                MutantStatus::Survived => &mut summary.survived,
                MutantStatus::Timeout => &mut summary.timeout,
                MutantStatus::NoCoverage => &mut summary.no_coverage,
                MutantStatus::CompileError => &mut summary.compile_errors,
                MutantStatus::RuntimeError => &mut summary.runtime_errors,
                MutantStatus::Error => &mut summary.errors,
                MutantStatus::Ignored => &mut summary.ignored,
            };
            *counter += 1;
        }
        summary
    }

    pub fn detected(&self) -> usize {
        self.killed + self.timeout
    }

    pub fn undetected(&self) -> usize {
        self.survived + self.no_coverage
    }

    /// Detected mutants as a percentage of all valid ones; `None` without any.
    pub fn mutation_score(&self) -> Option<f64> {
        let valid = self.detected() + self.undetected();
        (valid > 0).then(|| self.detected() as f64 * 100.0 / valid as f64)
    }
}
