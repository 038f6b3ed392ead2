//! Output formatting for run results.

pub mod json;
pub mod plain;

use crate::execution::RunSummary;
use crate::mutant::MutantResult;

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored text report (default).
    #[default]
    Plain,
    /// JSON output.
    Json,
}

/// Format and print the results of a run.
pub fn print_results(results: &[MutantResult], summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Plain => plain::print_plain(results, summary),
        OutputFormat::Json => json::print_json(results, summary),
    }
}
