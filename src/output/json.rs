//! JSON output for run results.

use serde::Serialize;

use crate::execution::RunSummary;
use crate::mutant::MutantResult;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    summary: &'a RunSummary,
    mutation_score: Option<f64>,
    mutants: &'a [MutantResult],
}

/// Render results and summary as a JSON document.
pub fn render_json(results: &[MutantResult], summary: &RunSummary) -> String {
    let report = Report {
        summary,
        mutation_score: summary.mutation_score(),
        mutants: results,
    };
    serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
}

/// Print results as JSON.
pub fn print_json(results: &[MutantResult], summary: &RunSummary) {
    println!("{}", render_json(results, summary));
}
