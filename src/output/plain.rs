//! Plain text report of a run.

use std::fmt::Write as _;

use crate::execution::RunSummary;
use crate::mutant::{MutantResult, MutantStatus};
use crate::theme::Themed;

/// Render the undetected mutants followed by the summary table.
pub fn render_plain(results: &[MutantResult], summary: &RunSummary) -> String {
    let mut out = String::new();

    let undetected: Vec<&MutantResult> = results
        .iter()
        .filter(|r| r.status.is_undetected())
        .collect();
    if !undetected.is_empty() {
        let _ = writeln!(out, "{}", "Undetected mutants".section_header());
        for result in &undetected {
            let _ = writeln!(
                out,
                "  [{}] {} {}",
                result.status.to_string().status(result.status),
                result.id,
                result.file_name.muted()
            );
        }
        let _ = writeln!(out);
    }

    let errored: Vec<&MutantResult> = results
        .iter()
        .filter(|r| matches!(r.status, MutantStatus::Error | MutantStatus::RuntimeError))
        .collect();
    if !errored.is_empty() {
        let _ = writeln!(out, "{}", "Errors".section_header());
        for result in &errored {
            let reason = result.status_reason.as_deref().unwrap_or("-");
            let first_line = reason.lines().next().unwrap_or("-");
            let _ = writeln!(out, "  {} {}: {}", result.id, result.file_name.muted(), first_line);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "{}", "Summary".section_header());
    let rows = [
        ("Killed", summary.killed, MutantStatus::Killed),
        ("Timeout", summary.timeout, MutantStatus::Timeout),
        ("Survived", summary.survived, MutantStatus::Survived),
        ("No coverage", summary.no_coverage, MutantStatus::NoCoverage),
        ("Compile errors", summary.compile_errors, MutantStatus::CompileError),
        ("Runtime errors", summary.runtime_errors, MutantStatus::RuntimeError),
        ("Errors", summary.errors, MutantStatus::Error),
        ("Ignored", summary.ignored, MutantStatus::Ignored),
    ];
    for (label, count, status) in rows {
        let _ = writeln!(out, "  {:<16}{}", format!("{}:", label).status(status), count);
    }
    let _ = writeln!(out, "  {:<16}{}", "Total:", summary.total);

    let score = match summary.mutation_score() {
        Some(score) => {
            let text = format!("{:.2}%", score);
            text.score(score)
        }
        None => "n/a".to_string(),
    };
    let _ = writeln!(out, "  {:<16}{}", "Mutation score:", score);
    out
}

/// Print the report to stdout.
pub fn print_plain(results: &[MutantResult], summary: &RunSummary) {
    print!("{}", render_plain(results, summary));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutant::Mutant;
    use crate::theme::disable_colors;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_render_plain_lists_undetected() {
        disable_colors();
        let results = vec![
            MutantResult::new(&Mutant::new("1", "src/a.js"), MutantStatus::Killed),
            MutantResult::new(&Mutant::new("2", "src/b.js"), MutantStatus::Survived),
            MutantResult::new(&Mutant::new("3", "src/b.js"), MutantStatus::Error)
                .with_reason("Worker crashed 3 times\nmore detail"),
        ];
        let summary = RunSummary::from_results(&results);
        let text = render_plain(&results, &summary);

        assert!(text.contains("[Survived] 2 src/b.js"));
        assert!(!text.contains("[Killed]"));
        assert!(text.contains("3 src/b.js: Worker crashed 3 times"));
        assert!(!text.contains("more detail"));
        assert!(text.contains("Mutation score: 50.00%"));
    }

    #[test]
    #[serial]
    fn test_render_plain_without_valid_mutants() {
        disable_colors();
        let text = render_plain(&[], &RunSummary::default());
        assert!(text.contains("n/a"));
        assert!(!text.contains("Undetected"));
    }
}
