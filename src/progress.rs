//! Terminal progress for a mutation test run.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::execution::{MutationEvent, RunSummary};
use crate::mutant::MutantStatus;

/// Progress bar fed by [`MutationEvent`]s.
///
/// A hidden bar still counts, so the summary is the same either way.
pub struct RunProgress {
    bar: ProgressBar,
    tested: usize,
    detected: usize,
    undetected: usize,
    summary: Option<RunSummary>,
}

impl RunProgress {
    pub fn new(total: usize, visible: bool) -> Self {
        let bar = ProgressBar::new(total as u64);
        if visible {
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            {
                bar.set_style(style.progress_chars("█▓▒░  "));
            }
            bar.enable_steady_tick(Duration::from_millis(100));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            bar,
            tested: 0,
            detected: 0,
            undetected: 0,
            summary: None,
        }
    }

    pub fn handle(&mut self, event: MutationEvent) {
        match event {
            MutationEvent::MutantTested(result) => {
                self.tested += 1;
                match result.status {
                    MutantStatus::Killed | MutantStatus::Timeout => self.detected += 1,
                    MutantStatus::Survived | MutantStatus::NoCoverage => self.undetected += 1,
                    _ => {}
                }
                tracing::debug!(
                    mutant_id = %result.id,
                    status = %result.status,
                    "Mutant {}/{} tested",
                    self.tested,
                    self.bar.length().unwrap_or_default()
                );
                self.bar.inc(1);
                self.bar.set_message(format!(
                    "{} detected, {} undetected",
                    self.detected, self.undetected
                ));
            }
            MutationEvent::AllMutantsTested(summary) => self.summary = Some(summary),
        }
    }

    pub fn tested(&self) -> usize {
        self.tested
    }

    /// Clear the bar and hand back the final summary, if one arrived.
    pub fn finish(self) -> Option<RunSummary> {
        self.bar.finish_and_clear();
        self.summary
    }
}
