//! Centralized color theming for consistent CLI output.
//!
//! # NO_COLOR Support
//!
//! Colors can be disabled globally via:
//! - The `--no-color` CLI flag
//! - The `NO_COLOR` environment variable
//!
//! When colors are disabled, all theming functions return unstyled output.
//!
//! # Usage
//!
//! ```ignore
//! use crate::theme::Themed;
//! println!("{}", "Killed".status(MutantStatus::Killed));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

use crate::mutant::MutantStatus;

/// Global color enable flag (respects NO_COLOR and --no-color).
static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally.
///
/// Call this early in main() when --no-color is set.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

/// Check if colors are currently enabled.
pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Extension trait for themed terminal output.
pub trait Themed: OwoColorize + std::fmt::Display {
    /// Color matching a mutant status: detected green, undetected red.
    fn status(&self, status: MutantStatus) -> String {
        if !colors_enabled() {
            return self.to_string();
        }
        match status {
            MutantStatus::Killed => format!("{}", self.green()),
            MutantStatus::Timeout => format!("{}", self.yellow()),
            MutantStatus::Survived | MutantStatus::NoCoverage => format!("{}", self.red()),
            MutantStatus::CompileError | MutantStatus::RuntimeError | MutantStatus::Error => {
                format!("{}", self.magenta())
            }
            MutantStatus::Ignored => format!("{}", self.dimmed()),
        }
    }

    /// Mutation score: green from 80%, yellow from 60%, red below.
    fn score(&self, score: f64) -> String {
        if !colors_enabled() {
            return self.to_string();
        }
        if score >= 80.0 {
            format!("{}", self.green().bold())
        } else if score >= 60.0 {
            format!("{}", self.yellow().bold())
        } else {
            format!("{}", self.red().bold())
        }
    }

    fn error_style(&self) -> String {
        if colors_enabled() {
            format!("{}", self.red().bold())
        } else {
            self.to_string()
        }
    }

    fn section_header(&self) -> String {
        if colors_enabled() {
            format!("{}", self.bold().underline())
        } else {
            self.to_string()
        }
    }

    fn muted(&self) -> String {
        if colors_enabled() {
            format!("{}", self.dimmed())
        } else {
            self.to_string()
        }
    }
}

impl<T: std::fmt::Display> Themed for T {}
