//! Crash analysis for worker subprocesses.
//!
//! Turns a worker's exit status and its last output lines into a
//! [`TerminationReason`], separating out-of-memory deaths from other crashes.
//!
//! # Out-of-memory heuristic
//!
//! A worker is considered out of memory when any of these hold:
//! - the memory watchdog killed it for exceeding its RSS budget,
//! - it died from `SIGKILL` that the parent did not send (the kernel OOM
//!   killer's signature), or exited with status 137 (a wrapper reporting it),
//! - its recent stdout/stderr contains a known allocation-failure message.

use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Output fragments that identify an allocation failure.
const OOM_MARKERS: &[&str] = &[
    "memory allocation of",
    "out of memory",
    "Out of memory",
    "heap out of memory",
    "Cannot allocate memory",
    "std::bad_alloc",
];

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Ran out of memory (see module docs for the heuristic).
    OutOfMemory,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("was killed by signal {:?}", sig),
            Self::OutOfMemory => "ran out of memory".to_string(),
            Self::Unknown => "exited for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// What the parent knows about how a worker went away.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitContext {
    /// The parent itself sent the kill (dispose, timeout replacement).
    pub killed_by_parent: bool,
    /// The memory watchdog killed the worker.
    pub killed_by_watchdog: bool,
}

/// Analyze an exit status together with the captured output tails.
pub fn analyze_exit(
    status: Option<ExitStatus>,
    context: ExitContext,
    stdout: &[String],
    stderr: &[String],
) -> TerminationReason {
    use std::os::unix::process::ExitStatusExt;

    if context.killed_by_watchdog || has_oom_marker(stdout) || has_oom_marker(stderr) {
        return TerminationReason::OutOfMemory;
    }

    let Some(status) = status else {
        return TerminationReason::Unknown;
    };

    if let Some(code) = status.code() {
        return match code {
            137 if !context.killed_by_parent => TerminationReason::OutOfMemory,
            code => TerminationReason::Exited(code),
        };
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) if !context.killed_by_parent => TerminationReason::OutOfMemory,
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

fn has_oom_marker(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| OOM_MARKERS.iter().any(|marker| line.contains(marker)))
}

/// Diagnostics of a worker that died unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashDetails {
    pub pid: u32,
    pub exit_code: Option<i32>,
    /// Raw signal number, if killed by one.
    pub signal: Option<i32>,
    pub reason: TerminationReason,
    pub recent_stdout: Vec<String>,
    pub recent_stderr: Vec<String>,
}

impl CrashDetails {
    pub fn new(
        pid: u32,
        status: Option<ExitStatus>,
        context: ExitContext,
        recent_stdout: Vec<String>,
        recent_stderr: Vec<String>,
    ) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let reason = analyze_exit(status, context, &recent_stdout, &recent_stderr);
        Self {
            pid,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            reason,
            recent_stdout,
            recent_stderr,
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.reason == TerminationReason::OutOfMemory
    }
}

impl std::fmt::Display for CrashDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker process {} {}", self.pid, self.reason)?;
        if !self.recent_stderr.is_empty() {
            write!(f, "\n  Last stderr:\n    {}", self.recent_stderr.join("\n    "))?;
        }
        if !self.recent_stdout.is_empty() {
            write!(f, "\n  Last stdout:\n    {}", self.recent_stdout.join("\n    "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: Signal) -> ExitStatus {
        ExitStatus::from_raw(signal as i32)
    }

    #[test]
    fn test_plain_exit_codes() {
        let ctx = ExitContext::default();
        assert_eq!(
            analyze_exit(Some(exited(0)), ctx, &[], &[]),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_exit(Some(exited(3)), ctx, &[], &[]),
            TerminationReason::Exited(3)
        );
    }

    #[test]
    fn test_unsolicited_sigkill_is_oom() {
        let status = Some(signaled(Signal::SIGKILL));
        assert_eq!(
            analyze_exit(status, ExitContext::default(), &[], &[]),
            TerminationReason::OutOfMemory
        );

        let ours = ExitContext {
            killed_by_parent: true,
            ..Default::default()
        };
        assert_eq!(
            analyze_exit(status, ours, &[], &[]),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_allocation_failure_message_is_oom() {
        let stderr = vec!["memory allocation of 1073741824 bytes failed".to_string()];
        assert_eq!(
            analyze_exit(Some(signaled(Signal::SIGABRT)), ExitContext::default(), &[], &stderr),
            TerminationReason::OutOfMemory
        );
    }

    #[test]
    fn test_watchdog_kill_is_oom() {
        let ctx = ExitContext {
            killed_by_parent: false,
            killed_by_watchdog: true,
        };
        assert_eq!(
            analyze_exit(Some(signaled(Signal::SIGTERM)), ctx, &[], &[]),
            TerminationReason::OutOfMemory
        );
    }

    #[test]
    fn test_segfault_is_generic_crash() {
        assert_eq!(
            analyze_exit(Some(signaled(Signal::SIGSEGV)), ExitContext::default(), &[], &[]),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_exit(None, ExitContext::default(), &[], &[]),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_crash_details_display() {
        let details = CrashDetails::new(
            321,
            Some(exited(2)),
            ExitContext::default(),
            vec!["stray print".to_string()],
            vec!["thread 'main' panicked".to_string()],
        );
        assert_eq!(details.exit_code, Some(2));
        assert_eq!(details.signal, None);
        assert!(!details.is_out_of_memory());

        let display = details.to_string();
        assert!(display.contains("321"));
        assert!(display.contains("exited with code 2"));
        assert!(display.contains("panicked"));
        assert!(display.contains("stray print"));
    }
}
