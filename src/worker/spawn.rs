//! Worker subprocess spawning.
//!
//! Workers are instances of the current executable started in the hidden
//! `worker` mode, with all three standard streams piped to the parent.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::Level;

use super::watchdog::MemoryWatchdog;
use crate::config::{StryxOptions, WorkerPlugin};
use crate::error::{Result, StryxError};

/// Subcommand that puts the executable in worker mode.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Default bound on the Ready/Init handshake.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a graceful dispose.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Executable to run; the current executable when unset.
    pub executable: Option<PathBuf>,
    /// Subject to host.
    pub plugin: WorkerPlugin,
    /// Directory the worker switches into before constructing its subject.
    pub working_dir: Option<PathBuf>,
    /// Minimum level of log records the worker forwards.
    pub log_level: Level,
    /// Extra arguments appended after the worker subcommand.
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// RSS budget enforced by `watchdog`.
    pub memory_limit_mib: Option<usize>,
    pub watchdog: Option<Arc<MemoryWatchdog>>,
    /// Name used in logs, e.g. `"test-runner"`.
    pub label: String,
}

impl WorkerOptions {
    pub fn new(plugin: WorkerPlugin) -> Self {
        Self {
            executable: None,
            plugin,
            working_dir: None,
            log_level: Level::INFO,
            extra_args: Vec::new(),
            env: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            memory_limit_mib: None,
            watchdog: None,
            label: "worker".to_string(),
        }
    }

    /// Options for hosting `plugin` under the settings of a run.
    pub fn for_run(plugin: WorkerPlugin, options: &StryxOptions) -> Self {
        Self {
            shutdown_timeout: options.worker_shutdown_timeout(),
            memory_limit_mib: options.max_worker_memory_mib,
            ..Self::new(plugin)
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<MemoryWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}

/// Spawn a worker subprocess.
///
/// The child is killed when its handle is dropped.
pub fn spawn_worker(options: &WorkerOptions) -> Result<Child> {
    let exe_path = match &options.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|e| StryxError::Spawn(format!("Failed to get current executable: {}", e)))?,
    };

    let mut cmd = Command::new(&exe_path);
    cmd.arg(WORKER_SUBCOMMAND);
    cmd.args(&options.extra_args);

    // IPC over stdin/stdout; stderr is captured for crash diagnostics
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    // Worker logs travel over the protocol, never as text on stderr
    cmd.env_remove("STRYX_LOG_FILE");

    cmd.spawn().map_err(|e| {
        StryxError::Spawn(format!(
            "Failed to spawn worker {}: {}",
            exe_path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoverageAnalysis;

    #[test]
    fn test_worker_options_for_run() {
        let run = StryxOptions {
            worker_shutdown_timeout_ms: 750,
            max_worker_memory_mib: Some(512),
            coverage_analysis: CoverageAnalysis::Off,
            ..Default::default()
        };
        let options = WorkerOptions::for_run(run.test_runner.clone(), &run)
            .with_label("test-runner")
            .with_log_level(Level::DEBUG);

        assert_eq!(options.shutdown_timeout, Duration::from_millis(750));
        assert_eq!(options.memory_limit_mib, Some(512));
        assert_eq!(options.label, "test-runner");
        assert_eq!(options.log_level, Level::DEBUG);
        assert!(options.executable.is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let options = WorkerOptions::new(WorkerPlugin::default())
            .with_executable("/nonexistent/stryx-worker");
        let err = spawn_worker(&options).unwrap_err();
        assert!(matches!(err, StryxError::Spawn(_)));
        assert!(err.is_setup_failure());
        assert!(err.to_string().contains("/nonexistent/stryx-worker"));
    }
}
