//! Run configuration.
//!
//! Options are read from a camelCase JSON file; every field has a default, so
//! `{}` is a valid configuration. Command-line flags are applied on top by the
//! binary before [`StryxOptions::validate`] runs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StryxError};
use crate::worker::value::Value;

/// Default constant part of a mutant-run timeout.
const DEFAULT_TIMEOUT_MS: u64 = 5000;

const DEFAULT_TIMEOUT_FACTOR: f64 = 1.5;

const DEFAULT_DRY_RUN_TIMEOUT_MINUTES: f64 = 5.0;

/// How long a worker gets to acknowledge `Dispose` before it is killed.
const DEFAULT_WORKER_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

/// Safety factor applied to dry-run hit counts.
const DEFAULT_HIT_LIMIT_FACTOR: u64 = 100;

/// Name of the built-in scripted test runner.
pub const FIXTURE_TEST_RUNNER: &str = "fixture-test-runner";

/// How much coverage information the dry run collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoverageAnalysis {
    /// No coverage: every mutant runs the full test list.
    Off,
    /// Per-mutant hit counts only; used to spot mutants nothing executes.
    All,
    /// Per-test coverage; each mutant runs only the tests covering it.
    #[default]
    PerTest,
}

impl std::str::FromStr for CoverageAnalysis {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "all" => Ok(Self::All),
            "perTest" | "per-test" => Ok(Self::PerTest),
            _ => Err(format!(
                "Unknown coverage analysis: '{}'. Valid options: off, all, perTest",
                s
            )),
        }
    }
}

impl std::fmt::Display for CoverageAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::All => write!(f, "all"),
            Self::PerTest => write!(f, "perTest"),
        }
    }
}

/// A subject hosted inside a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPlugin {
    /// Registered plugin name.
    pub name: String,
    /// Plugin-specific options, passed through untouched.
    #[serde(default = "null_value")]
    pub options: Value,
}

fn null_value() -> Value {
    Value::Null
}

impl WorkerPlugin {
    pub fn new(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

impl Default for WorkerPlugin {
    fn default() -> Self {
        Self::new(FIXTURE_TEST_RUNNER, Value::Null)
    }
}

/// Options of a mutation testing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StryxOptions {
    /// Total worker processes; derived from the CPU count when unset.
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,

    #[serde(default = "default_dry_run_timeout_minutes")]
    pub dry_run_timeout_minutes: f64,

    #[serde(default)]
    pub coverage_analysis: CoverageAnalysis,

    /// Run every test of a mutant's subset instead of stopping at the first failure.
    #[serde(default)]
    pub disable_bail: bool,

    /// Treat static mutants like any other instead of running the full test list.
    #[serde(default)]
    pub ignore_static: bool,

    /// Accept a dry run that found no tests.
    #[serde(default)]
    pub allow_empty: bool,

    /// Recycle a test runner after this many mutant runs (0 = never).
    #[serde(default)]
    pub max_test_runner_reuse: usize,

    #[serde(default)]
    pub test_runner: WorkerPlugin,

    #[serde(default)]
    pub checkers: Vec<WorkerPlugin>,

    /// Per-worker RSS budget enforced by the memory watchdog.
    #[serde(default)]
    pub max_worker_memory_mib: Option<usize>,

    #[serde(default = "default_worker_shutdown_timeout_ms")]
    pub worker_shutdown_timeout_ms: u64,

    #[serde(default = "default_hit_limit_factor")]
    pub hit_limit_factor: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_timeout_factor() -> f64 {
    DEFAULT_TIMEOUT_FACTOR
}

fn default_dry_run_timeout_minutes() -> f64 {
    DEFAULT_DRY_RUN_TIMEOUT_MINUTES
}

fn default_worker_shutdown_timeout_ms() -> u64 {
    DEFAULT_WORKER_SHUTDOWN_TIMEOUT_MS
}

fn default_hit_limit_factor() -> u64 {
    DEFAULT_HIT_LIMIT_FACTOR
}

impl Default for StryxOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            dry_run_timeout_minutes: DEFAULT_DRY_RUN_TIMEOUT_MINUTES,
            coverage_analysis: CoverageAnalysis::default(),
            disable_bail: false,
            ignore_static: false,
            allow_empty: false,
            max_test_runner_reuse: 0,
            test_runner: WorkerPlugin::default(),
            checkers: Vec::new(),
            max_worker_memory_mib: None,
            worker_shutdown_timeout_ms: DEFAULT_WORKER_SHUTDOWN_TIMEOUT_MS,
            hit_limit_factor: DEFAULT_HIT_LIMIT_FACTOR,
        }
    }
}

impl StryxOptions {
    /// Load options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StryxError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            StryxError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Reject option combinations a run cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(StryxError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if !self.timeout_factor.is_finite() || self.timeout_factor < 0.0 {
            return Err(StryxError::Config(format!(
                "timeoutFactor must be a non-negative number, got {}",
                self.timeout_factor
            )));
        }
        if !self.dry_run_timeout_minutes.is_finite() || self.dry_run_timeout_minutes <= 0.0 {
            return Err(StryxError::Config(format!(
                "dryRunTimeoutMinutes must be positive, got {}",
                self.dry_run_timeout_minutes
            )));
        }
        if self.test_runner.name.trim().is_empty() {
            return Err(StryxError::Config(
                "testRunner.name must not be empty".to_string(),
            ));
        }
        if let Some(checker) = self.checkers.iter().find(|c| c.name.trim().is_empty()) {
            return Err(StryxError::Config(format!(
                "checker name must not be empty (options: {:?})",
                checker.options
            )));
        }
        if self.max_worker_memory_mib == Some(0) {
            return Err(StryxError::Config(
                "maxWorkerMemoryMib must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dry_run_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dry_run_timeout_minutes * 60.0)
    }

    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_timeout_ms)
    }

    pub fn has_checkers(&self) -> bool {
        !self.checkers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_object_gives_defaults() {
        let options: StryxOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, StryxOptions::default());
        assert_eq!(options.timeout_ms, 5000);
        assert_eq!(options.timeout_factor, 1.5);
        assert_eq!(options.coverage_analysis, CoverageAnalysis::PerTest);
        assert_eq!(options.test_runner.name, FIXTURE_TEST_RUNNER);
        assert_eq!(options.dry_run_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_camel_case_fields() {
        let json = r#"{
            "concurrency": 3,
            "coverageAnalysis": "all",
            "disableBail": true,
            "maxTestRunnerReuse": 10,
            "testRunner": { "name": "fixture-test-runner", "options": { "kind": "string", "value": "fixture.json" } },
            "checkers": [{ "name": "fixture-checker" }]
        }"#;
        let options: StryxOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.concurrency, Some(3));
        assert_eq!(options.coverage_analysis, CoverageAnalysis::All);
        assert!(options.disable_bail);
        assert_eq!(options.max_test_runner_reuse, 10);
        assert_eq!(options.test_runner.options, Value::from("fixture.json"));
        assert!(options.has_checkers());
        assert!(options.checkers[0].options.is_null());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let options = StryxOptions {
            concurrency: Some(0),
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, StryxError::Config(_)));
        assert_eq!(err.to_string(), "concurrency must be at least 1");
    }

    #[test]
    fn test_validate_rejects_bad_timeout_factor() {
        let options = StryxOptions {
            timeout_factor: f64::NAN,
            ..Default::default()
        };
        assert!(options.validate().is_err());
        assert!(StryxOptions::default().validate().is_ok());
    }

    #[test]
    fn test_coverage_analysis_from_str() {
        assert_eq!("off".parse::<CoverageAnalysis>().unwrap(), CoverageAnalysis::Off);
        assert_eq!(
            "per-test".parse::<CoverageAnalysis>().unwrap(),
            CoverageAnalysis::PerTest
        );
        assert!("sometimes".parse::<CoverageAnalysis>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "timeoutMs": 100, "hitLimitFactor": 7 }}"#).unwrap();

        let options = StryxOptions::load(file.path()).unwrap();
        assert_eq!(options.timeout_ms, 100);
        assert_eq!(options.hit_limit_factor, 7);
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = StryxOptions::load(file.path()).unwrap_err();
        assert!(matches!(err, StryxError::Config(_)));
        assert!(err.to_string().contains("Invalid config file"));
    }
}
