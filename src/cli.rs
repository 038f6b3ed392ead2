//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use stryx::config::{CoverageAnalysis, StryxOptions, WorkerPlugin};
use stryx::error::{Result, StryxError};
use stryx::memory::MemorySize;
use stryx::output::OutputFormat;
use stryx::worker::value::Value;

/// Run a test suite against mutants inside a pool of isolated workers.
#[derive(Parser, Debug)]
#[command(name = "stryx")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(
        long,
        env = "NO_COLOR",
        global = true,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Test every mutant of a mutant list.
    Run(RunArgs),

    /// List the plugins a worker can host.
    Plugins,

    /// Host a plugin over stdin/stdout (started by the parent process).
    #[command(hide = true)]
    Worker,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON file holding the list of mutants.
    #[arg(short, long)]
    pub mutants: PathBuf,

    /// JSON configuration file.
    #[arg(short, long, env = "STRYX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of worker processes (defaults to the CPU count).
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Coverage analysis: off, all or perTest.
    #[arg(long)]
    pub coverage_analysis: Option<CoverageAnalysis>,

    /// Constant part of a mutant-run timeout, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Multiplier applied to the baseline test time.
    #[arg(long)]
    pub timeout_factor: Option<f64>,

    /// Run every covering test instead of stopping at the first failure.
    #[arg(long)]
    pub disable_bail: bool,

    /// Run static mutants against their covering tests only.
    #[arg(long)]
    pub ignore_static: bool,

    /// Accept an initial test run without any test.
    #[arg(long)]
    pub allow_empty: bool,

    /// Recycle a test runner after this many mutant runs (0 = never).
    #[arg(long)]
    pub max_test_runner_reuse: Option<usize>,

    /// Memory budget per worker (e.g. "512M", "2G").
    #[arg(long)]
    pub max_worker_memory: Option<MemorySize>,

    /// Test runner plugin hosted by the workers.
    #[arg(long)]
    pub test_runner: Option<String>,

    /// Test runner options: inline JSON, or a path passed to the plugin.
    #[arg(long, requires = "test_runner")]
    pub test_runner_options: Option<String>,

    /// Directory the workers run in.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Plain)]
    pub format: OutputFormatArg,
}

impl RunArgs {
    /// Override file options with the flags given on the command line.
    pub fn apply(&self, options: &mut StryxOptions) -> Result<()> {
        if let Some(concurrency) = self.concurrency {
            options.concurrency = Some(concurrency);
        }
        if let Some(analysis) = self.coverage_analysis {
            options.coverage_analysis = analysis;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            options.timeout_ms = timeout_ms;
        }
        if let Some(factor) = self.timeout_factor {
            options.timeout_factor = factor;
        }
        options.disable_bail |= self.disable_bail;
        options.ignore_static |= self.ignore_static;
        options.allow_empty |= self.allow_empty;
        if let Some(reuse) = self.max_test_runner_reuse {
            options.max_test_runner_reuse = reuse;
        }
        if let Some(memory) = self.max_worker_memory {
            options.max_worker_memory_mib = Some(memory.as_mib() as usize);
        }
        if let Some(name) = &self.test_runner {
            let plugin_options = match &self.test_runner_options {
                Some(raw) => parse_plugin_options(raw)?,
                None => Value::Null,
            };
            options.test_runner = WorkerPlugin::new(name.clone(), plugin_options);
        }
        Ok(())
    }
}

/// Inline JSON is decoded; anything else is passed through as a string.
fn parse_plugin_options(raw: &str) -> Result<Value> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let json = serde_json::from_str(raw).map_err(|e| {
            StryxError::Config(format!("Invalid --test-runner-options JSON: {}", e))
        })?;
        Ok(Value::from_json(json))
    } else {
        Ok(Value::from(raw))
    }
}

/// CLI output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormatArg {
    #[default]
    Plain,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Plain => OutputFormat::Plain,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["stryx", "run", "--mutants", "mutants.json"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(run) => run,
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let run = run_args(&[]);
        assert_eq!(run.mutants, PathBuf::from("mutants.json"));
        assert!(run.concurrency.is_none());
        assert!(!run.disable_bail);
        assert!(matches!(run.format, OutputFormatArg::Plain));
    }

    #[test]
    fn test_run_requires_mutants() {
        assert!(Cli::try_parse_from(["stryx", "run"]).is_err());
    }

    #[test]
    fn test_flags_override_file_options() {
        let run = run_args(&[
            "-j",
            "3",
            "--coverage-analysis",
            "off",
            "--timeout-ms",
            "200",
            "--disable-bail",
            "--max-worker-memory",
            "1G",
            "--format",
            "json",
        ]);
        let mut options = StryxOptions::default();
        run.apply(&mut options).unwrap();

        assert_eq!(options.concurrency, Some(3));
        assert_eq!(options.coverage_analysis, CoverageAnalysis::Off);
        assert_eq!(options.timeout_ms, 200);
        assert!(options.disable_bail);
        assert_eq!(options.max_worker_memory_mib, Some(1024));
        assert!(matches!(run.format, OutputFormatArg::Json));
    }

    #[test]
    fn test_unset_flags_keep_file_options() {
        let run = run_args(&[]);
        let mut options = StryxOptions {
            timeout_ms: 42,
            allow_empty: true,
            ..Default::default()
        };
        run.apply(&mut options).unwrap();
        assert_eq!(options.timeout_ms, 42);
        assert!(options.allow_empty);
    }

    #[test]
    fn test_test_runner_options() {
        let run = run_args(&[
            "--test-runner",
            "fixture-test-runner",
            "--test-runner-options",
            "fixture.json",
        ]);
        let mut options = StryxOptions::default();
        run.apply(&mut options).unwrap();
        assert_eq!(options.test_runner.options, Value::from("fixture.json"));

        let run = run_args(&[
            "--test-runner",
            "fixture-test-runner",
            "--test-runner-options",
            "{ not json",
        ]);
        let err = run.apply(&mut StryxOptions::default()).unwrap_err();
        assert!(matches!(err, StryxError::Config(_)));
    }

    #[test]
    fn test_bad_coverage_analysis_rejected() {
        let result = Cli::try_parse_from([
            "stryx",
            "run",
            "--mutants",
            "m.json",
            "--coverage-analysis",
            "sometimes",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from(["stryx", "-vv", "--no-color", "plugins"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        assert!(matches!(args.command, Commands::Plugins));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["stryx", "-v", "-q", "plugins"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_command_is_hidden() {
        let args = Cli::try_parse_from(["stryx", "worker"]).unwrap();
        assert!(matches!(args.command, Commands::Worker));
        let help = Cli::command().render_help().to_string();
        assert!(!help.lines().any(|l| l.trim_start().starts_with("worker")));
    }
}
