//! stryx - worker-pool core for mutation testing

mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tokio::sync::mpsc;
use tracing::{Level, info};

use cli::{Cli, Commands, RunArgs};
use stryx::execution::{RunSummary, run_mutation_test_with};
use stryx::logging::{self, LogConfig};
use stryx::output::{OutputFormat, print_results};
use stryx::progress::RunProgress;
use stryx::worker::subject::PLUGINS;
use stryx::worker::{WorkerOptions, run_worker_main};
use stryx::{Mutant, StryxError, StryxOptions, theme};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Plugins => {
            for plugin in PLUGINS {
                println!("{}", plugin);
            }
            Ok(())
        }
        Commands::Worker => run_worker_main(),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Configuration errors speak for themselves
        let is_config = matches!(e.downcast_ref::<StryxError>(), Some(StryxError::Config(_)));
        if !is_config {
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
        }
        std::process::exit(1);
    }
}

/// Log level selected by `-v`/`-q`.
fn log_level(cli: &Cli) -> Level {
    if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn init_logging(cli: &Cli, level: Level) {
    let mut config = LogConfig::new().with_level(level);
    if cli.quiet || cli.verbose > 0 {
        config = config.with_filter(level.to_string().to_lowercase());
    }
    logging::init(config.with_env_overrides());
}

fn load_mutants(path: &Path) -> Result<Vec<Mutant>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mutants from {}", path.display()))?;
    let mutants: Vec<Mutant> = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid mutant list in {}", path.display()))?;
    Ok(mutants)
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let level = log_level(cli);
    init_logging(cli, level);

    let mut options = match &args.config {
        Some(path) => StryxOptions::load(path)?,
        None => StryxOptions::default(),
    };
    args.apply(&mut options)?;
    options.validate()?;

    let mutants = load_mutants(&args.mutants)?;
    info!(mutants = mutants.len(), "Loaded mutants");

    let mut base =
        WorkerOptions::for_run(options.test_runner.clone(), &options).with_log_level(level);
    if let Some(dir) = &args.working_dir {
        base = base.with_working_dir(dir);
    }

    let format: OutputFormat = args.format.into();
    let show_progress = !cli.quiet && format == OutputFormat::Plain;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let (results, summary) = runtime.block_on(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut progress = RunProgress::new(mutants.len(), show_progress);
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                progress.handle(event);
            }
            progress.finish()
        });

        let results = run_mutation_test_with(&options, mutants, &base, Some(tx)).await;
        let summary = consumer.await.ok().flatten();
        results.map(|results| {
            let summary = summary.unwrap_or_else(|| RunSummary::from_results(&results));
            (results, summary)
        })
    })?;

    print_results(&results, &summary, format);
    Ok(())
}
