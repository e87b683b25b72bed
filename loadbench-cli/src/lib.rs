#![warn(missing_docs)]
//! LoadBench CLI Library
//!
//! Orchestrator, worker process management and the command-line harness for
//! benchmark binaries. Register workloads with [`loadbench_core::workload!`] and
//! hand a closure that declares benchmarks to [`run`]:
//!
//! ```ignore
//! use loadbench::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     loadbench::run(|suite| {
//!         let bench = suite.benchmark("sorting")?;
//!         let options = bench.defaults().with_rounds(5).warmup(1);
//!         bench.add_run("vec-sort", "sort", &SortContext { len: 1 << 20 }, &options)?;
//!         Ok(())
//!     })
//! }
//! ```
//!
//! The same binary serves as the worker image when runs use
//! [`SpawnStrategy::CleanImage`], so worker dispatch happens before anything
//! else, including argument parsing.

mod config;
mod metadata;
mod orchestrator;
mod suite;
mod worker;

pub use config::*;
pub use metadata::gather_host_info;
pub use orchestrator::{
    Clock, Orchestrator, OrchestratorSettings, RoundResult, RunError, RunOptions, RunRegistry,
    RunState, build_run_report,
};
pub use suite::{Benchmark, RESULTS_FILE, Suite, SuiteError};
pub use worker::{DEFAULT_HANDSHAKE_TIMEOUT, SpawnStrategy, WorkerError, WorkerHandle};

use clap::Parser;
use loadbench_core::{WorkerMain, registered_workloads, worker_requested};
use loadbench_report::{OutputFormat, format_human_output, generate_json_report};
use std::path::PathBuf;

/// LoadBench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "loadbench")]
#[command(author, version, about = "LoadBench - resource benchmarking in isolated workers")]
pub struct Cli {
    /// Output format: human, json
    #[arg(long)]
    pub format: Option<String>,

    /// Results directory (default: config or ./loadbench_results/<benchmark>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file (default: discover loadbench.toml upwards)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not write results to disk
    #[arg(long)]
    pub no_save: bool,

    /// Do not print result tables
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Measured rounds per run, overriding the configuration
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Warmup rounds per run, overriding the configuration
    #[arg(long)]
    pub warmup_rounds: Option<u32>,

    /// Sampler interval, e.g. "20ms", overriding the configuration
    #[arg(long)]
    pub interval: Option<String>,

    /// Worker creation strategy: clean-image, copy-on-write
    #[arg(long)]
    pub isolation: Option<SpawnStrategy>,

    /// Clock for round times: process, wall
    #[arg(long)]
    pub clock: Option<Clock>,

    /// List registered workloads and exit
    #[arg(long)]
    pub list: bool,

    /// Write a default loadbench.toml into the current directory and exit
    #[arg(long)]
    pub init_config: bool,

    /// Internal: run as worker process (used by the orchestrator)
    #[arg(long, hide = true)]
    pub loadbench_worker: bool,

    /// Internal: absorb cargo bench's --bench flag
    #[arg(long, hide = true)]
    pub bench: bool,
}

/// Run the LoadBench CLI with the process arguments.
///
/// `body` declares benchmarks and their runs on the [`Suite`]. Results are
/// printed and saved after it returns.
pub fn run<F>(body: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut Suite) -> anyhow::Result<()>,
{
    serve_worker_if_requested();
    let cli = Cli::parse();
    run_with_cli(cli, body)
}

/// Run the LoadBench CLI with pre-parsed arguments.
pub fn run_with_cli<F>(cli: Cli, body: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut Suite) -> anyhow::Result<()>,
{
    // Handle worker mode first (before any other initialization)
    if cli.loadbench_worker {
        return run_worker_mode();
    }

    let filter = if cli.verbose {
        "loadbench=debug"
    } else {
        "loadbench=info"
    };
    // A host application may already own the global subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if cli.list {
        list_workloads();
        return Ok(());
    }

    if cli.init_config {
        let path = LoadBenchConfig::write_default(".")?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => LoadBenchConfig::load(path)?,
        None => LoadBenchConfig::discover().unwrap_or_default(),
    };

    let mut settings = config.orchestrator_settings()?;
    if let Some(interval) = &cli.interval {
        let nanos = LoadBenchConfig::parse_duration(interval)?;
        if nanos == 0 {
            anyhow::bail!("Sampler interval must be positive");
        }
        settings.interval = std::time::Duration::from_nanos(nanos);
    }

    let format: OutputFormat = cli
        .format
        .as_deref()
        .unwrap_or(&config.output.format)
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    settings.progress = !cli.quiet && format == OutputFormat::Human;

    let options = apply_overrides(config.run_options(), &cli);

    // Tables are printed once, after the suite finished
    let mut suite = Suite::with_settings(settings, options).quiet(true);
    body(&mut suite)?;

    match format {
        OutputFormat::Human if !cli.quiet => {
            for benchmark in suite.benchmarks() {
                print!(
                    "{}",
                    format_human_output(benchmark.name(), &benchmark.statistics())
                );
            }
        }
        OutputFormat::Human => {}
        OutputFormat::Json => {
            for benchmark in suite.benchmarks() {
                println!("{}", generate_json_report(&benchmark.document())?);
            }
        }
    }

    if !cli.no_save && config.output.save {
        let root = cli.output.as_deref().or(config.output.directory.as_deref());
        for path in suite.save_results(root)? {
            if !cli.quiet {
                eprintln!("Results written to: {}", path.display());
            }
        }
    }

    Ok(())
}

/// Serve as a worker and exit if this process was launched as one.
///
/// Binaries with their own argument handling call this first thing in `main`
/// so that [`SpawnStrategy::CleanImage`] workers never reach user code.
pub fn serve_worker_if_requested() {
    if !worker_requested() {
        return;
    }
    let code = match run_worker_mode() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("loadbench worker: {e}");
            1
        }
    };
    std::process::exit(code);
}

/// Run as a worker process (IPC mode)
fn run_worker_mode() -> anyhow::Result<()> {
    let mut worker = WorkerMain::new();
    worker
        .run()
        .map_err(|e| anyhow::anyhow!("Worker error: {}", e))
}

fn apply_overrides(mut options: RunOptions, cli: &Cli) -> RunOptions {
    if let Some(rounds) = cli.rounds {
        options.rounds = rounds;
    }
    if let Some(warmup) = cli.warmup_rounds {
        options.warmup_rounds = warmup;
    }
    if let Some(strategy) = cli.isolation {
        options.spawn = strategy;
    }
    if let Some(clock) = cli.clock {
        options.clock = clock;
    }
    options
}

fn list_workloads() {
    let workloads = registered_workloads();
    println!("LoadBench Workloads:");
    for def in &workloads {
        println!("├── {} ({})", def.id, def.type_name);
    }
    println!("{} workloads registered.", workloads.len());
}
