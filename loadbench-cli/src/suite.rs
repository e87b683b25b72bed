//! Benchmarks and Suites
//!
//! A [`Benchmark`] is a named batch of runs on one host. It owns an
//! [`Orchestrator`], so run names are unique per benchmark, and it knows how to
//! persist its results:
//!
//! ```text
//! <path>/<host_name>/results.json
//! <path>/<host_name>/graphs/<run>/{time,cpu,ram}.csv
//! ```
//!
//! A [`Suite`] holds several benchmarks with unique names.

use crate::metadata::gather_host_info;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, RunError, RunOptions};
use fxhash::FxHashSet;
use loadbench_report::{
    CsvIllustrator, HostInfo, Illustrator, RunReport, SessionDocument, format_run_table,
    generate_json_report,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Name of the results document inside the host directory
pub const RESULTS_FILE: &str = "results.json";

/// Errors raised by [`Suite`] and [`Benchmark`]
#[derive(Debug, Error)]
pub enum SuiteError {
    /// A benchmark with this name already exists in the suite
    #[error("benchmark `{0}` already exists")]
    DuplicateBenchmark(String),

    /// A run failed
    #[error(transparent)]
    Run(#[from] RunError),

    /// Writing results failed
    #[error("failed to write results: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding results failed
    #[error("failed to encode results: {0}")]
    Json(#[from] serde_json::Error),
}

/// A named batch of runs with host information
#[derive(Debug)]
pub struct Benchmark {
    name: String,
    orchestrator: Orchestrator,
    host: HostInfo,
    defaults: RunOptions,
    quiet: bool,
}

impl Benchmark {
    /// Benchmark with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, OrchestratorSettings::default(), RunOptions::default())
    }

    /// Benchmark with explicit orchestrator settings and default run options
    pub fn with_settings(
        name: impl Into<String>,
        settings: OrchestratorSettings,
        defaults: RunOptions,
    ) -> Self {
        Self {
            name: name.into(),
            orchestrator: Orchestrator::with_settings(settings),
            host: gather_host_info(),
            defaults,
            quiet: false,
        }
    }

    /// Suppress the per-run result table
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Benchmark name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default run options, a starting point for [`Benchmark::add_run`]
    pub fn defaults(&self) -> RunOptions {
        self.defaults
    }

    /// Execute a run and keep its report
    pub fn add_run<C: Serialize + ?Sized>(
        &mut self,
        name: &str,
        workload: &str,
        context: &C,
        options: &RunOptions,
    ) -> Result<&RunReport, RunError> {
        let report = self
            .orchestrator
            .benchmark_run(name, workload, context, options)?;
        if !self.quiet {
            print!("{}", format_run_table(name, report));
        }
        Ok(report)
    }

    /// Report of one run
    pub fn run_statistics(&self, name: &str) -> Result<&RunReport, RunError> {
        self.orchestrator.run_statistics(name)
    }

    /// Reports of all runs, in the order they were added
    pub fn statistics(&self) -> Vec<(String, RunReport)> {
        self.orchestrator.registry().to_vec()
    }

    /// Whether no run was added yet
    pub fn is_empty(&self) -> bool {
        self.orchestrator.registry().is_empty()
    }

    /// Host the runs execute on
    pub fn host_info(&self) -> &HostInfo {
        &self.host
    }

    /// Persisted form of this benchmark
    pub fn document(&self) -> SessionDocument {
        SessionDocument {
            system_information: self.host.clone(),
            run_results: self.statistics(),
        }
    }

    /// Default results directory: `./loadbench_results/<benchmark>`
    pub fn default_results_dir(&self) -> PathBuf {
        PathBuf::from("loadbench_results").join(sanitize(&self.name))
    }

    /// Write results and CSV illustrations below `path/<host_name>/`
    ///
    /// Writes nothing and returns `None` when no run was added. Otherwise
    /// returns the path of the results document.
    pub fn save_results(&self, path: Option<&Path>) -> Result<Option<PathBuf>, SuiteError> {
        if self.is_empty() {
            return Ok(None);
        }

        let base = match path {
            Some(path) => path.to_path_buf(),
            None => self.default_results_dir(),
        };
        let host_dir = base.join(sanitize(&self.host.host_name));
        std::fs::create_dir_all(&host_dir)?;

        let document = self.document();
        let results_path = host_dir.join(RESULTS_FILE);
        std::fs::write(&results_path, generate_json_report(&document)?)?;

        let graphs = host_dir.join("graphs");
        for (run, report) in &document.run_results {
            CsvIllustrator.illustrate(run, report, &graphs.join(sanitize(run)))?;
        }

        info!(benchmark = %self.name, path = %results_path.display(), "results saved");
        Ok(Some(results_path))
    }
}

/// Replace characters that cannot appear in a single path component
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Benchmarks with unique names
#[derive(Debug)]
pub struct Suite {
    benchmarks: Vec<Benchmark>,
    names: FxHashSet<String>,
    settings: OrchestratorSettings,
    defaults: RunOptions,
    quiet: bool,
}

impl Default for Suite {
    fn default() -> Self {
        Self::new()
    }
}

impl Suite {
    /// Empty suite with default settings
    pub fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default(), RunOptions::default())
    }

    /// Empty suite whose benchmarks use these settings and run defaults
    pub fn with_settings(settings: OrchestratorSettings, defaults: RunOptions) -> Self {
        Self {
            benchmarks: Vec::new(),
            names: FxHashSet::default(),
            settings,
            defaults,
            quiet: false,
        }
    }

    /// Suppress per-run result tables in every benchmark
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Create a benchmark; names are unique per suite
    pub fn benchmark(&mut self, name: &str) -> Result<&mut Benchmark, SuiteError> {
        if !self.names.insert(name.to_string()) {
            return Err(SuiteError::DuplicateBenchmark(name.to_string()));
        }
        let benchmark = Benchmark::with_settings(name, self.settings.clone(), self.defaults)
            .quiet(self.quiet);
        self.benchmarks.push(benchmark);
        let last = self.benchmarks.len() - 1;
        Ok(&mut self.benchmarks[last])
    }

    /// Benchmark by name
    pub fn get(&self, name: &str) -> Option<&Benchmark> {
        self.benchmarks.iter().find(|b| b.name == name)
    }

    /// Benchmarks in creation order
    pub fn benchmarks(&self) -> &[Benchmark] {
        &self.benchmarks
    }

    /// Save every benchmark's results
    ///
    /// With `root`, benchmark `b` is written below `root/b`; otherwise each
    /// benchmark uses its default directory.
    pub fn save_results(&self, root: Option<&Path>) -> Result<Vec<PathBuf>, SuiteError> {
        let mut written = Vec::new();
        for benchmark in &self.benchmarks {
            let dir = root.map(|root| root.join(sanitize(&benchmark.name)));
            if let Some(path) = benchmark.save_results(dir.as_deref())? {
                written.push(path);
            }
        }
        Ok(written)
    }
}
