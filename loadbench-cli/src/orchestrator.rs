//! Execution Orchestrator
//!
//! Drives one named run end to end:
//!
//! ```text
//! Created → WorkerStarting → Warmup → (Prerun → Sampling → Stats) × rounds → Aggregating → Done
//! ```
//!
//! Any failure moves the run to `Failed`, tears the worker down and surfaces the
//! error; nothing is stored under the run's name in that case.

use crate::worker::{DEFAULT_HANDSHAKE_TIMEOUT, SpawnStrategy, WorkerError, WorkerHandle};
use fxhash::FxHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use loadbench_core::{
    DEFAULT_INTERVAL, Sampler, SamplerError, ScopeRun, find_workload, worker_requested,
};
use loadbench_ipc::{CONTEXT_CHUNK_SIZE, OrchestratorCommand, Phase, RoundTiming, WorkerMessage};
use loadbench_report::{RunReport, TimeStats};
use loadbench_stats::{
    DEFAULT_PERCENTILES, RESOURCE_PRECISION, StatsError, TIME_PRECISION, aggregate_rounds,
    describe, round_to,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by [`Orchestrator::benchmark_run`]
#[derive(Debug, Error)]
pub enum RunError {
    /// A run with this name already exists
    #[error("run `{0}` already exists")]
    DuplicateRun(String),

    /// No run with this name exists
    #[error("results of run `{0}` not found")]
    RunNotFound(String),

    /// No workload is registered under this id
    #[error("workload `{0}` is not registered")]
    UnknownWorkload(String),

    /// Rejected run options
    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    /// The context could not be encoded
    #[error("run `{run}`: failed to encode context: {source}")]
    Context {
        /// Run name
        run: String,
        /// Encoder error
        #[source]
        source: serde_json::Error,
    },

    /// Worker process failure
    #[error("run `{run}` failed in {state}: {source}")]
    Worker {
        /// Run name
        run: String,
        /// State the run was in
        state: RunState,
        /// Underlying worker error
        #[source]
        source: WorkerError,
    },

    /// Sampler failure
    #[error("run `{run}` failed in {state}: sampler error: {source}")]
    Sampler {
        /// Run name
        run: String,
        /// State the run was in
        state: RunState,
        /// Underlying sampler error
        #[source]
        source: SamplerError,
    },

    /// A workload hook returned an error or panicked
    #[error("run `{run}` failed in {phase}: {message}")]
    Workload {
        /// Run name
        run: String,
        /// Failing phase
        phase: Phase,
        /// Error message from the worker
        message: String,
    },

    /// Aggregation failed
    #[error("run `{run}` failed in {state}: statistics error: {source}")]
    Stats {
        /// Run name
        run: String,
        /// State the run was in
        state: RunState,
        /// Underlying statistics error
        #[source]
        source: StatsError,
    },
}

impl RunError {
    /// Name of the failed run, if the error belongs to one
    pub fn run(&self) -> Option<&str> {
        match self {
            RunError::DuplicateRun(run) | RunError::RunNotFound(run) => Some(run),
            RunError::Context { run, .. }
            | RunError::Worker { run, .. }
            | RunError::Sampler { run, .. }
            | RunError::Workload { run, .. }
            | RunError::Stats { run, .. } => Some(run),
            RunError::UnknownWorkload(_) | RunError::InvalidOptions(_) => None,
        }
    }
}

/// A failure inside a run, before it is tagged with the run's name and state
#[derive(Debug, Error)]
enum Fault {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("{phase}: {message}")]
    Workload { phase: Phase, message: String },
}

impl Fault {
    fn into_run_error(self, run: &str, state: RunState) -> RunError {
        let run = run.to_string();
        match self {
            Fault::Worker(source) => RunError::Worker { run, state, source },
            Fault::Sampler(source) => RunError::Sampler { run, state, source },
            Fault::Stats(source) => RunError::Stats { run, state, source },
            Fault::Workload { phase, message } => RunError::Workload {
                run,
                phase,
                message,
            },
        }
    }
}

/// Which clock feeds `time` in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Clock {
    /// CPU time consumed by the worker process
    #[default]
    Process,
    /// Wall-clock time
    Wall,
}

impl Clock {
    fn seconds(self, timing: &RoundTiming) -> f64 {
        let nanos = match self {
            Clock::Process => timing.cpu_nanos,
            Clock::Wall => timing.wall_nanos,
        };
        Duration::from_nanos(nanos).as_secs_f64()
    }
}

impl std::str::FromStr for Clock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "cpu" => Ok(Clock::Process),
            "wall" => Ok(Clock::Wall),
            other => Err(format!("Unknown clock: {}", other)),
        }
    }
}

/// Per-call options of [`Orchestrator::benchmark_run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Measured rounds (at least 1)
    pub rounds: u32,
    /// Untimed, unsampled rounds before measurement
    pub warmup_rounds: u32,
    /// Keep automatic memory reclamation enabled during timed calls
    pub reclamation_active: bool,
    /// How this run's worker is created
    pub spawn: SpawnStrategy,
    /// Clock used for `time`
    pub clock: Clock,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rounds: 1,
            warmup_rounds: 0,
            reclamation_active: true,
            spawn: SpawnStrategy::CleanImage,
            clock: Clock::Process,
        }
    }
}

impl RunOptions {
    /// Options with `rounds` measured rounds and defaults otherwise
    pub fn rounds(rounds: u32) -> Self {
        Self {
            rounds,
            ..Self::default()
        }
    }

    /// Set measured rounds
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    /// Set warmup rounds
    pub fn warmup(mut self, warmup_rounds: u32) -> Self {
        self.warmup_rounds = warmup_rounds;
        self
    }

    /// Set whether reclamation stays active during timed calls
    pub fn reclamation(mut self, active: bool) -> Self {
        self.reclamation_active = active;
        self
    }

    /// Set the spawn strategy
    pub fn spawn(mut self, strategy: SpawnStrategy) -> Self {
        self.spawn = strategy;
        self
    }

    /// Set the clock
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Settings shared by every run of one orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Sampler polling interval
    pub interval: Duration,
    /// Percentiles reported in every statistics block
    pub percentiles: Vec<u32>,
    /// Decimal places for cpu and ram statistics
    pub resource_precision: u32,
    /// Decimal places for time statistics and raw times
    pub time_precision: u32,
    /// Draw a progress bar over the measured rounds
    pub progress: bool,
    /// How long a new worker may take to announce itself
    pub handshake_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            resource_precision: RESOURCE_PRECISION,
            time_precision: TIME_PRECISION,
            progress: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// State of one `benchmark_run` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Options validated, nothing started
    Created,
    /// Worker process being created
    WorkerStarting,
    /// Setup and warmup running in the worker
    Warmup,
    /// Prerun hook of round `i`
    Prerun(u32),
    /// Round `i` being timed and sampled
    Sampling(u32),
    /// Round `i` being recorded
    Stats(u32),
    /// All rounds done, statistics being computed
    Aggregating,
    /// Report stored
    Done,
    /// Run aborted
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Created => f.write_str("created"),
            RunState::WorkerStarting => f.write_str("worker-starting"),
            RunState::Warmup => f.write_str("warmup"),
            RunState::Prerun(i) => write!(f, "prerun {i}"),
            RunState::Sampling(i) => write!(f, "sampling {i}"),
            RunState::Stats(i) => write!(f, "stats {i}"),
            RunState::Aggregating => f.write_str("aggregating"),
            RunState::Done => f.write_str("done"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

/// One measured round: its sampling scope and its timing
#[derive(Debug, Clone)]
pub struct RoundResult {
    /// Samples taken while the round ran
    pub scope: ScopeRun,
    /// Elapsed wall and process CPU time
    pub timing: RoundTiming,
}

/// Reports keyed by run name, in insertion order
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Vec<(String, RunReport)>,
    index: FxHashMap<String, usize>,
}

impl RunRegistry {
    /// Whether a run with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Store a report; fails if the name is taken
    pub fn insert(&mut self, name: &str, report: RunReport) -> Result<&RunReport, RunError> {
        if self.contains(name) {
            return Err(RunError::DuplicateRun(name.to_string()));
        }
        self.index.insert(name.to_string(), self.runs.len());
        self.runs.push((name.to_string(), report));
        let (_, stored) = &self.runs[self.runs.len() - 1];
        Ok(stored)
    }

    /// Report of a named run
    pub fn get(&self, name: &str) -> Option<&RunReport> {
        self.index.get(name).map(|&i| &self.runs[i].1)
    }

    /// Runs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RunReport)> {
        self.runs.iter().map(|(name, report)| (name.as_str(), report))
    }

    /// Owned copy of all runs, in insertion order
    pub fn to_vec(&self) -> Vec<(String, RunReport)> {
        self.runs.clone()
    }

    /// Number of stored runs
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no run is stored
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Runs workloads in isolated worker processes and keeps their reports
#[derive(Debug, Default)]
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: RunRegistry,
}

impl Orchestrator {
    /// Orchestrator with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Orchestrator with explicit settings
    pub fn with_settings(settings: OrchestratorSettings) -> Self {
        Self {
            settings,
            registry: RunRegistry::default(),
        }
    }

    /// Settings shared by all runs
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Stored reports
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Report of a finished run
    pub fn run_statistics(&self, name: &str) -> Result<&RunReport, RunError> {
        self.registry
            .get(name)
            .ok_or_else(|| RunError::RunNotFound(name.to_string()))
    }

    /// Run `workload` under `name` and store its report
    ///
    /// `context` is encoded once and handed to every hook of the workload inside
    /// the worker. Configuration errors are raised before any process exists.
    pub fn benchmark_run<C: Serialize + ?Sized>(
        &mut self,
        name: &str,
        workload: &str,
        context: &C,
        options: &RunOptions,
    ) -> Result<&RunReport, RunError> {
        if self.registry.contains(name) {
            return Err(RunError::DuplicateRun(name.to_string()));
        }
        if options.rounds == 0 {
            return Err(RunError::InvalidOptions(
                "at least one round is required".to_string(),
            ));
        }
        if find_workload(workload).is_none() {
            return Err(RunError::UnknownWorkload(workload.to_string()));
        }
        if worker_requested() {
            return Err(RunError::InvalidOptions(
                "benchmark_run called inside a worker process; dispatch worker mode first \
                 (see serve_worker_if_requested)"
                    .to_string(),
            ));
        }
        let context_json = serde_json::to_string(context).map_err(|source| RunError::Context {
            run: name.to_string(),
            source,
        })?;

        let mut tracker = StateTracker::new(name);
        info!(run = name, workload, rounds = options.rounds, spawn = %options.spawn, "starting run");

        let report = match self.execute(&mut tracker, name, workload, &context_json, options) {
            Ok(report) => report,
            Err(fault) => {
                let e = fault.into_run_error(name, tracker.state);
                tracker.enter(RunState::Failed);
                warn!(run = name, error = %e, "run failed");
                return Err(e);
            }
        };

        tracker.enter(RunState::Done);
        self.registry.insert(name, report)
    }

    fn execute(
        &self,
        tracker: &mut StateTracker<'_>,
        name: &str,
        workload: &str,
        context_json: &str,
        options: &RunOptions,
    ) -> Result<RunReport, Fault> {
        tracker.enter(RunState::WorkerStarting);
        let mut worker =
            WorkerHandle::spawn_with_timeout(options.spawn, self.settings.handshake_timeout)?;
        debug!(run = name, pid = worker.id(), "worker up");

        match self.drive(tracker, &mut worker, name, workload, context_json, options) {
            Ok(rounds) => {
                if let Err(e) = worker.shutdown() {
                    warn!(run = name, error = %e, "worker did not shut down cleanly");
                }
                tracker.enter(RunState::Aggregating);
                Ok(build_run_report(
                    &rounds,
                    options.clock,
                    &self.settings.percentiles,
                    self.settings.resource_precision,
                    self.settings.time_precision,
                )?)
            }
            Err(e) => {
                worker.kill();
                Err(e)
            }
        }
    }

    fn drive(
        &self,
        tracker: &mut StateTracker<'_>,
        worker: &mut WorkerHandle,
        name: &str,
        workload: &str,
        context_json: &str,
        options: &RunOptions,
    ) -> Result<Vec<RoundResult>, Fault> {
        tracker.enter(RunState::Warmup);
        send_context(worker, context_json)?;
        let reply = worker.request(&OrchestratorCommand::Startup {
            workload: workload.to_string(),
            warmup_rounds: options.warmup_rounds,
        })?;
        let pid = match reply {
            WorkerMessage::Ready {
                pid,
                affinity_reset,
            } => {
                if !affinity_reset {
                    warn!(run = name, "worker CPU affinity could not be reset");
                }
                pid
            }
            other => return Err(unexpected("Ready", other)),
        };

        let mut sampler = Sampler::attach(pid, self.settings.interval)?;
        let progress = self.progress_bar(name, options.rounds);
        let mut rounds = Vec::with_capacity(options.rounds as usize);

        for round in 0..options.rounds {
            tracker.enter(RunState::Prerun(round));
            match worker.request(&OrchestratorCommand::Prerun { round })? {
                WorkerMessage::PrerunDone => {}
                other => return Err(unexpected("PrerunDone", other)),
            }

            tracker.enter(RunState::Sampling(round));
            sampler.scope_enter()?;
            let reply = worker.request(&OrchestratorCommand::Round {
                round,
                reclamation_active: options.reclamation_active,
            });
            // Close the scope before looking at the reply, successful or not
            let scope = sampler.scope_exit()?;
            let timing = match reply? {
                WorkerMessage::RoundComplete(timing) => timing,
                other => return Err(unexpected("RoundComplete", other)),
            };

            tracker.enter(RunState::Stats(round));
            debug!(
                run = name,
                round,
                samples = scope.len(),
                synthetic = scope.is_synthetic(),
                wall_nanos = timing.wall_nanos,
                cpu_nanos = timing.cpu_nanos,
                "round complete"
            );
            rounds.push(RoundResult { scope, timing });
            progress.inc(1);
        }

        progress.finish_and_clear();
        Ok(rounds)
    }

    fn progress_bar(&self, name: &str, rounds: u32) -> ProgressBar {
        if !self.settings.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(u64::from(rounds));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(name.to_string());
        pb
    }
}

/// Stream the encoded context to the worker in frame-sized pieces
fn send_context(worker: &mut WorkerHandle, context_json: &str) -> Result<(), Fault> {
    let bytes = context_json.as_bytes();
    for chunk in bytes.chunks(CONTEXT_CHUNK_SIZE) {
        match worker.request(&OrchestratorCommand::Context {
            chunk: chunk.to_vec(),
        })? {
            WorkerMessage::ContextReceived { .. } => {}
            other => return Err(unexpected("ContextReceived", other)),
        }
    }
    Ok(())
}

/// Map a reply that is not the expected one to an error
fn unexpected(expected: &str, got: WorkerMessage) -> Fault {
    match got {
        WorkerMessage::Failure { phase, message } => Fault::Workload { phase, message },
        other => Fault::Worker(WorkerError::ProtocolError {
            expected: expected.to_string(),
            got: other.kind().to_string(),
        }),
    }
}

/// Logs state transitions of one run
struct StateTracker<'a> {
    run: &'a str,
    state: RunState,
}

impl<'a> StateTracker<'a> {
    fn new(run: &'a str) -> Self {
        Self {
            run,
            state: RunState::Created,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(run = self.run, from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

/// Aggregate measured rounds into a report
///
/// `cpu` and `ram` go through the per-round path, so their `total` is computed
/// from per-round means. Round times go through the flat path.
pub fn build_run_report(
    rounds: &[RoundResult],
    clock: Clock,
    percentiles: &[u32],
    resource_precision: u32,
    time_precision: u32,
) -> Result<RunReport, StatsError> {
    let cpu: Vec<Vec<f64>> = rounds.iter().map(|r| r.scope.cpu_series()).collect();
    let ram: Vec<Vec<f64>> = rounds.iter().map(|r| r.scope.memory_series()).collect();
    let times: Vec<f64> = rounds.iter().map(|r| clock.seconds(&r.timing)).collect();

    Ok(RunReport {
        cpu: aggregate_rounds(&cpu, percentiles, resource_precision)?,
        ram: aggregate_rounds(&ram, percentiles, resource_precision)?,
        time: TimeStats {
            total: describe(&times, percentiles, time_precision)?,
            raw: times.iter().map(|t| round_to(*t, time_precision)).collect(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadbench_stats::Stats;

    fn stats(mean: f64) -> Stats {
        describe(&[mean], &[50], 2).unwrap()
    }

    fn report(mean: f64) -> RunReport {
        RunReport {
            cpu: aggregate_rounds(&[vec![mean]], &[50], 2).unwrap(),
            ram: aggregate_rounds(&[vec![mean]], &[50], 2).unwrap(),
            time: TimeStats {
                total: stats(mean),
                raw: vec![mean],
            },
        }
    }

    #[test]
    fn test_registry_rejects_duplicates_and_keeps_order() {
        let mut registry = RunRegistry::default();
        registry.insert("b", report(1.0)).unwrap();
        registry.insert("a", report(2.0)).unwrap();

        let err = registry.insert("b", report(3.0)).unwrap_err();
        assert!(matches!(err, RunError::DuplicateRun(ref n) if n == "b"));
        assert_eq!(registry.get("b").unwrap().time.raw, vec![1.0]);

        let names: Vec<&str> = registry.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_configuration_errors_precede_execution() {
        let mut orchestrator = Orchestrator::new();
        let zero = RunOptions::rounds(0);
        assert!(matches!(
            orchestrator.benchmark_run("x", "anything", &(), &zero),
            Err(RunError::InvalidOptions(_))
        ));
        assert!(matches!(
            orchestrator.benchmark_run("x", "no-such-workload", &(), &RunOptions::default()),
            Err(RunError::UnknownWorkload(_))
        ));
        assert!(matches!(
            orchestrator.run_statistics("x"),
            Err(RunError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_clock_selects_timing_source() {
        let timing = RoundTiming {
            wall_nanos: 2_000_000_000,
            cpu_nanos: 500_000_000,
        };
        assert_eq!(Clock::Wall.seconds(&timing), 2.0);
        assert_eq!(Clock::Process.seconds(&timing), 0.5);
        assert_eq!("wall".parse::<Clock>(), Ok(Clock::Wall));
    }

    #[test]
    fn test_options_builder() {
        let options = RunOptions::rounds(5)
            .warmup(2)
            .reclamation(false)
            .spawn(SpawnStrategy::CopyOnWrite)
            .clock(Clock::Wall);
        assert_eq!(options.rounds, 5);
        assert_eq!(options.warmup_rounds, 2);
        assert!(!options.reclamation_active);
        assert_eq!(options.spawn, SpawnStrategy::CopyOnWrite);
        assert_eq!(RunOptions::default().spawn, SpawnStrategy::CleanImage);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::Sampling(3).to_string(), "sampling 3");
        assert_eq!(RunState::WorkerStarting.to_string(), "worker-starting");
    }

    #[test]
    fn test_faults_carry_run_and_state() {
        let fault = Fault::Worker(WorkerError::WorkerCrashed("pipe closed".to_string()));
        let err = fault.into_run_error("nightly", RunState::Sampling(2));
        assert_eq!(err.run(), Some("nightly"));
        assert!(matches!(
            err,
            RunError::Worker {
                state: RunState::Sampling(2),
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "run `nightly` failed in sampling 2: Worker crashed: pipe closed"
        );

        let fault = unexpected(
            "Ready",
            WorkerMessage::Failure {
                phase: Phase::Setup,
                message: "no fixtures".to_string(),
            },
        );
        let err = fault.into_run_error("nightly", RunState::Warmup);
        assert_eq!(err.to_string(), "run `nightly` failed in setup: no fixtures");

        let err = unexpected("Ready", WorkerMessage::PrerunDone)
            .into_run_error("nightly", RunState::Warmup);
        assert!(matches!(
            err,
            RunError::Worker {
                source: WorkerError::ProtocolError { .. },
                ..
            }
        ));
    }
}
