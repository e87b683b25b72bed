#![warn(missing_docs)]
//! # LoadBench
//!
//! Resource benchmarking for Rust workloads in isolated worker processes.
//!
//! - **Process Isolation**: every run gets a fresh worker; a failing or crashing workload
//!   ends its run with an error and leaves the orchestrator intact
//! - **Resource Sampling**: CPU and memory of the worker's whole process tree, polled
//!   while each measured round executes
//! - **Round Statistics**: per-round statistics plus a `total` computed over the
//!   per-round means, so long rounds do not outweigh short ones
//! - **Reclamation Control**: allocator trimming between rounds, optionally suspended
//!   during the timed call
//!
//! ## Quick Start
//!
//! ```ignore
//! use loadbench::prelude::*;
//!
//! #[derive(Default)]
//! struct Allocate {
//!     buffers: Vec<Vec<u8>>,
//! }
//!
//! #[derive(serde::Deserialize)]
//! struct Size {
//!     mib: usize,
//! }
//!
//! impl Workload for Allocate {
//!     type Context = Size;
//!
//!     fn prerun(&mut self, _: &Size) -> HookResult {
//!         self.buffers.clear();
//!         Ok(())
//!     }
//!
//!     fn run(&mut self, size: &Size) -> HookResult {
//!         self.buffers.push(vec![1u8; size.mib << 20]);
//!         Ok(())
//!     }
//! }
//!
//! workload!("allocate", Allocate);
//!
//! fn main() -> anyhow::Result<()> {
//!     loadbench::run(|suite| {
//!         let bench = suite.benchmark("memory")?;
//!         let options = bench.defaults().with_rounds(10).warmup(1);
//!         bench.add_run("64 MiB", "allocate", &serde_json::json!({ "mib": 64 }), &options)?;
//!         Ok(())
//!     })
//! }
//! ```

// Re-export core types
pub use loadbench_core::{
    DEFAULT_INTERVAL, HookError, HookResult, Sample, Sampler, SamplerError, ScopeRun, Workload,
    WorkloadDef, registered_workloads, worker_requested, workload,
};

// Re-export orchestration
pub use loadbench_cli::{
    Benchmark, Clock, DEFAULT_HANDSHAKE_TIMEOUT, LoadBenchConfig, Orchestrator,
    OrchestratorSettings, RESULTS_FILE, RunError, RunOptions, RunState, SpawnStrategy, Suite,
    SuiteError, WorkerError, WorkerHandle, gather_host_info, serve_worker_if_requested,
};

// Re-export reports
pub use loadbench_report::{
    HostInfo, RunReport, SessionDocument, TimeStats, format_run_table, generate_json_report,
    load_json_report,
};

// Re-export stats
pub use loadbench_stats::{
    Aggregate, RoundStats, Samples, Stats, StatsError, aggregate, aggregate_json, describe,
};

// Re-export protocol types that surface in errors
pub use loadbench_ipc::{CONTEXT_CHUNK_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION, Phase};

/// Whether automatic memory reclamation is enabled in this process.
///
/// Inside a workload hook this tells whether the allocator currently returns
/// freed memory to the system on its own. It is `false` during a timed call of
/// a run with `reclamation_active` unset.
pub fn reclamation_enabled() -> bool {
    loadbench_core::reclaim::is_enabled()
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Benchmark, Clock, HookResult, RunOptions, RunReport, SpawnStrategy, Suite, Workload,
        workload,
    };
}

/// Run the LoadBench CLI harness.
///
/// Call this from your benchmark binary's `main()`:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     loadbench::run(|suite| {
///         // declare benchmarks and runs
///         Ok(())
///     })
/// }
/// ```
pub use loadbench_cli::run;
