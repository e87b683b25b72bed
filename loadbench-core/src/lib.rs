#![warn(missing_docs)]
//! LoadBench Core - Sampler and Worker Runtime
//!
//! This crate provides both sides of a measured round:
//! - [`Sampler`]: background polling of a process tree's CPU and memory usage
//! - [`WorkerMain`]: the command loop running inside the isolated worker process
//! - [`Workload`]: the trait user workloads implement, registered with [`workload!`]
//! - Process CPU timing, affinity reset and allocator reclamation control

mod measure;
pub mod reclaim;
mod sampler;
mod worker;
mod workload;

pub use measure::{Timer, current_affinity, process_cpu_time, reset_affinity};
pub use sampler::{DEFAULT_INTERVAL, Sample, Sampler, SamplerError, ScopeRun};
pub use worker::{WorkerMain, worker_requested};
pub use workload::{HookError, HookResult, Workload, WorkloadDef, find_workload, registered_workloads};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Register a [`Workload`] type under an identifier.
///
/// The same registry is visible to the orchestrator and to every worker it
/// spawns, because both run the same binary.
///
/// ```ignore
/// #[derive(Default)]
/// struct Summation;
///
/// impl loadbench::Workload for Summation {
///     type Context = u64;
///     fn run(&mut self, n: &u64) -> loadbench::HookResult {
///         std::hint::black_box((0..*n).sum::<u64>());
///         Ok(())
///     }
/// }
///
/// loadbench::workload!("summation", Summation);
/// ```
#[macro_export]
macro_rules! workload {
    ($id:expr, $ty:ty) => {
        $crate::internal::inventory::submit! {
            $crate::WorkloadDef::new::<$ty>($id, stringify!($ty))
        }
    };
}
