//! Binaries whose `main` never dispatches worker mode
//!
//! A clean-image worker of this binary re-enters `main` and reaches the
//! orchestrator again. That must end the worker quickly instead of starting a
//! chain of nested workers. Runs without the libtest harness so the worker
//! re-executes this very `main`.

use loadbench::{
    Orchestrator, RunError, RunOptions, RunState, SpawnStrategy, WorkerError, WorkerHandle,
    Workload, worker_requested, workload,
};
use std::time::{Duration, Instant};

/// Makes the re-executed worker hang instead of returning from `main`
const STALL_ENV: &str = "LOADBENCH_TEST_STALL";

#[derive(Default)]
struct Noop;

impl Workload for Noop {
    type Context = ();

    fn run(&mut self, _: &()) -> loadbench::HookResult {
        Ok(())
    }
}

workload!("ud-noop", Noop);

/// What the re-executed binary does when it finds itself in a worker
fn act_as_undispatched_worker() -> ! {
    if std::env::var_os(STALL_ENV).is_some() {
        std::thread::sleep(Duration::from_secs(60));
        std::process::exit(0);
    }

    let mut orch = Orchestrator::new();
    let nested = orch.benchmark_run("nested", "ud-noop", &(), &RunOptions::default());
    let spawned = WorkerHandle::spawn(SpawnStrategy::CopyOnWrite);
    let refused = matches!(nested, Err(RunError::InvalidOptions(_)))
        && matches!(spawned, Err(WorkerError::NestedWorker));
    std::process::exit(if refused { 0 } else { 2 });
}

fn test_undispatched_worker_ends_the_run() {
    let mut orch = Orchestrator::new();
    let started = Instant::now();
    let err = orch
        .benchmark_run("outer", "ud-noop", &(), &RunOptions::rounds(2))
        .unwrap_err();

    assert!(
        matches!(
            err,
            RunError::Worker {
                state: RunState::WorkerStarting,
                source: WorkerError::WorkerCrashed(_),
                ..
            }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(err.run(), Some("outer"));
    assert!(err.to_string().contains("worker-starting"));
    assert!(started.elapsed() < loadbench::DEFAULT_HANDSHAKE_TIMEOUT);
    assert!(orch.registry().is_empty());
}

fn test_silent_worker_hits_handshake_timeout() {
    // SAFETY: single-threaded at this point; the worker inherits the variable.
    unsafe { std::env::set_var(STALL_ENV, "1") };
    let started = Instant::now();
    let result = WorkerHandle::spawn_with_timeout(
        SpawnStrategy::CleanImage,
        Duration::from_millis(300),
    );
    // SAFETY: as above.
    unsafe { std::env::remove_var(STALL_ENV) };

    match result {
        Err(WorkerError::HandshakeTimeout(waited)) => {
            assert_eq!(waited, Duration::from_millis(300))
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(worker) => panic!("worker {} completed a handshake", worker.id()),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

fn main() {
    // No serve_worker_if_requested() here on purpose
    if worker_requested() {
        act_as_undispatched_worker();
    }

    let tests: [(&str, fn()); 2] = [
        (
            "test_undispatched_worker_ends_the_run",
            test_undispatched_worker_ends_the_run,
        ),
        (
            "test_silent_worker_hits_handshake_timeout",
            test_silent_worker_hits_handshake_timeout,
        ),
    ];

    for (name, test) in tests {
        test();
        println!("test {name} ... ok");
    }
    println!("\ntest result: ok. {} passed", tests.len());
}
