//! LoadBench Example Workloads
//!
//! Measures a CPU-bound and a memory-bound workload, each in its own worker.
//!
//! Run with:
//!   cargo run --example system_load                               # Clean-image workers
//!   cargo run --example system_load -- --isolation copy-on-write  # Forked workers
//!   cargo run --example system_load -- --rounds 10 --clock wall   # Override the run options
//!   cargo run --example system_load -- --list                     # List workloads
//!   cargo run --example system_load -- --format json --no-save    # JSON to stdout

use loadbench::prelude::*;
use serde::{Deserialize, Serialize};
use std::hint::black_box;

// ============================================================================
// CPU
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Primes {
    limit: u64,
}

/// Trial division over a range, single-threaded
#[derive(Default)]
struct CountPrimes;

impl Workload for CountPrimes {
    type Context = Primes;

    fn run(&mut self, ctx: &Primes) -> HookResult {
        let count = (2..ctx.limit)
            .filter(|n| (2..).take_while(|d| d * d <= *n).all(|d| n % d != 0))
            .count();
        black_box(count);
        Ok(())
    }
}

workload!("count-primes", CountPrimes);

// ============================================================================
// Memory
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Buffers {
    count: usize,
    mib: usize,
}

/// Allocates and touches buffers; the previous round's buffers are freed in prerun
#[derive(Default)]
struct FillBuffers {
    held: Vec<Vec<u8>>,
}

impl Workload for FillBuffers {
    type Context = Buffers;

    fn setup(&mut self, ctx: &Buffers) -> HookResult {
        if ctx.mib == 0 {
            return Err("buffer size must be positive".into());
        }
        self.held.reserve(ctx.count);
        Ok(())
    }

    fn prerun(&mut self, _: &Buffers) -> HookResult {
        self.held.clear();
        Ok(())
    }

    fn run(&mut self, ctx: &Buffers) -> HookResult {
        for i in 0..ctx.count {
            self.held.push(vec![i as u8; ctx.mib << 20]);
        }
        black_box(&self.held);
        Ok(())
    }
}

workload!("fill-buffers", FillBuffers);

fn main() -> anyhow::Result<()> {
    loadbench::run(|suite| {
        let cpu = suite.benchmark("cpu")?;
        let options = cpu.defaults().with_rounds(5).warmup(1);
        cpu.add_run("primes-200k", "count-primes", &Primes { limit: 200_000 }, &options)?;
        cpu.add_run("primes-400k", "count-primes", &Primes { limit: 400_000 }, &options)?;

        let memory = suite.benchmark("memory")?;
        let base = memory.defaults().with_rounds(5);
        let buffers = Buffers { count: 8, mib: 32 };
        memory.add_run("reclaiming", "fill-buffers", &buffers, &base)?;
        memory.add_run(
            "suspended",
            "fill-buffers",
            &buffers,
            &base.reclamation(false),
        )?;
        Ok(())
    })
}
