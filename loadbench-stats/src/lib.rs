#![warn(missing_docs)]
//! LoadBench Statistical Engine
//!
//! Pure functions turning sampled data into descriptive statistics:
//! - max, mean and population standard deviation
//! - linearly interpolated percentiles
//! - per-round blocks plus a `total` block for two-dimensional data
//!
//! Nothing here keeps state between calls; the same input always yields
//! bit-identical output.

mod aggregate;
mod percentiles;
mod summary;

pub use aggregate::{
    Aggregate, RoundStats, Samples, StatsError, aggregate, aggregate_json, aggregate_rounds,
};
pub use summary::{Stats, describe, round_to};

/// Percentiles reported unless the caller asks for others
pub const DEFAULT_PERCENTILES: [u32; 6] = [25, 50, 75, 90, 95, 99];

/// Decimal places kept for CPU and memory statistics
pub const RESOURCE_PRECISION: u32 = 2;

/// Decimal places kept for timing statistics
pub const TIME_PRECISION: u32 = 4;
