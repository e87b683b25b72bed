//! One- and Two-Dimensional Aggregation
//!
//! Two-dimensional input is a list of rounds, each a list of samples. Every round
//! gets its own [`Stats`] block, and the `total` block is computed from the
//! per-round means rather than from the pooled samples, so a round that happened
//! to collect more samples does not weigh more than a short one.

use crate::summary::{Stats, describe};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by the statistics engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    /// Input, or one of its rounds, is empty
    #[error("empty list of data points given, need at least 1 data point")]
    NoDataPoints,

    /// Dynamic input is neither a flat list nor a list of flat lists
    #[error("given list of data points is not 1D or 2D: {0}")]
    WrongDimensionality(String),
}

/// Borrowed input for [`aggregate`]
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    /// A single list of samples
    Flat(&'a [f64]),
    /// One list of samples per round
    Rounds(&'a [Vec<f64>]),
}

/// Result of [`aggregate`], shaped like its input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Aggregate {
    /// Statistics of a flat list
    Flat(Stats),
    /// Per-round statistics plus `total`
    Rounds(RoundStats),
}

/// Per-round statistics plus the `total` block
///
/// Serialized as `{"0": {...}, "1": {...}, ..., "total": {...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundStats {
    /// One block per round, indexed by round number
    pub rounds: Vec<Stats>,
    /// Statistics over the per-round means
    pub total: Stats,
}

/// Aggregate one- or two-dimensional samples
pub fn aggregate(
    samples: Samples<'_>,
    percentiles: &[u32],
    precision: u32,
) -> Result<Aggregate, StatsError> {
    match samples {
        Samples::Flat(flat) => describe(flat, percentiles, precision).map(Aggregate::Flat),
        Samples::Rounds(rounds) => {
            aggregate_rounds(rounds, percentiles, precision).map(Aggregate::Rounds)
        }
    }
}

/// Aggregate a list of rounds
pub fn aggregate_rounds(
    rounds: &[Vec<f64>],
    percentiles: &[u32],
    precision: u32,
) -> Result<RoundStats, StatsError> {
    if rounds.is_empty() {
        return Err(StatsError::NoDataPoints);
    }

    let per_round = rounds
        .iter()
        .map(|round| describe(round, percentiles, precision))
        .collect::<Result<Vec<_>, _>>()?;

    let means: Vec<f64> = per_round.iter().map(|stats| stats.mean).collect();
    let total = describe(&means, percentiles, precision)?;

    Ok(RoundStats {
        rounds: per_round,
        total,
    })
}

/// Aggregate dynamically shaped input, e.g. samples loaded from a JSON document
///
/// Accepts a list of numbers or a list of lists of numbers. Anything nested
/// deeper, or mixing numbers and lists, is rejected with
/// [`StatsError::WrongDimensionality`].
pub fn aggregate_json(
    data: &Value,
    percentiles: &[u32],
    precision: u32,
) -> Result<Aggregate, StatsError> {
    let items = data
        .as_array()
        .ok_or_else(|| StatsError::WrongDimensionality("expected a list".to_string()))?;
    let first = items.first().ok_or(StatsError::NoDataPoints)?;

    if first.is_array() {
        let rounds = items
            .iter()
            .map(flat_numbers)
            .collect::<Result<Vec<_>, _>>()?;
        aggregate(Samples::Rounds(&rounds), percentiles, precision)
    } else {
        let flat = flat_numbers(data)?;
        aggregate(Samples::Flat(&flat), percentiles, precision)
    }
}

fn flat_numbers(value: &Value) -> Result<Vec<f64>, StatsError> {
    let items = value
        .as_array()
        .ok_or_else(|| StatsError::WrongDimensionality("mixed numbers and lists".to_string()))?;

    items
        .iter()
        .map(|item| match item {
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                StatsError::WrongDimensionality(format!("unrepresentable number {n}"))
            }),
            Value::Array(_) => Err(StatsError::WrongDimensionality(
                "nested deeper than two levels".to_string(),
            )),
            other => Err(StatsError::WrongDimensionality(format!(
                "non-numeric data point {other}"
            ))),
        })
        .collect()
}

impl Serialize for RoundStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.rounds.len() + 1))?;
        for (index, stats) in self.rounds.iter().enumerate() {
            map.serialize_entry(&index.to_string(), stats)?;
        }
        map.serialize_entry("total", &self.total)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for RoundStats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = BTreeMap::<String, Stats>::deserialize(deserializer)?;
        let total = raw
            .remove("total")
            .ok_or_else(|| D::Error::missing_field("total"))?;

        let mut indexed = raw
            .into_iter()
            .map(|(key, stats)| {
                key.parse::<usize>()
                    .map(|index| (index, stats))
                    .map_err(|_| D::Error::custom(format!("unexpected round key `{key}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        indexed.sort_by_key(|(index, _)| *index);

        if indexed.iter().enumerate().any(|(pos, (index, _))| pos != *index) {
            return Err(D::Error::custom("round indices are not contiguous from 0"));
        }

        Ok(RoundStats {
            rounds: indexed.into_iter().map(|(_, stats)| stats).collect(),
            total,
        })
    }
}
