//! Report Data Structures

use chrono::{DateTime, Utc};
use loadbench_stats::{RoundStats, Stats};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Aggregated result of one named run
///
/// Serialized as `{"cpu": {...}, "ram": {...}, "time": {"total": {...}, "raw": [...]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// CPU usage in percent, per round plus `total`
    pub cpu: RoundStats,
    /// Virtual memory in bytes, per round plus `total`
    pub ram: RoundStats,
    /// Round durations in seconds
    pub time: TimeStats,
}

/// Timing part of a [`RunReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    /// Statistics over all rounds
    pub total: Stats,
    /// One duration per round, in round order
    pub raw: Vec<f64>,
}

impl RunReport {
    /// Number of measured rounds
    pub fn rounds(&self) -> usize {
        self.time.raw.len()
    }
}

/// Host description stored next to a benchmark's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// LoadBench version that produced the results
    pub loadbench_version: String,
    /// Target triple family and architecture, e.g. `linux-x86_64`
    pub platform: String,
    /// OS name and version
    pub operating_system: String,
    /// Host name, also used as the results directory name
    pub host_name: String,
    /// CPU brand string
    pub cpu: String,
    /// GPU names, empty when none were found
    pub gpu: String,
    /// Total memory, e.g. `"15.5312 GB"`
    pub ram: String,
    /// When the information was gathered
    pub collected_at: DateTime<Utc>,
}

/// Persisted form of one benchmark
///
/// `run_results` keeps runs in the order they were added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    /// Host the runs executed on
    pub system_information: HostInfo,
    /// Run name to report, in insertion order
    #[serde(
        serialize_with = "serialize_ordered",
        deserialize_with = "deserialize_ordered"
    )]
    pub run_results: Vec<(String, RunReport)>,
}

impl SessionDocument {
    /// Report of a named run
    pub fn run(&self, name: &str) -> Option<&RunReport> {
        self.run_results
            .iter()
            .find(|(run, _)| run == name)
            .map(|(_, report)| report)
    }
}

fn serialize_ordered<S: Serializer>(
    runs: &[(String, RunReport)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(runs.len()))?;
    for (name, report) in runs {
        map.serialize_entry(name, report)?;
    }
    map.end()
}

fn deserialize_ordered<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<(String, RunReport)>, D::Error> {
    struct OrderedRuns;

    impl<'de> Visitor<'de> for OrderedRuns {
        type Value = Vec<(String, RunReport)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of run names to run reports")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut runs = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry::<String, RunReport>()? {
                runs.push(entry);
            }
            Ok(runs)
        }
    }

    deserializer.deserialize_map(OrderedRuns)
}
