//! Configuration loading from loadbench.toml
//!
//! LoadBench configuration can be specified in a `loadbench.toml` file in the project root.
//! The configuration is automatically discovered by walking up from the current directory.

use crate::orchestrator::{Clock, OrchestratorSettings, RunOptions};
use crate::worker::{DEFAULT_HANDSHAKE_TIMEOUT, SpawnStrategy};
use loadbench_stats::{DEFAULT_PERCENTILES, RESOURCE_PRECISION, TIME_PRECISION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file
pub const CONFIG_FILE: &str = "loadbench.toml";

/// LoadBench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoadBenchConfig {
    /// Sampler configuration
    #[serde(default)]
    pub sampler: SamplerConfig,
    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
    /// Statistics configuration
    #[serde(default)]
    pub statistics: StatisticsConfig,
}

/// Sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    /// Polling interval (e.g., "50ms")
    #[serde(default = "default_interval")]
    pub interval: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

fn default_interval() -> String {
    "50ms".to_string()
}

/// Runner configuration: defaults for every run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Measured rounds per run
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    /// Untimed warmup rounds per run
    #[serde(default)]
    pub warmup_rounds: u32,
    /// Worker creation: "clean-image" or "copy-on-write"
    #[serde(default)]
    pub isolation: SpawnStrategy,
    /// Clock used for round times: "process" or "wall"
    #[serde(default)]
    pub clock: Clock,
    /// Keep automatic memory reclamation enabled during timed calls
    #[serde(default = "default_true")]
    pub reclamation_active: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            warmup_rounds: 0,
            isolation: SpawnStrategy::default(),
            clock: Clock::default(),
            reclamation_active: true,
        }
    }
}

fn default_rounds() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Default output format: "human" or "json"
    #[serde(default = "default_format")]
    pub format: String,
    /// Results directory (default: `./loadbench_results/<benchmark>`)
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Save results after the suite finishes
    #[serde(default = "default_true")]
    pub save: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            directory: None,
            save: true,
        }
    }
}

fn default_format() -> String {
    "human".to_string()
}

/// Statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsConfig {
    /// Percentiles reported in every statistics block
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<u32>,
    /// Decimal places for cpu and ram
    #[serde(default = "default_resource_precision")]
    pub resource_precision: u32,
    /// Decimal places for time
    #[serde(default = "default_time_precision")]
    pub time_precision: u32,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            percentiles: default_percentiles(),
            resource_precision: RESOURCE_PRECISION,
            time_precision: TIME_PRECISION,
        }
    }
}

fn default_percentiles() -> Vec<u32> {
    DEFAULT_PERCENTILES.to_vec()
}
fn default_resource_precision() -> u32 {
    RESOURCE_PRECISION
}
fn default_time_precision() -> u32 {
    TIME_PRECISION
}

impl LoadBenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        Self::discover_from(std::env::current_dir().ok()?)
    }

    /// Walk up from `dir` looking for `loadbench.toml`
    pub fn discover_from(dir: impl Into<PathBuf>) -> Option<Self> {
        let mut dir = dir.into();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!(path = %config_path.display(), error = %e, "ignoring invalid configuration");
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Write the commented default configuration into `dir`
    ///
    /// Refuses to replace an existing file.
    pub fn write_default(dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        std::fs::write(&path, Self::default_toml())?;
        Ok(path)
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# LoadBench Configuration

[sampler]
# Polling interval of the resource sampler
interval = "50ms"

[runner]
# Measured rounds per run
rounds = 1
# Untimed warmup rounds per run
warmup_rounds = 0
# Worker creation: "clean-image" or "copy-on-write"
isolation = "clean-image"
# Clock for round times: "process" or "wall"
clock = "process"
# Keep automatic memory reclamation enabled during timed calls
reclamation_active = true

[output]
# Default output format: "human" or "json"
format = "human"
# Results directory (default: ./loadbench_results/<benchmark>)
# directory = "loadbench_results"
# Save results after the suite finishes
save = true

[statistics]
percentiles = [25, 50, 75, 90, 95, 99]
resource_precision = 2
time_precision = 4
"#
        .to_string()
    }

    /// Parse a duration string like "50ms", "1.5s" or "2m" into nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration number: {}", num_part));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }

    /// Sampler interval as a `Duration`
    pub fn sampler_interval(&self) -> anyhow::Result<Duration> {
        let nanos = Self::parse_duration(&self.sampler.interval)?;
        if nanos == 0 {
            return Err(anyhow::anyhow!("Sampler interval must be positive"));
        }
        Ok(Duration::from_nanos(nanos))
    }

    /// Orchestrator settings described by this configuration
    pub fn orchestrator_settings(&self) -> anyhow::Result<OrchestratorSettings> {
        Ok(OrchestratorSettings {
            interval: self.sampler_interval()?,
            percentiles: self.statistics.percentiles.clone(),
            resource_precision: self.statistics.resource_precision,
            time_precision: self.statistics.time_precision,
            progress: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Default run options described by this configuration
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            rounds: self.runner.rounds,
            warmup_rounds: self.runner.warmup_rounds,
            reclamation_active: self.runner.reclamation_active,
            spawn: self.runner.isolation,
            clock: self.runner.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoadBenchConfig::default();
        assert_eq!(config.sampler.interval, "50ms");
        assert_eq!(config.runner.rounds, 1);
        assert!(config.runner.reclamation_active);
        assert_eq!(config.runner.isolation, SpawnStrategy::CleanImage);
        assert_eq!(config.statistics.percentiles, DEFAULT_PERCENTILES);
        assert!(config.output.save);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(LoadBenchConfig::parse_duration("3s").unwrap(), 3_000_000_000);
        assert_eq!(LoadBenchConfig::parse_duration("50ms").unwrap(), 50_000_000);
        assert_eq!(LoadBenchConfig::parse_duration("100us").unwrap(), 100_000);
        assert_eq!(LoadBenchConfig::parse_duration("1000ns").unwrap(), 1000);
        assert_eq!(LoadBenchConfig::parse_duration("2m").unwrap(), 120_000_000_000);
        assert_eq!(LoadBenchConfig::parse_duration("1.5s").unwrap(), 1_500_000_000);
        assert!(LoadBenchConfig::parse_duration("").is_err());
        assert!(LoadBenchConfig::parse_duration("5 fortnights").is_err());
        assert!(LoadBenchConfig::parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [sampler]
            interval = "10ms"

            [runner]
            rounds = 7
            isolation = "copy-on-write"
            clock = "wall"
        "#;

        let config: LoadBenchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sampler_interval().unwrap(), Duration::from_millis(10));
        let options = config.run_options();
        assert_eq!(options.rounds, 7);
        assert_eq!(options.spawn, SpawnStrategy::CopyOnWrite);
        assert_eq!(options.clock, Clock::Wall);
        // Defaults should still apply
        assert!(options.reclamation_active);
        assert_eq!(config.output.format, "human");
        assert_eq!(config.statistics.time_precision, 4);
    }

    #[test]
    fn test_default_toml_parses() {
        let config: LoadBenchConfig = toml::from_str(&LoadBenchConfig::default_toml()).unwrap();
        assert_eq!(config, LoadBenchConfig::default());
    }

    #[test]
    fn test_write_default_round_trips_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = LoadBenchConfig::write_default(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILE));
        assert_eq!(LoadBenchConfig::load(&path).unwrap(), LoadBenchConfig::default());

        std::fs::write(&path, "[runner]\nrounds = 9\n").unwrap();
        assert!(LoadBenchConfig::write_default(dir.path()).is_err());
        assert_eq!(LoadBenchConfig::load(&path).unwrap().runner.rounds, 9);
    }

    #[test]
    fn test_discover_walks_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "[runner]\nwarmup_rounds = 3\n",
        )
        .unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = LoadBenchConfig::discover_from(&nested).unwrap();
        assert_eq!(config.runner.warmup_rounds, 3);
    }
}
