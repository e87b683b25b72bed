#![warn(missing_docs)]
//! LoadBench Report - Reporting and Persistence
//!
//! Generates various output formats:
//! - JSON (machine-readable, also the on-disk format)
//! - Human-readable result tables
//! - CSV illustrations, one directory per run

mod illustrate;
mod json;
mod report;
mod table;

pub use illustrate::{CsvIllustrator, Illustrator};
pub use json::{generate_json_report, load_json_report};
pub use report::{HostInfo, RunReport, SessionDocument, TimeStats};
pub use table::{format_human_output, format_run_table};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable terminal output
    #[default]
    Human,
    /// JSON document
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Ok(OutputFormat::Human),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loadbench_stats::{DEFAULT_PERCENTILES, aggregate_rounds, describe};

    pub(crate) fn sample_report() -> RunReport {
        let cpu = vec![vec![10.0, 20.0], vec![30.0]];
        let ram = vec![vec![1_048_576.0, 2_097_152.0], vec![3_145_728.0]];
        let raw = vec![0.5, 1.5];
        RunReport {
            cpu: aggregate_rounds(&cpu, &DEFAULT_PERCENTILES, 2).unwrap(),
            ram: aggregate_rounds(&ram, &DEFAULT_PERCENTILES, 2).unwrap(),
            time: TimeStats {
                total: describe(&raw, &DEFAULT_PERCENTILES, 4).unwrap(),
                raw,
            },
        }
    }

    fn sample_host() -> HostInfo {
        HostInfo {
            loadbench_version: "0.1.0".to_string(),
            platform: "linux-x86_64".to_string(),
            operating_system: "Linux 6.1".to_string(),
            host_name: "bench-host".to_string(),
            cpu: "Test CPU".to_string(),
            gpu: String::new(),
            ram: "15.5312 GB".to_string(),
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Human));
        assert!("html".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_report_json_shape() {
        let value = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(value["cpu"]["total"]["mean"], 22.5);
        assert_eq!(value["cpu"]["0"]["mean"], 15.0);
        assert_eq!(value["time"]["raw"], serde_json::json!([0.5, 1.5]));
        assert_eq!(value["time"]["total"]["max"], 1.5);
    }

    #[test]
    fn test_document_keeps_run_order() {
        let document = SessionDocument {
            system_information: sample_host(),
            run_results: vec![
                ("zeta".to_string(), sample_report()),
                ("alpha".to_string(), sample_report()),
            ],
        };

        let json = generate_json_report(&document).unwrap();
        assert!(json.find("\"zeta\"").unwrap() < json.find("\"alpha\"").unwrap());
        assert!(json.contains("\"system_information\""));

        let back = load_json_report(&json).unwrap();
        assert_eq!(back, document);
        assert!(back.run("alpha").is_some());
        assert!(back.run("missing").is_none());
    }

    #[test]
    fn test_table_lists_every_resource() {
        let table = format_run_table("demo", &sample_report());
        assert!(table.contains("Run: demo"));
        for label in ["CPU (%)", "RAM (Bytes)", "Time (Seconds)", "Std. Dev.", "99th perc."] {
            assert!(table.contains(label), "missing {label} in\n{table}");
        }
        let widths: Vec<usize> = table
            .lines()
            .filter(|l| l.starts_with('|') || l.starts_with('+'))
            .map(|l| l.chars().count())
            .collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_csv_illustrator_writes_one_row_per_round() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("graphs").join("demo");
        let files = CsvIllustrator
            .illustrate("demo", &sample_report(), &dest)
            .unwrap();
        assert_eq!(files.len(), 3);

        let time = std::fs::read_to_string(dest.join("time.csv")).unwrap();
        assert_eq!(time.lines().count(), 3);
        assert!(time.lines().nth(1).unwrap().starts_with("1,0.5,"));

        let ram = std::fs::read_to_string(dest.join("ram.csv")).unwrap();
        // Round 0 mean is 1.5 MiB
        assert!(ram.lines().nth(1).unwrap().starts_with("1,1.5,"));
    }
}
