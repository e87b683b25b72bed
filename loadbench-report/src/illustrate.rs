//! Result Illustrations
//!
//! An [`Illustrator`] turns one run's report into files under a destination
//! directory. [`CsvIllustrator`] writes the series a plotting tool needs to chart
//! a run: one row per round with the round's statistics next to the overall ones.

use crate::report::RunReport;
use loadbench_stats::{RoundStats, Stats};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

const MIB: f64 = 1024.0 * 1024.0;

/// Renders a run report into files
pub trait Illustrator {
    /// Write illustrations of `report` into `dest`, returning the files written
    fn illustrate(&self, run: &str, report: &RunReport, dest: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Writes `time.csv`, `cpu.csv` and `ram.csv` (memory in mebibytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvIllustrator;

impl Illustrator for CsvIllustrator {
    fn illustrate(&self, _run: &str, report: &RunReport, dest: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dest)?;

        let files = [
            ("time.csv", time_csv(report)),
            ("cpu.csv", rounds_csv(&report.cpu, 1.0)),
            ("ram.csv", rounds_csv(&report.ram, MIB)),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (file_name, content) in files {
            let path = dest.join(file_name);
            std::fs::write(&path, content)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn time_csv(report: &RunReport) -> String {
    let total = &report.time.total;
    let mut csv = String::from("round,seconds,mean,stddev,p25,p75,max\n");
    for (i, seconds) in report.time.raw.iter().enumerate() {
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{},{}",
            i + 1,
            seconds,
            total.mean,
            total.stddev,
            percentile_or_empty(total, 25, 1.0),
            percentile_or_empty(total, 75, 1.0),
            total.max
        );
    }
    csv
}

fn rounds_csv(stats: &RoundStats, factor: f64) -> String {
    let total = &stats.total;
    let mut csv = String::from(
        "round,mean,p25,p75,max,overall_mean,overall_stddev,overall_p25,overall_p75,overall_max\n",
    );
    for (i, round) in stats.rounds.iter().enumerate() {
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{},{},{},{},{}",
            i + 1,
            round.mean / factor,
            percentile_or_empty(round, 25, factor),
            percentile_or_empty(round, 75, factor),
            round.max / factor,
            total.mean / factor,
            total.stddev / factor,
            percentile_or_empty(total, 25, factor),
            percentile_or_empty(total, 75, factor),
            total.max / factor
        );
    }
    csv
}

fn percentile_or_empty(stats: &Stats, p: u32, factor: f64) -> String {
    stats
        .percentile(p)
        .map(|v| (v / factor).to_string())
        .unwrap_or_default()
}
