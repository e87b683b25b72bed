//! Output Formatting
//!
//! Human-readable result table for one run: one row per resource, one column per
//! statistic of the `total` block.

use crate::report::RunReport;
use loadbench_stats::Stats;

/// Format the result table of one run for terminal display
pub fn format_run_table(name: &str, report: &RunReport) -> String {
    let rows = [
        ("CPU (%)", &report.cpu.total),
        ("RAM (Bytes)", &report.ram.total),
        ("Time (Seconds)", &report.time.total),
    ];

    let mut header = vec![
        "System Component".to_string(),
        "Max.".to_string(),
        "Mean".to_string(),
        "Std. Dev.".to_string(),
    ];
    header.extend(
        report
            .cpu
            .total
            .percentiles
            .iter()
            .map(|(p, _)| format!("{p}th perc.")),
    );

    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|(label, stats)| {
            let mut cells = vec![label.to_string()];
            cells.extend(stat_cells(stats));
            cells
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|col| {
            std::iter::once(&header)
                .chain(body.iter())
                .filter_map(|row| row.get(col))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let rule = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut output = String::new();
    output.push('\n');
    output.push_str(&format!("Run: {}\n", name));
    output.push_str(&rule);
    output.push_str(&format_row(&header, &widths, true));
    output.push_str(&rule);
    for row in &body {
        output.push_str(&format_row(row, &widths, false));
    }
    output.push_str(&rule);
    output
}

fn stat_cells(stats: &Stats) -> Vec<String> {
    stats.values().iter().map(|v| v.to_string()).collect()
}

fn format_row(cells: &[String], widths: &[usize], center: bool) -> String {
    let mut line = String::from("|");
    for (col, width) in widths.iter().enumerate() {
        let cell = cells.get(col).map(String::as_str).unwrap_or("");
        if center {
            line.push_str(&format!(" {:^width$} |", cell, width = width));
        } else if col == 0 {
            line.push_str(&format!(" {:<width$} |", cell, width = width));
        } else {
            line.push_str(&format!(" {:>width$} |", cell, width = width));
        }
    }
    line.push('\n');
    line
}

/// Format every run of a benchmark, in order
pub fn format_human_output(benchmark: &str, runs: &[(String, RunReport)]) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str(&format!("LoadBench Results: {}\n", benchmark));
    output.push_str(&"=".repeat(60));
    output.push('\n');

    if runs.is_empty() {
        output.push_str("  (no runs)\n");
    }
    for (name, report) in runs {
        output.push_str(&format_run_table(name, report));
        output.push_str(&format!("  rounds: {}\n", report.rounds()));
    }

    output
}
