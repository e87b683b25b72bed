//! Host Metadata Collection
//!
//! Collects the host description stored next to a benchmark's results.
//!
//! ## Collected Data
//!
//! - **Platform**: OS family and architecture
//! - **OS**: name and version
//! - **CPU**: brand string of the first core
//! - **GPU**: names listed by `nvidia-smi -L`, empty when unavailable
//! - **Memory**: total system RAM in GB
//! - **Timestamp**: UTC time of collection
//!
//! Missing data degrades to "Unknown" or empty values.

use chrono::Utc;
use loadbench_report::HostInfo;
use loadbench_stats::round_to;
use sysinfo::System;

/// Gather host information once
pub fn gather_host_info() -> HostInfo {
    let system = System::new_all();

    let operating_system = match (System::name(), System::os_version()) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => std::env::consts::OS.to_string(),
    };

    let cpu = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    HostInfo {
        loadbench_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        operating_system,
        host_name: System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
        cpu,
        gpu: gpu_names(),
        ram: format_gigabytes(system.total_memory()),
        collected_at: Utc::now(),
    }
}

/// GPU names from `nvidia-smi -L`, comma separated
fn gpu_names() -> String {
    std::process::Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

fn format_gigabytes(bytes: u64) -> String {
    let gb = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    format!("{:.4} GB", round_to(gb, 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gigabytes() {
        assert_eq!(format_gigabytes(16 * 1024 * 1024 * 1024), "16.0000 GB");
        assert_eq!(format_gigabytes(1024 * 1024 * 1024 / 2), "0.5000 GB");
    }

    #[test]
    fn test_host_info_is_populated() {
        let info = gather_host_info();
        assert!(!info.host_name.is_empty());
        assert!(info.platform.contains(std::env::consts::ARCH));
        assert!(info.ram.ends_with(" GB"));
    }
}
