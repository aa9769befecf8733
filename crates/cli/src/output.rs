//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of rows
pub fn print_table<T: Tabled>(rows: Vec<T>) {
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any response as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format millicores as human-readable string
pub fn format_cpu(millicores: i64) -> String {
    if millicores >= 1000 {
        format!("{:.1}", millicores as f64 / 1000.0)
    } else {
        format!("{}m", millicores)
    }
}

/// Format one entry of a resource map, `-` when absent
pub fn format_resource(resources: &crate::client::Resources, name: &str) -> String {
    match (name, resources.get(name)) {
        ("cpu", Some(amount)) => format_cpu(*amount),
        ("memory", Some(amount)) => format_bytes(*amount),
        (_, Some(amount)) => amount.to_string(),
        (_, None) => "-".to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" | "alive" | "provided" => status.green().to_string(),
        "degraded" | "low confidence" => status.yellow().to_string(),
        "unhealthy" | "error" | "failed" | "no pods" | "no data" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(262_144_000), "250.00Mi");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.00Gi");
    }

    #[test]
    fn test_format_cpu() {
        assert_eq!(format_cpu(25), "25m");
        assert_eq!(format_cpu(1500), "1.5");
    }

    #[test]
    fn test_format_resource() {
        let resources: BTreeMap<String, i64> = [("cpu".to_string(), 120)].into();
        assert_eq!(format_resource(&resources, "cpu"), "120m");
        assert_eq!(format_resource(&resources, "memory"), "-");
    }
}
