//! Debug and troubleshooting CLI commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, CheckpointSummary, HealthReport};
use crate::output::{color_status, print_info, print_json, print_table, print_warning, OutputFormat};

/// Row for component health table
#[derive(Debug, Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Row for checkpoints table
#[derive(Debug, Tabled)]
pub struct CheckpointRow {
    #[tabled(rename = "Namespace")]
    pub namespace: String,
    #[tabled(rename = "Workload")]
    pub workload: String,
    #[tabled(rename = "Container")]
    pub container: String,
    #[tabled(rename = "Samples")]
    pub samples: String,
    #[tabled(rename = "Last Update")]
    pub last_update: String,
}

/// Show recommender health and liveness
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (status, report): (_, HealthReport) = client.get_report("healthz").await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Recommender Health".bold());
            println!("{}", "=".repeat(60));
            println!("Status:   {}", color_status(&report.status));
            let alive = if report.liveness.alive { "alive" } else { "unhealthy" };
            println!("Liveness: {}", color_status(alive));
            if let Some(last) = &report.liveness.last_run_once {
                println!("Last run: {}", format_timestamp(last));
            }
            if let Some(reason) = &report.liveness.reason {
                println!("Reason:   {}", reason.yellow());
            }
            println!();

            let mut rows: Vec<ComponentRow> = report
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    component: name.clone(),
                    status: color_status(&c.status),
                    last_check: chrono::DateTime::from_timestamp(c.last_check_timestamp, 0)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            rows.sort_by(|a, b| a.component.cmp(&b.component));
            print_table(rows);
        }
    }

    if !status.is_success() {
        anyhow::bail!("recommender reported {}", status);
    }
    Ok(())
}

/// Table rows for checkpoint summaries, ordered by key
pub fn checkpoint_rows(checkpoints: &[CheckpointSummary]) -> Vec<CheckpointRow> {
    let mut rows: Vec<CheckpointRow> = checkpoints
        .iter()
        .map(|c| CheckpointRow {
            namespace: c.namespace.clone(),
            workload: c.workload.clone(),
            container: c.container.clone(),
            samples: match (&c.error, c.total_samples_count) {
                (Some(e), _) => format!("error: {}", e),
                (None, Some(n)) => n.to_string(),
                (None, None) => "-".to_string(),
            },
            last_update: c
                .last_update_time
                .as_deref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.namespace, &a.workload, &a.container).cmp(&(&b.namespace, &b.workload, &b.container))
    });
    rows
}

/// List stored checkpoints
pub async fn show_checkpoints(
    client: &ApiClient,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut checkpoints: Vec<CheckpointSummary> = client.get("api/v1/checkpoints").await?;
    if let Some(ns) = &namespace {
        checkpoints.retain(|c| &c.namespace == ns);
    }

    match format {
        OutputFormat::Json => print_json(&checkpoints)?,
        OutputFormat::Table => {
            if checkpoints.is_empty() {
                print_warning("No checkpoints found");
                return Ok(());
            }
            let broken = checkpoints.iter().filter(|c| c.error.is_some()).count();
            print_table(checkpoint_rows(&checkpoints));
            println!("\nTotal: {} checkpoints", checkpoints.len());
            if broken > 0 {
                print_info(&format!("{} checkpoints could not be read", broken));
            }
        }
    }

    Ok(())
}

/// Format RFC 3339 timestamp for display
fn format_timestamp(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| ts.to_string())
}
