//! Recommendation-related CLI commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, WorkloadRecommendation};
use crate::output::{color_status, format_resource, print_json, print_table, print_warning, OutputFormat};

/// Row for recommendations table, one per container
#[derive(Debug, Tabled)]
pub struct RecommendationRow {
    #[tabled(rename = "Namespace")]
    pub namespace: String,
    #[tabled(rename = "Workload")]
    pub workload: String,
    #[tabled(rename = "Container")]
    pub container: String,
    #[tabled(rename = "CPU Target")]
    pub cpu_target: String,
    #[tabled(rename = "CPU Range")]
    pub cpu_range: String,
    #[tabled(rename = "Mem Target")]
    pub memory_target: String,
    #[tabled(rename = "Mem Range")]
    pub memory_range: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

fn workload_status(workload: &WorkloadRecommendation) -> &'static str {
    if workload.condition("NoPodsMatched") {
        "No pods"
    } else if workload.recommendation.is_none() {
        "No data"
    } else if workload.condition("LowConfidence") {
        "Low confidence"
    } else {
        "Provided"
    }
}

/// Table rows for `workloads`, keeping only names containing `filter`
pub fn recommendation_rows(
    workloads: &[WorkloadRecommendation],
    filter: Option<&str>,
) -> Vec<RecommendationRow> {
    let mut rows = Vec::new();
    for workload in workloads
        .iter()
        .filter(|w| filter.map_or(true, |f| w.name.contains(f)))
    {
        let status = workload_status(workload);
        let containers = workload
            .recommendation
            .as_ref()
            .map(|r| r.containers.as_slice())
            .unwrap_or_default();

        if containers.is_empty() {
            rows.push(RecommendationRow {
                namespace: workload.namespace.clone(),
                workload: workload.name.clone(),
                container: "-".to_string(),
                cpu_target: "-".to_string(),
                cpu_range: "-".to_string(),
                memory_target: "-".to_string(),
                memory_range: "-".to_string(),
                status: status.to_string(),
            });
            continue;
        }

        for c in containers {
            rows.push(RecommendationRow {
                namespace: workload.namespace.clone(),
                workload: workload.name.clone(),
                container: c.container_name.clone(),
                cpu_target: format_resource(&c.target, "cpu"),
                cpu_range: format!(
                    "{} - {}",
                    format_resource(&c.lower_bound, "cpu"),
                    format_resource(&c.upper_bound, "cpu")
                ),
                memory_target: format_resource(&c.target, "memory"),
                memory_range: format!(
                    "{} - {}",
                    format_resource(&c.lower_bound, "memory"),
                    format_resource(&c.upper_bound, "memory")
                ),
                status: status.to_string(),
            });
        }
    }
    rows
}

/// Get recommendations with optional filters
pub async fn get_recommendations(
    client: &ApiClient,
    namespace: Option<String>,
    workload: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let path = match &namespace {
        Some(ns) => format!("api/v1/recommendations/{}", ns),
        None => "api/v1/recommendations".to_string(),
    };

    let result: Vec<WorkloadRecommendation> = client.get(&path).await?;

    match format {
        OutputFormat::Json => {
            let filtered: Vec<&WorkloadRecommendation> = result
                .iter()
                .filter(|w| workload.as_deref().map_or(true, |f| w.name.contains(f)))
                .collect();
            print_json(&filtered)?;
        }
        OutputFormat::Table => {
            let mut rows = recommendation_rows(&result, workload.as_deref());
            if rows.is_empty() {
                print_warning("No workloads found");
                return Ok(());
            }
            let total = rows.len();
            for row in rows.iter_mut() {
                row.status = color_status(&row.status);
            }
            print_table(rows);
            println!("\nTotal: {} containers", total);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Condition, ContainerRecommendation, Recommendation};

    fn workload(name: &str, recommendation: Option<Recommendation>, conditions: &[&str]) -> WorkloadRecommendation {
        WorkloadRecommendation {
            namespace: "prod".to_string(),
            name: name.to_string(),
            pods: 1,
            recommendation,
            conditions: conditions
                .iter()
                .map(|c| Condition {
                    condition_type: c.to_string(),
                    status: true,
                    message: None,
                    last_transition_time: "2024-03-01T10:00:00Z".to_string(),
                })
                .collect(),
        }
    }

    fn container(name: &str, cpu: i64) -> ContainerRecommendation {
        ContainerRecommendation {
            container_name: name.to_string(),
            target: [("cpu".to_string(), cpu), ("memory".to_string(), 262_144_000)].into(),
            lower_bound: [("cpu".to_string(), cpu / 2)].into(),
            upper_bound: [("cpu".to_string(), cpu * 2)].into(),
            uncapped_target: Default::default(),
        }
    }

    #[test]
    fn test_one_row_per_container() {
        let workloads = vec![workload(
            "api",
            Some(Recommendation {
                containers: vec![container("app", 200), container("sidecar", 30)],
            }),
            &["RecommendationProvided"],
        )];

        let rows = recommendation_rows(&workloads, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cpu_target, "200m");
        assert_eq!(rows[0].cpu_range, "100m - 400m");
        assert_eq!(rows[0].memory_target, "250.00Mi");
        assert_eq!(rows[0].memory_range, "- - -");
        assert_eq!(rows[1].container, "sidecar");
        assert_eq!(rows[1].status, "Provided");
    }

    #[test]
    fn test_workload_without_data_gets_placeholder_row() {
        let workloads = vec![
            workload("idle", None, &["NoPodsMatched"]),
            workload("new", None, &[]),
        ];
        let rows = recommendation_rows(&workloads, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, "No pods");
        assert_eq!(rows[0].container, "-");
        assert_eq!(rows[1].status, "No data");
    }

    #[test]
    fn test_workload_filter() {
        let workloads = vec![
            workload("api", None, &[]),
            workload("worker", None, &[]),
        ];
        let rows = recommendation_rows(&workloads, Some("work"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].workload, "worker");
    }
}
