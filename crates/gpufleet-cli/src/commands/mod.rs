//! CLI commands implementation

use anyhow::Result;
use gpufleet_core::{Capabilities, CostReport, Gpu, GpuSpec, Job, JobSpec, Organization};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Status response from API
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub organizations: usize,
    pub gpus: BTreeMap<String, usize>,
    pub jobs: BTreeMap<String, usize>,
    pub spot_enabled: bool,
    pub live_spot_instances: usize,
    pub open_cost_sessions: usize,
    pub executor: String,
}

/// Options for `submit`
#[derive(Debug, Default)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub batch_size: Option<u32>,
    pub prompt: Option<String>,
    pub max_price: Option<f64>,
    pub model_type: Option<String>,
}

/// Parse `key=value` capability flags
pub fn parse_capabilities(pairs: &[String]) -> Result<Capabilities> {
    let mut caps = Capabilities::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("capability '{}' is not key=value", pair);
        };
        if key.trim().is_empty() {
            anyhow::bail!("capability '{}' has an empty name", pair);
        }
        caps = caps.with(key.trim(), value.trim());
    }
    Ok(caps)
}

fn query(params: &[(&str, Option<&str>)]) -> String {
    let parts: Vec<String> = params
        .iter()
        .filter_map(|(k, v)| v.map(|v| format!("{}={}", k, v)))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!("?{}", parts.join("&"))
    }
}

/// Register an organization
pub async fn org(client: &ApiClient, id: String, name: Option<String>) -> Result<()> {
    #[derive(Serialize)]
    struct CreateRequest {
        id: String,
        name: String,
    }

    let response = client
        .client
        .post(client.url("/api/v1/organizations"))
        .json(&CreateRequest {
            id,
            name: name.unwrap_or_default(),
        })
        .send()
        .await?;

    if response.status().is_success() {
        let org: Organization = response.json().await?;
        println!("Organization '{}' registered ({})", org.id, org.name);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to register organization: {}", error);
    }

    Ok(())
}

/// Submit a job
pub async fn submit(
    client: &ApiClient,
    organization: String,
    model: String,
    opts: SubmitOptions,
) -> Result<()> {
    let mut spec = JobSpec::new(organization, model);
    spec.priority = opts.priority;
    spec.batch_size = opts.batch_size;
    spec.prompt = opts.prompt.unwrap_or_default();
    spec.max_price = opts.max_price;
    spec.model_type = opts.model_type;

    let response = client
        .client
        .post(client.url("/api/v1/jobs"))
        .json(&spec)
        .send()
        .await?;

    if response.status().is_success() {
        let job: Job = response.json().await?;
        println!("Job submitted");
        print_job_details(&job);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to submit job: {}", error);
    }

    Ok(())
}

/// List jobs
pub async fn jobs(
    client: &ApiClient,
    organization: Option<String>,
    status: Option<String>,
) -> Result<()> {
    let path = format!(
        "/api/v1/jobs{}",
        query(&[
            ("organization", organization.as_deref()),
            ("status", status.as_deref()),
        ])
    );
    let response = client.client.get(client.url(&path)).send().await?;

    if response.status().is_success() {
        let jobs: Vec<Job> = response.json().await?;

        if jobs.is_empty() {
            println!("No jobs found");
        } else {
            println!(
                "{:<36} {:<12} {:<22} {:<10} {:<8} {:<36}",
                "ID", "ORG", "MODEL", "STATUS", "PRIO", "GPU"
            );
            println!("{}", "-".repeat(128));
            for job in jobs {
                println!(
                    "{:<36} {:<12} {:<22} {:<10} {:<8} {:<36}",
                    job.id,
                    job.organization_id,
                    job.model_name,
                    job.status,
                    job.priority,
                    job.gpu_id.map(|g| g.to_string()).unwrap_or_else(|| "-".into())
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list jobs: {}", error);
    }

    Ok(())
}

/// Show one job
pub async fn job(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/jobs/{}", id)))
        .send()
        .await?;

    if response.status().is_success() {
        let job: Job = response.json().await?;
        print_job_details(&job);
    } else {
        let error = response.text().await?;
        eprintln!("Job not found: {}", error);
    }

    Ok(())
}

/// Cancel a job
pub async fn cancel(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/jobs/{}/cancel", id)))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Job {} cancelled", id);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to cancel job: {}", error);
    }

    Ok(())
}

/// Report the outcome of a running job
pub async fn complete(client: &ApiClient, id: Uuid, error: Option<String>) -> Result<()> {
    let body = match &error {
        Some(message) => serde_json::json!({ "status": "failed", "error": message }),
        None => serde_json::json!({ "status": "completed" }),
    };
    let response = client
        .client
        .post(client.url(&format!("/api/v1/jobs/{}/complete", id)))
        .json(&body)
        .send()
        .await?;

    if response.status().is_success() {
        let job: Job = response.json().await?;
        println!("Job {} {}", job.id, job.status);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to complete job: {}", error);
    }

    Ok(())
}

/// List GPUs
pub async fn gpus(
    client: &ApiClient,
    organization: Option<String>,
    status: Option<String>,
) -> Result<()> {
    let path = format!(
        "/api/v1/gpus{}",
        query(&[
            ("organization", organization.as_deref()),
            ("status", status.as_deref()),
        ])
    );
    let response = client.client.get(client.url(&path)).send().await?;

    if response.status().is_success() {
        let gpus: Vec<Gpu> = response.json().await?;

        if gpus.is_empty() {
            println!("No GPUs registered");
        } else {
            println!(
                "{:<36} {:<12} {:<10} {:<9} {:<13} {:<13} {:<6} {:<8}",
                "ID", "ORG", "NAME", "PROVIDER", "STATUS", "FREE/TOTAL", "JOBS", "$/HOUR"
            );
            println!("{}", "-".repeat(116));
            for gpu in gpus {
                println!(
                    "{:<36} {:<12} {:<10} {:<9} {:<13} {:<13} {:<6} {:<8.2}",
                    gpu.id,
                    gpu.organization_id,
                    gpu.name,
                    gpu.provider,
                    gpu.status,
                    format!("{}/{}", gpu.available_memory, gpu.total_memory),
                    format!("{}/{}", gpu.current_job_count, gpu.max_jobs),
                    gpu.cost_per_hour
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list GPUs: {}", error);
    }

    Ok(())
}

/// Register a dedicated GPU
pub async fn register_gpu(client: &ApiClient, spec: GpuSpec) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/gpus"))
        .json(&spec)
        .send()
        .await?;

    if response.status().is_success() {
        let gpu: Gpu = response.json().await?;
        println!("GPU '{}' registered", gpu.name);
        println!("  ID: {}", gpu.id);
        println!("  Memory: {}/{}", gpu.available_memory, gpu.total_memory);
        println!("  Status: {}", gpu.status);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to register GPU: {}", error);
    }

    Ok(())
}

/// Show an organization's spend
pub async fn cost(client: &ApiClient, organization: String, hours: i64) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!(
            "/api/v1/costs?organization={}&hours={}",
            organization, hours
        )))
        .send()
        .await?;

    if response.status().is_success() {
        let report: CostReport = response.json().await?;

        println!("Cost for '{}' over the last {}h", report.organization_id, hours);
        println!("  Total: ${:.4}", report.total_cost);
        println!("  Jobs: {}", report.total_jobs);
        println!("  Per job: ${:.4}", report.cost_per_job);
        if !report.by_provider.is_empty() {
            println!("\nBy provider:");
            for (provider, cost) in &report.by_provider {
                println!("  {:<20} ${:.4}", provider, cost);
            }
        }
        if !report.by_model.is_empty() {
            println!("\nBy model:");
            for (model, cost) in &report.by_model {
                println!("  {:<20} ${:.4}", model, cost);
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get cost report: {}", error);
    }

    Ok(())
}

/// Show system status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpufleet v{}", status.version);
        println!();
        println!("Organizations: {}", status.organizations);
        println!("GPUs: {}", summarize(&status.gpus));
        println!("Jobs: {}", summarize(&status.jobs));
        println!("Open cost sessions: {}", status.open_cost_sessions);
        println!("Executor: {}", status.executor);
        if status.spot_enabled {
            println!("Spot instances: {}", status.live_spot_instances);
        } else {
            println!("Spot: disabled");
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

fn summarize(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(k, v)| format!("{} {}", v, k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Helper to print job details
fn print_job_details(job: &Job) {
    println!("Job: {}", job.id);
    println!("  Organization: {}", job.organization_id);
    println!("  Model: {} ({})", job.model_name, job.model_type);
    println!("  Status: {}", job.status);
    println!("  Priority: {}", job.priority);
    println!("  Memory: {}", job.memory_required);
    if let Some(gpu) = job.gpu_id {
        println!("  GPU: {}", gpu);
    }
    if let Some(error) = &job.error {
        println!("  Error: {}", error);
    }
    if let Some(result) = &job.result {
        println!("  Result: {}", result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capabilities() {
        let caps = parse_capabilities(&[
            "compute_capability=8.0".to_string(),
            " arch = ampere".to_string(),
        ])
        .unwrap();
        assert_eq!(caps.get("compute_capability"), Some("8.0"));
        assert_eq!(caps.get("arch"), Some("ampere"));

        assert!(parse_capabilities(&["nope".to_string()]).is_err());
        assert!(parse_capabilities(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_query_string() {
        assert_eq!(query(&[("organization", None)]), "");
        assert_eq!(
            query(&[("organization", Some("acme")), ("status", Some("queued"))]),
            "?organization=acme&status=queued"
        );
    }
}
