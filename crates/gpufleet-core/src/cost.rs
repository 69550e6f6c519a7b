//! Billing sessions and cost reports

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identity of a billing session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub organization_id: String,
    pub gpu_id: Uuid,
    pub job_id: Uuid,
}

impl SessionKey {
    pub fn new(organization_id: impl Into<String>, gpu_id: Uuid, job_id: Uuid) -> Self {
        Self {
            organization_id: organization_id.into(),
            gpu_id,
            job_id,
        }
    }
}

/// The billing interval of one job on one GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSession {
    pub key: SessionKey,
    /// "dedicated", "spot", or the marketplace name for spot leases
    pub provider: String,
    pub model_name: String,
    /// GPU name at the time of binding, used for baseline pricing
    pub gpu_name: String,
    pub start_time: DateTime<Utc>,
    pub cost_per_hour: f64,
    pub end_time: Option<DateTime<Utc>>,
    pub total_cost: f64,
}

impl CostSession {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Elapsed hours up to `end` (or the recorded end time)
    pub fn elapsed_hours(&self, end: DateTime<Utc>) -> f64 {
        let end = self.end_time.unwrap_or(end);
        let millis = (end - self.start_time).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }

    /// Close the session at `end` and compute its cost
    pub fn close(&mut self, end: DateTime<Utc>) {
        let end = end.max(self.start_time);
        self.end_time = Some(end);
        self.total_cost = self.elapsed_hours(end) * self.cost_per_hour;
    }
}

/// Time range for reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl ReportWindow {
    /// The last `hours` hours up to now
    pub fn last_hours(hours: i64) -> Self {
        let until = Utc::now();
        Self {
            since: until - Duration::hours(hours),
            until,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.since && t <= self.until
    }

    pub fn hours(&self) -> f64 {
        (self.until - self.since).num_milliseconds().max(0) as f64 / 3_600_000.0
    }
}

/// Aggregated spend for an organization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub organization_id: String,
    pub total_cost: f64,
    pub total_jobs: u64,
    pub cost_per_job: f64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
}

/// Advisory efficiency signal for one GPU
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyScore {
    pub gpu_id: Uuid,
    /// Memory utilization (0.0 - 1.0)
    pub utilization: f64,
    /// Baseline list price over actual price, capped at 1.0
    pub cost_ratio: f64,
    /// Completed jobs per hour over the baseline rate, capped at 1.0
    pub throughput: f64,
    pub score: f64,
}
