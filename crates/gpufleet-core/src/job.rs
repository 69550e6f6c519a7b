//! Job records and the job state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FleetError, FleetResult};

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a GPU
    Queued,
    /// Bound to a GPU and executing
    Running,
    /// Finished successfully
    Completed,
    /// Execution raised
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed edges: Queued -> Running -> {Completed, Failed},
    /// {Queued, Running} -> Cancelled.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(FleetError::Validation(format!("unknown job status: {}", other))),
        }
    }
}

/// Job submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub organization_id: String,
    /// Registry key, e.g. "phi-2"
    pub model_name: String,
    /// Free-form family, e.g. "llm"; defaults from the registry
    #[serde(default)]
    pub model_type: Option<String>,
    /// Higher is more urgent
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Input prompt; its length drives batch footprint estimates
    #[serde(default)]
    pub prompt: String,
    /// Ceiling on the hourly spot price this job may trigger
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(organization_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            model_name: model_name.into(),
            model_type: None,
            priority: None,
            batch_size: None,
            prompt: String::new(),
            max_price: None,
            max_retries: None,
        }
    }
}

/// A compute job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub organization_id: String,
    pub model_name: String,
    pub model_type: String,
    pub priority: i32,
    pub batch_size: u32,
    pub prompt: String,
    /// Derived from the registry at submission time
    pub memory_required: u64,
    pub max_price: Option<f64>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only while running
    pub gpu_id: Option<Uuid>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Bumped by the store on every committed update
    pub version: u64,
}

impl Job {
    /// Create a queued job from a validated spec
    pub fn queued(
        spec: JobSpec,
        model_type: String,
        priority: i32,
        memory_required: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: spec.organization_id,
            model_name: spec.model_name,
            model_type,
            priority,
            batch_size: spec.batch_size.unwrap_or(1),
            prompt: spec.prompt,
            memory_required,
            max_price: spec.max_price,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            gpu_id: None,
            error: None,
            result: None,
            retry_count: 0,
            max_retries,
            version: 0,
        }
    }

    /// Hours since submission
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.submitted_at).num_milliseconds().max(0) as f64 / 1000.0;
        secs / 3600.0
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    ///
    /// On error the job is left untouched.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> FleetResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Bind to a GPU and start running
    pub fn start_on(&mut self, gpu_id: Uuid, now: DateTime<Utc>) -> FleetResult<()> {
        self.transition(JobStatus::Running, now)?;
        self.gpu_id = Some(gpu_id);
        Ok(())
    }
}

/// How a job left the running (or queued) state
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Option<serde_json::Value>),
    Failed(String),
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }

    /// Apply the terminal transition and clear the GPU binding
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) -> FleetResult<()> {
        job.transition(self.status(), now)?;
        job.gpu_id = None;
        match self {
            JobOutcome::Completed(result) => job.result = result.clone(),
            JobOutcome::Failed(error) => job.error = Some(error.clone()),
            JobOutcome::Cancelled => {}
        }
        Ok(())
    }
}
