//! Storage trait for organization, GPU and job records

use async_trait::async_trait;
use gpufleet_core::{FleetResult, Gpu, GpuProvider, GpuStatus, Job, JobStatus, Organization};
use uuid::Uuid;

/// Filter for GPU listings
#[derive(Debug, Clone, Default)]
pub struct GpuFilter {
    pub organization: Option<String>,
    /// Match any of these statuses; empty matches all
    pub statuses: Vec<GpuStatus>,
    pub min_available_memory: Option<u64>,
    pub provider: Option<GpuProvider>,
}

impl GpuFilter {
    pub fn organization(org: impl Into<String>) -> Self {
        Self {
            organization: Some(org.into()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[GpuStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_provider(mut self, provider: GpuProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_min_available_memory(mut self, memory: u64) -> Self {
        self.min_available_memory = Some(memory);
        self
    }

    pub fn matches(&self, gpu: &Gpu) -> bool {
        if let Some(org) = &self.organization {
            if &gpu.organization_id != org {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&gpu.status) {
            return false;
        }
        if let Some(min) = self.min_available_memory {
            if gpu.available_memory < min {
                return false;
            }
        }
        if let Some(provider) = self.provider {
            if gpu.provider != provider {
                return false;
            }
        }
        true
    }
}

/// Ordering of job listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Oldest submission first
    #[default]
    Submitted,
    /// Highest priority first, then oldest submission
    Priority,
}

/// Filter for job listings
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub organization: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub order: JobOrder,
}

impl JobFilter {
    /// Queued jobs of one organization in dispatch order
    pub fn queued(org: impl Into<String>, limit: usize) -> Self {
        Self {
            organization: Some(org.into()),
            status: Some(JobStatus::Queued),
            limit: Some(limit),
            order: JobOrder::Priority,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(org) = &self.organization {
            if &job.organization_id != org {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        true
    }
}

/// Record store with optimistic concurrency.
///
/// Every update names the version the caller read. The store rejects the
/// write with [`gpufleet_core::FleetError::Conflict`] if the record moved on,
/// and otherwise bumps the version by one and returns the stored record.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_organization(&self, org: Organization) -> FleetResult<Organization>;

    async fn get_organization(&self, id: &str) -> FleetResult<Organization>;

    async fn list_organizations(&self) -> FleetResult<Vec<Organization>>;

    async fn create_gpu(&self, gpu: Gpu) -> FleetResult<Gpu>;

    async fn get_gpu(&self, id: Uuid) -> FleetResult<Gpu>;

    async fn list_gpus(&self, filter: &GpuFilter) -> FleetResult<Vec<Gpu>>;

    async fn update_gpu(&self, gpu: Gpu, expected_version: u64) -> FleetResult<Gpu>;

    async fn delete_gpu(&self, id: Uuid) -> FleetResult<()>;

    async fn create_job(&self, job: Job) -> FleetResult<Job>;

    async fn get_job(&self, id: Uuid) -> FleetResult<Job>;

    async fn list_jobs(&self, filter: &JobFilter) -> FleetResult<Vec<Job>>;

    async fn update_job(&self, job: Job, expected_version: u64) -> FleetResult<Job>;

    /// Write a GPU and a job in one step; neither is written unless both
    /// versions still match.
    async fn commit_pair(
        &self,
        gpu: Gpu,
        gpu_version: u64,
        job: Job,
        job_version: u64,
    ) -> FleetResult<(Gpu, Job)>;
}
