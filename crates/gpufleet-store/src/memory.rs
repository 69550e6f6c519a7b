//! In-memory record store

use async_trait::async_trait;
use chrono::Utc;
use gpufleet_core::{FleetError, FleetResult, Gpu, Job, Organization};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::store::{GpuFilter, JobFilter, JobOrder, Store};

#[derive(Default)]
struct Tables {
    organizations: HashMap<String, Organization>,
    gpus: HashMap<Uuid, Gpu>,
    jobs: HashMap<Uuid, Job>,
}

/// Store backed by process memory.
///
/// All three tables sit behind one lock so paired commits are atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_version(kind: &str, id: Uuid, stored: u64, expected: u64) -> FleetResult<()> {
    if stored != expected {
        return Err(FleetError::Conflict(format!(
            "{} {} is at version {}, expected {}",
            kind, id, stored, expected
        )));
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_organization(&self, org: Organization) -> FleetResult<Organization> {
        let mut tables = self.tables.write().await;
        if tables.organizations.contains_key(&org.id) {
            return Err(FleetError::Conflict(format!(
                "organization {} already exists",
                org.id
            )));
        }
        tables.organizations.insert(org.id.clone(), org.clone());
        Ok(org)
    }

    async fn get_organization(&self, id: &str) -> FleetResult<Organization> {
        let tables = self.tables.read().await;
        tables
            .organizations
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::OrganizationNotFound(id.to_string()))
    }

    async fn list_organizations(&self) -> FleetResult<Vec<Organization>> {
        let tables = self.tables.read().await;
        let mut orgs: Vec<_> = tables.organizations.values().cloned().collect();
        orgs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orgs)
    }

    async fn create_gpu(&self, gpu: Gpu) -> FleetResult<Gpu> {
        let mut tables = self.tables.write().await;
        if tables.gpus.contains_key(&gpu.id) {
            return Err(FleetError::Conflict(format!("GPU {} already exists", gpu.id)));
        }
        tables.gpus.insert(gpu.id, gpu.clone());
        debug!(gpu = %gpu.id, org = %gpu.organization_id, "Stored GPU");
        Ok(gpu)
    }

    async fn get_gpu(&self, id: Uuid) -> FleetResult<Gpu> {
        let tables = self.tables.read().await;
        tables
            .gpus
            .get(&id)
            .cloned()
            .ok_or(FleetError::GpuNotFound(id))
    }

    async fn list_gpus(&self, filter: &GpuFilter) -> FleetResult<Vec<Gpu>> {
        let tables = self.tables.read().await;
        let mut gpus: Vec<_> = tables
            .gpus
            .values()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        gpus.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(gpus)
    }

    async fn update_gpu(&self, mut gpu: Gpu, expected_version: u64) -> FleetResult<Gpu> {
        let mut tables = self.tables.write().await;
        let stored = tables.gpus.get(&gpu.id).ok_or(FleetError::GpuNotFound(gpu.id))?;
        check_version("GPU", gpu.id, stored.version, expected_version)?;
        gpu.version = expected_version + 1;
        gpu.updated_at = Utc::now();
        tables.gpus.insert(gpu.id, gpu.clone());
        Ok(gpu)
    }

    async fn delete_gpu(&self, id: Uuid) -> FleetResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .gpus
            .remove(&id)
            .map(|_| ())
            .ok_or(FleetError::GpuNotFound(id))
    }

    async fn create_job(&self, job: Job) -> FleetResult<Job> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) {
            return Err(FleetError::Conflict(format!("job {} already exists", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> FleetResult<Job> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(FleetError::JobNotFound(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> FleetResult<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        match filter.order {
            JobOrder::Submitted => {
                jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)))
            }
            JobOrder::Priority => jobs.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then(a.id.cmp(&b.id))
            }),
        }
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn update_job(&self, mut job: Job, expected_version: u64) -> FleetResult<Job> {
        let mut tables = self.tables.write().await;
        let stored = tables.jobs.get(&job.id).ok_or(FleetError::JobNotFound(job.id))?;
        check_version("job", job.id, stored.version, expected_version)?;
        job.version = expected_version + 1;
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn commit_pair(
        &self,
        mut gpu: Gpu,
        gpu_version: u64,
        mut job: Job,
        job_version: u64,
    ) -> FleetResult<(Gpu, Job)> {
        let mut tables = self.tables.write().await;
        let stored_gpu = tables.gpus.get(&gpu.id).ok_or(FleetError::GpuNotFound(gpu.id))?;
        check_version("GPU", gpu.id, stored_gpu.version, gpu_version)?;
        let stored_job = tables.jobs.get(&job.id).ok_or(FleetError::JobNotFound(job.id))?;
        check_version("job", job.id, stored_job.version, job_version)?;

        gpu.version = gpu_version + 1;
        gpu.updated_at = Utc::now();
        job.version = job_version + 1;
        tables.gpus.insert(gpu.id, gpu.clone());
        tables.jobs.insert(job.id, job.clone());
        Ok((gpu, job))
    }
}
