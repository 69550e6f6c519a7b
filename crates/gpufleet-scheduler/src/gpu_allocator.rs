//! GPU allocator for binding jobs to GPUs
//!
//! Each bind or release re-reads the GPU and the job under that GPU's lock,
//! mutates both, opens or closes the cost session, and commits the GPU and
//! job together. If the commit fails the cost session change is undone, so
//! the (GPU, job, session) triple never ends up half-applied.

use chrono::Utc;
use gpufleet_core::{
    Capabilities, FleetError, FleetResult, Gpu, GpuStatus, Job, JobOutcome, JobStatus,
    ModelRegistry, SessionKey,
};
use gpufleet_spot::SpotProvisioner;
use gpufleet_store::{GpuFilter, GpuLocks, Store};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cost::CostMeter;
use crate::placement::{is_eligible, BestFitStrategy, PlacementStrategy};

/// Binds queued jobs to GPUs and releases them again
pub struct GpuAllocator {
    store: Arc<dyn Store>,
    locks: Arc<GpuLocks>,
    cost: Arc<CostMeter>,
    registry: Arc<ModelRegistry>,
    strategy: Arc<dyn PlacementStrategy>,
    spot: Option<Arc<SpotProvisioner>>,
}

impl GpuAllocator {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<GpuLocks>,
        cost: Arc<CostMeter>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            store,
            locks,
            cost,
            registry,
            strategy: Arc::new(BestFitStrategy),
            spot: None,
        }
    }

    /// Terminate idle expired spot GPUs on release
    pub fn with_spot(mut self, spot: Arc<SpotProvisioner>) -> Self {
        self.spot = Some(spot);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Place a queued job on the best-fitting GPU of its organization.
    ///
    /// Returns the committed GPU and job. `FleetError::Allocation` means no
    /// GPU fits right now and the job stays queued.
    pub async fn allocate(&self, job: &Job) -> FleetResult<(Gpu, Job)> {
        let capabilities = self.registry.lookup(&job.model_name).capabilities.clone();
        let filter = GpuFilter::organization(&job.organization_id)
            .with_statuses(&[GpuStatus::Available, GpuStatus::InUse])
            .with_min_available_memory(job.memory_required);
        let gpus = self.store.list_gpus(&filter).await?;
        let ranked = self
            .strategy
            .rank(job.memory_required, &capabilities, &gpus, Utc::now());

        for decision in ranked {
            match self
                .bind(job.id, decision.gpu_id, job.memory_required, &capabilities)
                .await
            {
                Ok(pair) => return Ok(pair),
                // lost the race for this GPU; try the next candidate
                Err(FleetError::Allocation(reason)) | Err(FleetError::Conflict(reason)) => {
                    debug!(job_id = %job.id, gpu_id = %decision.gpu_id, reason = %reason, "Candidate rejected");
                }
                Err(FleetError::GpuNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Err(FleetError::Allocation(format!(
            "no GPU in {} fits job {} ({} memory)",
            job.organization_id, job.id, job.memory_required
        )))
    }

    /// Bind a queued job to a specific GPU, charging `memory` against it
    pub async fn assign(&self, job_id: Uuid, gpu_id: Uuid, memory: u64) -> FleetResult<(Gpu, Job)> {
        let job = self.store.get_job(job_id).await?;
        let capabilities = self.registry.lookup(&job.model_name).capabilities.clone();
        self.bind(job_id, gpu_id, memory, &capabilities).await
    }

    async fn bind(
        &self,
        job_id: Uuid,
        gpu_id: Uuid,
        memory: u64,
        capabilities: &Capabilities,
    ) -> FleetResult<(Gpu, Job)> {
        let _guard = self.locks.lock(gpu_id).await;
        let now = Utc::now();

        let mut gpu = self.store.get_gpu(gpu_id).await?;
        let mut job = self.store.get_job(job_id).await?;
        if job.organization_id != gpu.organization_id {
            return Err(FleetError::Allocation(format!(
                "GPU {} belongs to {}, not {}",
                gpu.id, gpu.organization_id, job.organization_id
            )));
        }
        if !is_eligible(&gpu, memory, capabilities, now) {
            return Err(FleetError::Allocation(format!(
                "GPU {} no longer fits job {}",
                gpu.id, job.id
            )));
        }

        let (gpu_version, job_version) = (gpu.version, job.version);
        job.start_on(gpu.id, now)?;
        gpu.bind(job.id, memory)?;

        let key = self.cost.start_at(&gpu, &job, now).await?;
        match self
            .store
            .commit_pair(gpu, gpu_version, job, job_version)
            .await
        {
            Ok((gpu, job)) => {
                info!(
                    job_id = %job.id,
                    gpu_id = %gpu.id,
                    organization = %job.organization_id,
                    memory,
                    available = gpu.available_memory,
                    "Job bound to GPU"
                );
                Ok((gpu, job))
            }
            Err(e) => {
                self.cost.discard(&key).await;
                Err(e)
            }
        }
    }

    /// Unbind `job_id` from `gpu_id` and move the job to its terminal state.
    ///
    /// A pair that is not actually bound is a `FleetError::Consistency` and
    /// neither record is touched.
    pub async fn release(
        &self,
        gpu_id: Uuid,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> FleetResult<(Gpu, Job)> {
        let guard = self.locks.lock(gpu_id).await;
        let now = Utc::now();

        let mut gpu = self.store.get_gpu(gpu_id).await?;
        let mut job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(FleetError::InvalidTransition {
                job_id,
                from: job.status,
                to: outcome.status(),
            });
        }
        if job.gpu_id != Some(gpu.id) || !gpu.has_job(job.id) {
            error!(
                job_id = %job.id,
                gpu_id = %gpu.id,
                bound_to = ?job.gpu_id,
                "Release of a job that is not bound to this GPU"
            );
            return Err(FleetError::Consistency(format!(
                "job {} is not bound to GPU {}",
                job.id, gpu.id
            )));
        }

        let (gpu_version, job_version) = (gpu.version, job.version);
        gpu.unbind(job.id)?;
        outcome.apply(&mut job, now)?;

        let key = SessionKey::new(&job.organization_id, gpu.id, job.id);
        let session = match self.cost.stop_at(&key, now).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(job_id = %job.id, gpu_id = %gpu.id, error = %e, "Releasing without a cost session");
                None
            }
        };

        let (gpu, job) = match self
            .store
            .commit_pair(gpu, gpu_version, job, job_version)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                if let Some(session) = session {
                    self.cost.reopen(session).await;
                }
                return Err(e);
            }
        };
        drop(guard);

        info!(
            job_id = %job.id,
            gpu_id = %gpu.id,
            status = %job.status,
            available = gpu.available_memory,
            "Job released from GPU"
        );

        if let Some(spot) = &self.spot {
            let retire = gpu.status == GpuStatus::Terminating || gpu.is_expired(Utc::now());
            if gpu.is_spot() && gpu.current_job_count == 0 && retire {
                if let Err(e) = spot.terminate(gpu.id).await {
                    warn!(gpu_id = %gpu.id, error = %e, "Spot termination after release failed");
                }
            }
        }

        Ok((gpu, job))
    }

    /// Release whatever GPU `job` is bound to
    pub async fn release_job(&self, job: &Job, outcome: JobOutcome) -> FleetResult<(Gpu, Job)> {
        match (job.status, job.gpu_id) {
            (JobStatus::Running, Some(gpu_id)) => self.release(gpu_id, job.id, outcome).await,
            _ => Err(FleetError::Consistency(format!(
                "job {} is {} with no bound GPU",
                job.id, job.status
            ))),
        }
    }
}
