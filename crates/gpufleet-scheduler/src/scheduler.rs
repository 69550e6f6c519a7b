//! Main scheduler logic
//!
//! Owns the job lifecycle. Submissions, completions, cancellations and GPU
//! registrations each trigger a sweep of the affected organization; a
//! background loop sweeps every organization on a fixed interval and runs
//! the rebalancing pass.
//!
//! Sweeps never wait on a marketplace. Spot capacity for jobs that missed is
//! rented by a background task, which sweeps the organization again once the
//! new GPU is ready.

use chrono::Utc;
use futures::future::join_all;
use gpufleet_core::{
    CostReport, DaemonConfig, EfficiencyScore, FleetError, FleetResult, Gpu, GpuSpec, GpuStatus,
    Job, JobOutcome, JobSpec, JobStatus, ModelRegistry, Organization, ReportWindow,
    SchedulerConfig,
};
use gpufleet_spot::{SpotProvisioner, SpotRequest};
use gpufleet_store::{GpuFilter, GpuLocks, JobFilter, Store};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::BatchOptimizer;
use crate::cost::CostMeter;
use crate::executor::{Completion, Executor};
use crate::gpu_allocator::GpuAllocator;
use crate::queue::{ProvisionSlots, SweepGuard, SweepReport};

/// Cluster-wide counts for status output
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetStatus {
    pub organizations: usize,
    pub gpus: BTreeMap<String, usize>,
    pub jobs: BTreeMap<String, usize>,
    pub spot_enabled: bool,
    pub live_spot_instances: usize,
    pub open_cost_sessions: usize,
    pub executor: String,
}

enum Placement {
    Placed,
    Missed,
    /// The job left the queue while the sweep was running
    Gone,
}

/// Scheduler manages the job queue and drives allocation
pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<ModelRegistry>,
    allocator: GpuAllocator,
    cost: Arc<CostMeter>,
    batch: BatchOptimizer,
    spot: Option<Arc<SpotProvisioner>>,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    sweeps: SweepGuard,
    provisions: ProvisionSlots,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<GpuLocks>,
        executor: Arc<dyn Executor>,
        config: &DaemonConfig,
    ) -> Self {
        let registry = Arc::new(config.registry());
        let cost = Arc::new(CostMeter::new(config.cost.clone()));
        let allocator = GpuAllocator::new(store.clone(), locks, cost.clone(), registry.clone());

        info!(
            models = registry.models().count(),
            executor = executor.name(),
            sweep_interval_secs = config.scheduler.sweep_interval_secs,
            "Scheduler initialized"
        );

        Self {
            store,
            registry,
            allocator,
            cost,
            batch: BatchOptimizer::new(config.batch.clone()),
            spot: None,
            executor,
            config: config.scheduler.clone(),
            sweeps: SweepGuard::new(),
            provisions: ProvisionSlots::new(),
        }
    }

    /// Fall back to spot capacity when the owned pool misses
    pub fn with_spot(mut self, spot: Arc<SpotProvisioner>) -> Self {
        self.allocator = self.allocator.with_spot(spot.clone());
        self.spot = Some(spot);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cost_meter(&self) -> &CostMeter {
        &self.cost
    }

    pub fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// True while a spot provision for `organization` is running
    pub fn spot_in_flight(&self, organization: &str) -> bool {
        self.provisions.is_claimed(organization)
    }

    async fn require_organization(&self, id: &str) -> FleetResult<Organization> {
        self.store.get_organization(id).await.map_err(|e| match e {
            FleetError::OrganizationNotFound(id) => {
                FleetError::Validation(format!("unknown organization: {}", id))
            }
            other => other,
        })
    }

    pub async fn register_organization(&self, id: &str, name: &str) -> FleetResult<Organization> {
        if id.trim().is_empty() {
            return Err(FleetError::Validation(
                "organization id must not be empty".to_string(),
            ));
        }
        let name = if name.trim().is_empty() { id } else { name };
        let org = self
            .store
            .create_organization(Organization::new(id, name))
            .await?;
        info!(organization = %org.id, "Organization registered");
        Ok(org)
    }

    pub async fn list_organizations(&self) -> FleetResult<Vec<Organization>> {
        self.store.list_organizations().await
    }

    /// Validate and enqueue a job, then sweep its organization
    pub async fn submit_job(self: &Arc<Self>, spec: JobSpec) -> FleetResult<Job> {
        self.require_organization(&spec.organization_id).await?;
        if spec.model_name.trim().is_empty() {
            return Err(FleetError::Validation(
                "model_name must not be empty".to_string(),
            ));
        }
        let reqs = self.registry.lookup(&spec.model_name);
        let batch_size = spec.batch_size.unwrap_or(1);
        if batch_size == 0 || batch_size > reqs.max_batch_size.max(1) {
            return Err(FleetError::Validation(format!(
                "batch_size {} outside 1..={} for {}",
                batch_size,
                reqs.max_batch_size.max(1),
                spec.model_name
            )));
        }
        if let Some(price) = spec.max_price {
            if !(price > 0.0) {
                return Err(FleetError::Validation(
                    "max_price must be positive".to_string(),
                ));
            }
        }
        if !self.registry.is_known(&spec.model_name) {
            warn!(model = %spec.model_name, "Unknown model, using default requirements");
        }

        let memory_required =
            self.registry
                .memory_required(&spec.model_name, batch_size, self.config.memory_overhead);
        let model_type = spec
            .model_type
            .clone()
            .unwrap_or_else(|| reqs.model_type.clone());
        let priority = spec.priority.unwrap_or(self.config.default_priority);
        let max_retries = spec.max_retries.unwrap_or(self.config.default_max_retries);

        let job = Job::queued(spec, model_type, priority, memory_required, max_retries);
        let job = self.store.create_job(job).await?;
        info!(
            job_id = %job.id,
            organization = %job.organization_id,
            model = %job.model_name,
            priority = job.priority,
            memory = job.memory_required,
            "Job submitted"
        );

        self.trigger_sweep(&job.organization_id).await;
        self.store.get_job(job.id).await
    }

    pub async fn get_job(&self, id: Uuid) -> FleetResult<Job> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(
        &self,
        organization: Option<&str>,
        status: Option<JobStatus>,
    ) -> FleetResult<Vec<Job>> {
        let filter = JobFilter {
            organization: organization.map(str::to_string),
            status,
            ..Default::default()
        };
        self.store.list_jobs(&filter).await
    }

    /// Cancel a queued or running job; running jobs release their GPU first
    pub async fn cancel_job(self: &Arc<Self>, id: Uuid) -> FleetResult<Job> {
        let job = loop {
            let mut job = self.store.get_job(id).await?;
            match job.status {
                JobStatus::Queued => {
                    let version = job.version;
                    job.transition(JobStatus::Cancelled, Utc::now())?;
                    match self.store.update_job(job, version).await {
                        Ok(job) => break job,
                        // raced with an allocation; look again
                        Err(FleetError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Running => {
                    match self.allocator.release_job(&job, JobOutcome::Cancelled).await {
                        Ok((_, job)) => break job,
                        Err(FleetError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                status => {
                    return Err(FleetError::InvalidTransition {
                        job_id: id,
                        from: status,
                        to: JobStatus::Cancelled,
                    })
                }
            }
        };
        info!(job_id = %job.id, "Job cancelled");

        self.trigger_sweep(&job.organization_id).await;
        Ok(job)
    }

    /// Record the result of a running job, release its GPU and re-sweep
    pub async fn complete_job(
        self: &Arc<Self>,
        id: Uuid,
        outcome: JobOutcome,
    ) -> FleetResult<Job> {
        if matches!(outcome, JobOutcome::Cancelled) {
            return Err(FleetError::Validation(
                "use cancel to cancel a job".to_string(),
            ));
        }
        let job = self.finish_job(id, outcome).await?;
        self.trigger_sweep(&job.organization_id).await;
        Ok(job)
    }

    /// Release without sweeping
    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> FleetResult<Job> {
        loop {
            let job = self.store.get_job(id).await?;
            if job.status != JobStatus::Running {
                return Err(FleetError::InvalidTransition {
                    job_id: id,
                    from: job.status,
                    to: outcome.status(),
                });
            }
            match self.allocator.release_job(&job, outcome.clone()).await {
                Ok((_, job)) => {
                    match &job.error {
                        Some(err) => warn!(job_id = %job.id, error = %err, "Job failed"),
                        None => info!(job_id = %job.id, status = %job.status, "Job finished"),
                    }
                    return Ok(job);
                }
                Err(FleetError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Register a dedicated GPU and sweep its organization
    pub async fn register_gpu(self: &Arc<Self>, spec: GpuSpec) -> FleetResult<Gpu> {
        self.require_organization(&spec.organization_id).await?;
        if spec.total_memory == 0 {
            return Err(FleetError::Validation(
                "total_memory must be positive".to_string(),
            ));
        }
        if spec.cost_per_hour < 0.0 || spec.cost_per_hour.is_nan() {
            return Err(FleetError::Validation(
                "cost_per_hour must not be negative".to_string(),
            ));
        }
        if spec.max_jobs == Some(0) {
            return Err(FleetError::Validation(
                "max_jobs must be at least 1".to_string(),
            ));
        }

        let gpu = Gpu::dedicated(spec, self.config.default_max_jobs);
        let gpu = self.store.create_gpu(gpu).await?;
        info!(
            gpu_id = %gpu.id,
            organization = %gpu.organization_id,
            name = %gpu.name,
            memory = gpu.total_memory,
            "GPU registered"
        );

        self.trigger_sweep(&gpu.organization_id).await;
        self.store.get_gpu(gpu.id).await
    }

    pub async fn list_gpus(
        &self,
        organization: Option<&str>,
        status: Option<GpuStatus>,
    ) -> FleetResult<Vec<Gpu>> {
        let filter = GpuFilter {
            organization: organization.map(str::to_string),
            statuses: status.into_iter().collect(),
            ..Default::default()
        };
        self.store.list_gpus(&filter).await
    }

    pub async fn cost_report(
        &self,
        organization: &str,
        window: ReportWindow,
    ) -> FleetResult<CostReport> {
        self.require_organization(organization).await?;
        Ok(self.cost.report(organization, window).await)
    }

    pub async fn gpu_efficiency(
        &self,
        gpu_id: Uuid,
        window: ReportWindow,
    ) -> FleetResult<EfficiencyScore> {
        let gpu = self.store.get_gpu(gpu_id).await?;
        Ok(self.cost.efficiency(&gpu, window).await)
    }

    pub async fn status(&self) -> FleetResult<FleetStatus> {
        let mut status = FleetStatus {
            organizations: self.store.list_organizations().await?.len(),
            spot_enabled: self.spot.as_ref().is_some_and(|s| s.is_enabled()),
            open_cost_sessions: self.cost.open_sessions(None).await.len(),
            executor: self.executor.name().to_string(),
            ..Default::default()
        };
        for gpu in self.store.list_gpus(&GpuFilter::default()).await? {
            *status.gpus.entry(gpu.status.to_string()).or_default() += 1;
        }
        for job in self.store.list_jobs(&JobFilter::default()).await? {
            *status.jobs.entry(job.status.to_string()).or_default() += 1;
        }
        if let Some(spot) = &self.spot {
            status.live_spot_instances = spot.live_count().await?;
        }
        Ok(status)
    }

    async fn trigger_sweep(self: &Arc<Self>, organization: &str) {
        if let Err(e) = self.sweep(organization).await {
            warn!(organization = %organization, error = %e, "Sweep failed");
        }
    }

    /// Try to place every queued job of `organization`.
    ///
    /// If a sweep for the organization is already running this returns a
    /// deferred report and the running sweep makes one more pass.
    pub async fn sweep(self: &Arc<Self>, organization: &str) -> FleetResult<SweepReport> {
        let Some(mut ticket) = self.sweeps.try_enter(organization) else {
            debug!(organization = %organization, "Sweep already running, deferring");
            return Ok(SweepReport::deferred(organization));
        };

        let mut report = SweepReport {
            organization: organization.to_string(),
            ..Default::default()
        };
        loop {
            self.sweep_pass(organization, &mut report).await?;
            if !ticket.should_rerun() {
                break;
            }
        }
        if report.allocated > 0 || report.spot_requested {
            info!(
                organization = %organization,
                allocated = report.allocated,
                still_queued = report.still_queued,
                spot_requested = report.spot_requested,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_pass(
        self: &Arc<Self>,
        organization: &str,
        report: &mut SweepReport,
    ) -> FleetResult<()> {
        report.passes += 1;
        let queued = self
            .store
            .list_jobs(&JobFilter::queued(organization, self.config.sweep_limit))
            .await?;
        report.considered += queued.len();

        let mut misses = Vec::new();
        for job in queued {
            match self.place(&job).await? {
                Placement::Placed => report.allocated += 1,
                Placement::Missed => misses.push(job),
                Placement::Gone => {}
            }
        }

        if self.start_spot_fallback(organization, &misses) {
            report.spot_requested = true;
        }
        report.still_queued = misses.len();
        Ok(())
    }

    /// Rent spot capacity for the misses of a sweep without waiting for it.
    ///
    /// Requests are ordered like the queue and tried in turn until one has a
    /// marketplace offer. Returns false when spot is off or a provision for
    /// the organization is already in flight.
    fn start_spot_fallback(self: &Arc<Self>, organization: &str, misses: &[Job]) -> bool {
        let Some(spot) = self.spot.clone() else {
            return false;
        };
        if misses.is_empty() || !spot.is_enabled() {
            return false;
        }
        let Some(slot) = self.provisions.try_claim(organization) else {
            debug!(organization = %organization, "Spot provision already in flight");
            return false;
        };

        let mut requests: Vec<SpotRequest> = Vec::new();
        for job in misses {
            let request = SpotRequest {
                min_memory: job.memory_required,
                capabilities: self.registry.lookup(&job.model_name).capabilities.clone(),
                max_price: job.max_price,
            };
            let duplicate = requests.iter().any(|r| {
                r.min_memory == request.min_memory
                    && r.max_price == request.max_price
                    && r.capabilities == request.capabilities
            });
            if !duplicate {
                requests.push(request);
            }
        }

        let scheduler = Arc::clone(self);
        let organization = organization.to_string();
        tokio::spawn(async move {
            let result = spot.provision_any(&organization, &requests).await;
            drop(slot);
            match result {
                Ok(gpu) => {
                    info!(organization = %organization, gpu_id = %gpu.id, "Spot GPU ready");
                    scheduler.trigger_sweep(&organization).await;
                }
                Err(e) => {
                    debug!(organization = %organization, error = %e, "Spot fallback unavailable")
                }
            }
        });
        true
    }

    async fn place(&self, job: &Job) -> FleetResult<Placement> {
        match self.allocator.allocate(job).await {
            Ok((gpu, job)) => {
                self.launch(&job, &gpu).await;
                Ok(Placement::Placed)
            }
            Err(FleetError::Allocation(_)) | Err(FleetError::Conflict(_)) => Ok(Placement::Missed),
            Err(FleetError::InvalidTransition { .. }) | Err(FleetError::JobNotFound(_)) => {
                Ok(Placement::Gone)
            }
            Err(e) => Err(e),
        }
    }

    /// Hand a bound job to the executor; a failed launch fails the job
    async fn launch(&self, job: &Job, gpu: &Gpu) {
        if let Err(e) = self.executor.launch(job, gpu).await {
            error!(job_id = %job.id, gpu_id = %gpu.id, error = %e, "Job launch failed");
            if let Err(e) = self
                .finish_job(job.id, JobOutcome::Failed(e.to_string()))
                .await
            {
                error!(job_id = %job.id, error = %e, "Failed to release job after launch failure");
            }
        }
    }

    /// Sweep every organization; organizations run concurrently
    pub async fn sweep_all(self: &Arc<Self>) -> FleetResult<Vec<SweepReport>> {
        let orgs = self.store.list_organizations().await?;
        let results = join_all(orgs.iter().map(|o| self.sweep(&o.id))).await;
        let mut reports = Vec::new();
        for (org, result) in orgs.iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => warn!(organization = %org.id, error = %e, "Sweep failed"),
            }
        }
        Ok(reports)
    }

    /// Fill underused GPUs of `organization` with batches of queued jobs.
    ///
    /// GPUs are visited most efficient first. Returns the number of jobs bound.
    pub async fn rebalance(self: &Arc<Self>, organization: &str) -> FleetResult<usize> {
        let Some(mut ticket) = self.sweeps.try_enter(organization) else {
            return Ok(0);
        };
        let result = self.rebalance_pass(organization).await;
        // a trigger that arrived meanwhile still owes a sweep
        let rerun = ticket.should_rerun();
        drop(ticket);
        if rerun {
            self.trigger_sweep(organization).await;
        }
        result
    }

    async fn rebalance_pass(&self, organization: &str) -> FleetResult<usize> {
        let window = ReportWindow::last_hours(24);
        let now = Utc::now();
        let gpus = self
            .store
            .list_gpus(
                &GpuFilter::organization(organization)
                    .with_statuses(&[GpuStatus::Available, GpuStatus::InUse]),
            )
            .await?;

        let mut ranked = Vec::new();
        for gpu in gpus.into_iter().filter(|g| g.is_placeable(now)) {
            let score = self.cost.efficiency(&gpu, window).await.score;
            ranked.push((score, gpu));
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut bound = 0;
        for (_, gpu) in ranked {
            // pick up binds made earlier in this pass
            let gpu = self.store.get_gpu(gpu.id).await?;
            if !self.batch.is_underutilized(&gpu) {
                continue;
            }
            let queued = self
                .store
                .list_jobs(&JobFilter::queued(organization, self.config.sweep_limit))
                .await?;
            let Some(batch) = self.batch.select(&queued, &self.registry, &gpu, now) else {
                continue;
            };
            debug!(
                gpu_id = %gpu.id,
                model = %batch.model_name,
                jobs = batch.len(),
                footprint = batch.footprint,
                "Rebalancing batch onto GPU"
            );
            for (job_id, memory) in batch.charges {
                match self.allocator.assign(job_id, gpu.id, memory).await {
                    Ok((gpu, job)) => {
                        self.launch(&job, &gpu).await;
                        bound += 1;
                    }
                    Err(e) => debug!(job_id = %job_id, gpu_id = %gpu.id, error = %e, "Batch bind skipped"),
                }
            }
        }
        if bound > 0 {
            info!(organization = %organization, jobs = bound, "Rebalance bound queued jobs");
        }
        Ok(bound)
    }

    pub async fn rebalance_all(self: &Arc<Self>) -> FleetResult<usize> {
        let orgs = self.store.list_organizations().await?;
        let results = join_all(orgs.iter().map(|o| self.rebalance(&o.id))).await;
        Ok(results
            .into_iter()
            .filter_map(|r| r.map_err(|e| warn!(error = %e, "Rebalance failed")).ok())
            .sum())
    }

    /// Run the sweep and rebalance loops until shutdown
    pub async fn run(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval());
        let mut rebalance_tick = tokio::time::interval(self.config.rebalance_interval());
        info!(
            sweep_interval_secs = self.config.sweep_interval().as_secs(),
            rebalance_interval_secs = self.config.rebalance_interval().as_secs(),
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = sweep_tick.tick() => {
                    if let Err(e) = self.sweep_all().await {
                        error!(error = %e, "Sweep pass failed");
                    }
                }
                _ = rebalance_tick.tick() => {
                    if let Err(e) = self.rebalance_all().await {
                        error!(error = %e, "Rebalance pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scheduler loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply executor completions until the channel closes or shutdown
    pub async fn run_completions(
        self: &Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                completion = completions.recv() => {
                    let Some(completion) = completion else { break };
                    if let Err(e) = self.complete_job(completion.job_id, completion.outcome).await {
                        warn!(job_id = %completion.job_id, error = %e, "Completion not applied");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Completion pump stopped");
    }
}
