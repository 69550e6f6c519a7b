//! Spot provisioning lifecycle
//!
//! The provisioner rents capacity from the cheapest marketplace offer, waits
//! for the lease to come up, and retires leases once they are expired or
//! reclaimed and idle. All GPU status changes happen under the per-GPU lock
//! shared with the allocator.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use gpufleet_core::{
    Capabilities, FleetError, FleetResult, Gpu, GpuProvider, GpuStatus, LeaseState, SpotConfig,
    SpotOffer,
};
use gpufleet_store::{GpuFilter, GpuLocks, Store};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::provider::SpotProvider;
use crate::registry::ProviderRegistry;

/// Statuses that hold a live lease
const LIVE_STATUSES: [GpuStatus; 4] = [
    GpuStatus::Provisioning,
    GpuStatus::Available,
    GpuStatus::InUse,
    GpuStatus::Terminating,
];

/// What a caller needs from a spot GPU
#[derive(Debug, Clone, Default)]
pub struct SpotRequest {
    pub min_memory: u64,
    pub capabilities: Capabilities,
    /// Hourly ceiling; the configured threshold applies when unset
    pub max_price: Option<f64>,
}

/// Outcome of one pass over the live leases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub checked: usize,
    pub marked_terminating: usize,
    pub marked_offline: usize,
    pub terminated: usize,
    pub replacements: usize,
}

/// Decrements the reservation counter when a provision attempt ends
struct Reservation<'a>(&'a AtomicU32);

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SpotProvisioner {
    store: Arc<dyn Store>,
    locks: Arc<GpuLocks>,
    providers: ProviderRegistry,
    config: SpotConfig,
    /// Attempts in flight that have not yet written their GPU record
    reserved: AtomicU32,
    admission: Mutex<()>,
}

impl SpotProvisioner {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<GpuLocks>,
        providers: ProviderRegistry,
        config: SpotConfig,
    ) -> Self {
        Self {
            store,
            locks,
            providers,
            config,
            reserved: AtomicU32::new(0),
            admission: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.providers.is_empty()
    }

    pub fn config(&self) -> &SpotConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Number of spot GPUs currently holding a lease
    pub async fn live_count(&self) -> FleetResult<usize> {
        let filter = GpuFilter::default()
            .with_provider(GpuProvider::Spot)
            .with_statuses(&LIVE_STATUSES);
        Ok(self.store.list_gpus(&filter).await?.len())
    }

    async fn reserve(&self) -> FleetResult<Reservation<'_>> {
        let _admission = self.admission.lock().await;
        let live = self.live_count().await? as u32;
        let reserved = self.reserved.load(Ordering::SeqCst);
        if live + reserved >= self.config.max_spot_instances {
            warn!(
                live,
                reserved,
                max = self.config.max_spot_instances,
                "Spot instance limit reached"
            );
            return Err(FleetError::SpotCapacity(format!(
                "{} of {} spot instances in use",
                live + reserved,
                self.config.max_spot_instances
            )));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(Reservation(&self.reserved))
    }

    /// Cheapest offer across every marketplace at or below `max_price`.
    ///
    /// Marketplaces are queried concurrently; one that errors is skipped.
    pub async fn best_offer(
        &self,
        min_memory: u64,
        capabilities: &Capabilities,
        max_price: f64,
    ) -> Option<SpotOffer> {
        let queries = self.providers.iter().map(|(name, market)| async move {
            match market.offers(min_memory, capabilities).await {
                Ok(offers) => offers
                    .into_iter()
                    .map(|mut o| {
                        o.provider = name.clone();
                        o
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Discarding offers from provider");
                    Vec::new()
                }
            }
        });

        join_all(queries)
            .await
            .into_iter()
            .flatten()
            .filter(|o| o.price <= max_price && o.memory >= min_memory)
            .min_by(|a, b| {
                a.price
                    .total_cmp(&b.price)
                    .then_with(|| a.provider.cmp(&b.provider))
            })
    }

    /// Rent a spot GPU for `organization` and wait until it is ready.
    ///
    /// Returns the GPU in `Available`. Errors leave no live lease behind: a
    /// lease that fails or never comes up is marked `Offline` and released.
    pub async fn provision(&self, organization: &str, request: SpotRequest) -> FleetResult<Gpu> {
        self.provision_any(organization, std::slice::from_ref(&request))
            .await
    }

    /// Rent a spot GPU for the first request any marketplace can serve.
    ///
    /// Requests are tried in order and only one lease is taken.
    pub async fn provision_any(
        &self,
        organization: &str,
        requests: &[SpotRequest],
    ) -> FleetResult<Gpu> {
        if !self.is_enabled() {
            return Err(FleetError::SpotCapacity(
                "spot provisioning is disabled".to_string(),
            ));
        }
        let reservation = self.reserve().await?;

        let mut chosen = None;
        for request in requests {
            let max_price = request.max_price.unwrap_or(self.config.price_threshold);
            match self
                .best_offer(request.min_memory, &request.capabilities, max_price)
                .await
            {
                Some(offer) => {
                    chosen = Some(offer);
                    break;
                }
                None => debug!(
                    memory = request.min_memory,
                    max_price, "No spot offer for request"
                ),
            }
        }
        let offer = chosen.ok_or_else(|| match requests {
            [only] => FleetError::Provisioning(format!(
                "no spot offer with {} memory at or below {:.2}/h",
                only.min_memory,
                only.max_price.unwrap_or(self.config.price_threshold)
            )),
            _ => FleetError::Provisioning(format!(
                "no spot offer for any of {} requests",
                requests.len()
            )),
        })?;

        let market = self.providers.get(&offer.provider).ok_or_else(|| {
            FleetError::Internal(format!("offer from unregistered provider {}", offer.provider))
        })?;
        let mut handle = market.provision(&offer).await?;
        handle.provider = offer.provider.clone();

        let termination_time = handle.expires_at.unwrap_or_else(|| {
            Utc::now() + ChronoDuration::seconds(self.config.lease_duration_secs as i64)
        });
        let gpu_name = if handle.gpu_name.is_empty() {
            offer.gpu_name.clone()
        } else {
            handle.gpu_name.clone()
        };
        let capabilities = if handle.capabilities.is_empty() {
            offer.capabilities.clone()
        } else {
            handle.capabilities.clone()
        };

        let gpu = Gpu::spot(
            organization.to_string(),
            gpu_name,
            handle.total_memory,
            capabilities,
            handle.cost_per_hour,
            handle.to_lease(),
            Some(termination_time),
            self.config.max_jobs,
        );
        let gpu = match self.store.create_gpu(gpu).await {
            Ok(gpu) => gpu,
            Err(e) => {
                if let Err(cleanup) = market.terminate(&handle.lease_id).await {
                    warn!(
                        lease = %handle.lease_id,
                        provider = %offer.provider,
                        error = %cleanup,
                        "Failed to release spot lease after store error"
                    );
                }
                return Err(e);
            }
        };
        drop(reservation);

        info!(
            gpu_id = %gpu.id,
            organization = %organization,
            provider = %offer.provider,
            lease = %handle.lease_id,
            price = offer.price,
            "Provisioning spot GPU"
        );

        self.wait_ready(gpu).await
    }

    async fn wait_ready(&self, gpu: Gpu) -> FleetResult<Gpu> {
        let lease = gpu
            .lease
            .clone()
            .ok_or_else(|| FleetError::Internal(format!("spot GPU {} has no lease", gpu.id)))?;
        let market = self.providers.get(&lease.provider).ok_or_else(|| {
            FleetError::Internal(format!("unknown provider {}", lease.provider))
        })?;

        let poll = &self.config.poll;
        for attempt in 0..poll.max_attempts {
            match market.status(&lease.lease_id).await {
                Ok(status) => match status.state {
                    LeaseState::Ready => return self.mark_ready(gpu.id).await,
                    LeaseState::Failed => {
                        let message = status
                            .error
                            .unwrap_or_else(|| "lease failed to start".to_string());
                        return Err(self.fail_provisioning(gpu.id, message).await);
                    }
                    LeaseState::Provisioning => {
                        debug!(gpu_id = %gpu.id, attempt, "Spot lease still provisioning");
                    }
                },
                Err(e) => warn!(gpu_id = %gpu.id, attempt, error = %e, "Spot status poll failed"),
            }
            if attempt + 1 < poll.max_attempts {
                tokio::time::sleep(poll.backoff(attempt)).await;
            }
        }

        let message = format!("not ready after {} status polls", poll.max_attempts);
        Err(self.fail_provisioning(gpu.id, message).await)
    }

    async fn mark_ready(&self, gpu_id: Uuid) -> FleetResult<Gpu> {
        let _guard = self.locks.lock(gpu_id).await;
        let mut gpu = self.store.get_gpu(gpu_id).await?;
        if gpu.status != GpuStatus::Provisioning {
            return Err(FleetError::Provisioning(format!(
                "spot GPU {} left provisioning as {}",
                gpu_id, gpu.status
            )));
        }
        let version = gpu.version;
        gpu.status = GpuStatus::Available;
        let gpu = self.store.update_gpu(gpu, version).await?;
        info!(gpu_id = %gpu.id, organization = %gpu.organization_id, "Spot GPU ready");
        Ok(gpu)
    }

    /// Flip the GPU offline, release its lease, and build the error to return
    async fn fail_provisioning(&self, gpu_id: Uuid, message: String) -> FleetError {
        error!(gpu_id = %gpu_id, error = %message, "Spot provisioning failed");
        if let Err(e) = self.mark_offline(gpu_id, &message).await {
            warn!(gpu_id = %gpu_id, error = %e, "Failed to mark spot GPU offline");
        }
        if let Err(e) = self.release_lease(gpu_id).await {
            warn!(gpu_id = %gpu_id, error = %e, "Failed to release spot lease");
        }
        FleetError::Provisioning(format!("spot GPU {}: {}", gpu_id, message))
    }

    async fn mark_offline(&self, gpu_id: Uuid, message: &str) -> FleetResult<Gpu> {
        let _guard = self.locks.lock(gpu_id).await;
        let mut gpu = self.store.get_gpu(gpu_id).await?;
        let version = gpu.version;
        gpu.status = GpuStatus::Offline;
        gpu.last_error = Some(message.to_string());
        self.store.update_gpu(gpu, version).await
    }

    async fn release_lease(&self, gpu_id: Uuid) -> FleetResult<()> {
        let gpu = self.store.get_gpu(gpu_id).await?;
        if let Some(lease) = &gpu.lease {
            if let Some(market) = self.providers.get(&lease.provider) {
                market.terminate(&lease.lease_id).await?;
            }
        }
        Ok(())
    }

    /// Terminate an idle spot GPU and delete its record
    pub async fn terminate(&self, gpu_id: Uuid) -> FleetResult<()> {
        let guard = self.locks.lock(gpu_id).await;
        let mut gpu = self.store.get_gpu(gpu_id).await?;
        if !gpu.is_spot() {
            return Err(FleetError::Validation(format!(
                "GPU {} is dedicated, not a spot lease",
                gpu_id
            )));
        }
        if gpu.current_job_count > 0 {
            return Err(FleetError::GpuBusy(format!(
                "GPU {} still hosts {} jobs",
                gpu_id, gpu.current_job_count
            )));
        }

        if let Some(lease) = gpu.lease.clone() {
            let market = self.providers.get(&lease.provider).ok_or_else(|| {
                FleetError::Internal(format!("unknown provider {}", lease.provider))
            })?;
            if let Err(e) = market.terminate(&lease.lease_id).await {
                // keep the record so the watch loop retries
                let version = gpu.version;
                gpu.status = GpuStatus::Terminating;
                gpu.last_error = Some(e.to_string());
                self.store.update_gpu(gpu, version).await?;
                return Err(e);
            }
        }

        self.store.delete_gpu(gpu_id).await?;
        drop(guard);
        self.locks.forget(gpu_id);
        info!(gpu_id = %gpu_id, "Spot GPU terminated");
        Ok(())
    }

    /// One pass over the live spot leases
    pub async fn watch_once(&self) -> FleetResult<WatchReport> {
        let filter = GpuFilter::default()
            .with_provider(GpuProvider::Spot)
            .with_statuses(&[GpuStatus::Available, GpuStatus::InUse, GpuStatus::Terminating]);
        let gpus = self.store.list_gpus(&filter).await?;
        let mut report = WatchReport::default();

        for gpu in gpus {
            report.checked += 1;
            let Some(lease) = gpu.lease.clone() else {
                continue;
            };
            let Some(market) = self.providers.get(&lease.provider) else {
                warn!(gpu_id = %gpu.id, provider = %lease.provider, "Spot GPU from unknown provider");
                continue;
            };

            let status = match market.status(&lease.lease_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(gpu_id = %gpu.id, error = %e, "Spot watch poll failed");
                    continue;
                }
            };

            if status.state == LeaseState::Failed {
                let message = status
                    .error
                    .unwrap_or_else(|| "lease failed".to_string());
                let failed = self.mark_offline(gpu.id, &message).await?;
                report.marked_offline += 1;
                error!(gpu_id = %gpu.id, error = %message, "Spot lease failed");

                if self.config.replace_failed && failed.current_job_count > 0 {
                    let request = SpotRequest {
                        min_memory: failed.total_memory,
                        capabilities: failed.capabilities.clone(),
                        max_price: None,
                    };
                    match self.provision(&failed.organization_id, request).await {
                        Ok(replacement) => {
                            report.replacements += 1;
                            info!(failed = %gpu.id, replacement = %replacement.id, "Replaced failed spot GPU");
                        }
                        Err(e) => warn!(gpu_id = %gpu.id, error = %e, "Spot replacement failed"),
                    }
                }
                continue;
            }

            if let Some(notice) = status.termination_notice {
                if self.mark_terminating(gpu.id, notice).await? {
                    report.marked_terminating += 1;
                }
            }

            let current = self.store.get_gpu(gpu.id).await?;
            let retire = current.status == GpuStatus::Terminating || current.is_expired(Utc::now());
            if retire && current.current_job_count == 0 {
                match self.terminate(gpu.id).await {
                    Ok(()) => report.terminated += 1,
                    Err(e) => warn!(gpu_id = %gpu.id, error = %e, "Spot termination deferred"),
                }
            }
        }

        if report != WatchReport::default() {
            debug!(?report, "Spot watch pass");
        }
        Ok(report)
    }

    async fn mark_terminating(
        &self,
        gpu_id: Uuid,
        notice: chrono::DateTime<Utc>,
    ) -> FleetResult<bool> {
        let _guard = self.locks.lock(gpu_id).await;
        let mut gpu = self.store.get_gpu(gpu_id).await?;
        if matches!(gpu.status, GpuStatus::Terminating | GpuStatus::Offline) {
            return Ok(false);
        }
        let version = gpu.version;
        gpu.status = GpuStatus::Terminating;
        gpu.termination_time = Some(gpu.termination_time.map_or(notice, |t| t.min(notice)));
        self.store.update_gpu(gpu, version).await?;
        warn!(gpu_id = %gpu_id, at = %notice, "Spot GPU scheduled for termination");
        Ok(true)
    }

    /// Run the watch loop until shutdown
    pub async fn run_watch(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "Spot watch started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.watch_once().await {
                        error!(error = %e, "Spot watch pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Spot watch shutting down");
                    break;
                }
            }
        }
    }
}
