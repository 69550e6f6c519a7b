//! Cost metering
//!
//! One billing session is open per (organization, GPU, job) while the job is
//! bound. Closed sessions feed spend reports and the advisory per-GPU
//! efficiency score used by rebalancing.

use chrono::{DateTime, Duration, Utc};
use gpufleet_core::{
    CostConfig, CostReport, CostSession, EfficiencyScore, FleetError, FleetResult, Gpu, Job,
    ReportWindow, SessionKey,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

pub struct CostMeter {
    config: CostConfig,
    open: RwLock<HashMap<SessionKey, CostSession>>,
    closed: RwLock<Vec<CostSession>>,
}

impl CostMeter {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    /// Open a session for `job` on `gpu` starting now
    pub async fn start(&self, gpu: &Gpu, job: &Job) -> FleetResult<SessionKey> {
        self.start_at(gpu, job, Utc::now()).await
    }

    pub async fn start_at(
        &self,
        gpu: &Gpu,
        job: &Job,
        start_time: DateTime<Utc>,
    ) -> FleetResult<SessionKey> {
        let key = SessionKey::new(&job.organization_id, gpu.id, job.id);
        let provider = match &gpu.lease {
            Some(lease) => lease.provider.clone(),
            None => gpu.provider.to_string(),
        };

        let mut open = self.open.write().await;
        if open.contains_key(&key) {
            return Err(FleetError::Consistency(format!(
                "cost session already open for job {} on GPU {}",
                job.id, gpu.id
            )));
        }
        open.insert(
            key.clone(),
            CostSession {
                key: key.clone(),
                provider,
                model_name: job.model_name.clone(),
                gpu_name: gpu.name.clone(),
                start_time,
                cost_per_hour: gpu.cost_per_hour,
                end_time: None,
                total_cost: 0.0,
            },
        );
        debug!(job_id = %job.id, gpu_id = %gpu.id, rate = gpu.cost_per_hour, "Cost session opened");
        Ok(key)
    }

    /// Close the session now and return it
    pub async fn stop(&self, key: &SessionKey) -> FleetResult<CostSession> {
        self.stop_at(key, Utc::now()).await
    }

    pub async fn stop_at(&self, key: &SessionKey, end: DateTime<Utc>) -> FleetResult<CostSession> {
        let mut session = self.open.write().await.remove(key).ok_or_else(|| {
            FleetError::Consistency(format!(
                "no open cost session for job {} on GPU {}",
                key.job_id, key.gpu_id
            ))
        })?;
        session.close(end);
        {
            let mut closed = self.closed.write().await;
            closed.push(session.clone());
            self.prune(&mut closed, Utc::now());
        }
        debug!(
            job_id = %key.job_id,
            gpu_id = %key.gpu_id,
            cost = session.total_cost,
            "Cost session closed"
        );
        Ok(session)
    }

    fn prune(&self, closed: &mut Vec<CostSession>, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(self.config.retention_hours as i64);
        let before = closed.len();
        closed.retain(|s| s.end_time.map_or(true, |t| t >= horizon));
        if closed.len() < before {
            debug!(pruned = before - closed.len(), "Pruned expired cost sessions");
        }
    }

    /// Drop an open session that never billed (its binding was not committed)
    pub async fn discard(&self, key: &SessionKey) -> Option<CostSession> {
        self.open.write().await.remove(key)
    }

    /// Undo a `stop` whose release was not committed
    pub async fn reopen(&self, session: CostSession) {
        {
            let mut closed = self.closed.write().await;
            if let Some(pos) = closed
                .iter()
                .rposition(|s| s.key == session.key && s.end_time == session.end_time)
            {
                closed.remove(pos);
            }
        }
        let mut session = session;
        session.end_time = None;
        session.total_cost = 0.0;
        self.open.write().await.insert(session.key.clone(), session);
    }

    pub async fn is_open(&self, key: &SessionKey) -> bool {
        self.open.read().await.contains_key(key)
    }

    /// Open sessions, optionally for one organization
    pub async fn open_sessions(&self, organization: Option<&str>) -> Vec<CostSession> {
        self.open
            .read()
            .await
            .values()
            .filter(|s| organization.map_or(true, |o| s.key.organization_id == o))
            .cloned()
            .collect()
    }

    /// Spend of `organization` over sessions that closed inside `window`
    pub async fn report(&self, organization: &str, window: ReportWindow) -> CostReport {
        let closed = self.closed.read().await;
        let mut report = CostReport {
            organization_id: organization.to_string(),
            ..Default::default()
        };
        let mut by_provider: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_model: BTreeMap<String, f64> = BTreeMap::new();
        let mut jobs = HashSet::new();

        for session in closed.iter().filter(|s| {
            s.key.organization_id == organization && s.end_time.is_some_and(|t| window.contains(t))
        }) {
            report.total_cost += session.total_cost;
            *by_provider.entry(session.provider.clone()).or_default() += session.total_cost;
            *by_model.entry(session.model_name.clone()).or_default() += session.total_cost;
            jobs.insert(session.key.job_id);
        }

        report.total_jobs = jobs.len() as u64;
        report.cost_per_job = if report.total_jobs > 0 {
            report.total_cost / report.total_jobs as f64
        } else {
            0.0
        };
        report.by_provider = by_provider;
        report.by_model = by_model;
        report
    }

    /// Advisory efficiency of `gpu` over `window`
    pub async fn efficiency(&self, gpu: &Gpu, window: ReportWindow) -> EfficiencyScore {
        let utilization = gpu.memory_utilization();

        let baseline = self.config.baseline_price(&gpu.name);
        let cost_ratio = if gpu.cost_per_hour <= 0.0 {
            1.0
        } else {
            (baseline / gpu.cost_per_hour).min(1.0)
        };

        let completed = self
            .closed
            .read()
            .await
            .iter()
            .filter(|s| s.key.gpu_id == gpu.id && s.end_time.is_some_and(|t| window.contains(t)))
            .count();
        let hours = window.hours();
        let throughput = if hours > 0.0 && self.config.baseline_jobs_per_hour > 0.0 {
            (completed as f64 / hours / self.config.baseline_jobs_per_hour).min(1.0)
        } else {
            0.0
        };

        let score = self.config.utilization_weight * utilization
            + self.config.cost_weight * cost_ratio
            + self.config.throughput_weight * throughput;

        EfficiencyScore {
            gpu_id: gpu.id,
            utilization,
            cost_ratio,
            throughput,
            score,
        }
    }
}

impl Default for CostMeter {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_core::{GpuSpec, JobSpec};

    fn gpu(name: &str, cost: f64) -> Gpu {
        Gpu::dedicated(
            GpuSpec {
                organization_id: "acme".to_string(),
                name: name.to_string(),
                total_memory: 16000,
                capabilities: Default::default(),
                cost_per_hour: cost,
                max_jobs: None,
            },
            4,
        )
    }

    fn job(model: &str) -> Job {
        Job::queued(JobSpec::new("acme", model), "llm".to_string(), 50, 8000, 3)
    }

    #[tokio::test]
    async fn test_session_cost_is_hours_times_rate() {
        let meter = CostMeter::default();
        let gpu = gpu("A100", 2.0);
        let job = job("phi-2");
        let start = Utc::now() - Duration::minutes(30);

        let key = meter.start_at(&gpu, &job, start).await.unwrap();
        let session = meter.stop_at(&key, start + Duration::minutes(30)).await.unwrap();
        assert!((session.total_cost - 1.0).abs() < 1e-9);
        assert!(!meter.is_open(&key).await);
    }

    #[tokio::test]
    async fn test_one_open_session_per_pair() {
        let meter = CostMeter::default();
        let gpu = gpu("A100", 2.0);
        let job = job("phi-2");
        meter.start(&gpu, &job).await.unwrap();
        assert!(matches!(
            meter.start(&gpu, &job).await,
            Err(FleetError::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_consistency_error() {
        let meter = CostMeter::default();
        let key = SessionKey::new("acme", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        assert!(matches!(meter.stop(&key).await, Err(FleetError::Consistency(_))));
    }

    #[tokio::test]
    async fn test_reopen_undoes_stop() {
        let meter = CostMeter::default();
        let gpu = gpu("A100", 2.0);
        let job = job("phi-2");
        let key = meter.start(&gpu, &job).await.unwrap();

        let session = meter.stop(&key).await.unwrap();
        meter.reopen(session).await;
        assert!(meter.is_open(&key).await);
        let report = meter.report("acme", ReportWindow::last_hours(1)).await;
        assert_eq!(report.total_jobs, 0);
    }

    #[tokio::test]
    async fn test_report_groups_by_provider_and_model() {
        let meter = CostMeter::default();
        let gpu = gpu("A100", 1.0);
        let start = Utc::now() - Duration::hours(2);

        for model in ["phi-2", "phi-2", "deepseek-coder"] {
            let job = job(model);
            let key = meter.start_at(&gpu, &job, start).await.unwrap();
            meter.stop_at(&key, start + Duration::hours(1)).await.unwrap();
        }
        // outside the window
        let old = job("phi-2");
        let key = meter
            .start_at(&gpu, &old, start - Duration::hours(48))
            .await
            .unwrap();
        meter
            .stop_at(&key, start - Duration::hours(47))
            .await
            .unwrap();

        let report = meter.report("acme", ReportWindow::last_hours(24)).await;
        assert_eq!(report.total_jobs, 3);
        assert!((report.total_cost - 3.0).abs() < 1e-9);
        assert!((report.cost_per_job - 1.0).abs() < 1e-9);
        assert!((report.by_model["phi-2"] - 2.0).abs() < 1e-9);
        assert!((report.by_provider["dedicated"] - 3.0).abs() < 1e-9);

        let other = meter.report("globex", ReportWindow::last_hours(24)).await;
        assert_eq!(other.total_jobs, 0);
        assert_eq!(other.cost_per_job, 0.0);
    }

    #[tokio::test]
    async fn test_closed_sessions_past_retention_are_pruned() {
        let meter = CostMeter::new(CostConfig {
            retention_hours: 24,
            ..Default::default()
        });
        let gpu = gpu("A100", 1.0);
        let old_start = Utc::now() - Duration::hours(50);

        let old = job("phi-2");
        let key = meter.start_at(&gpu, &old, old_start).await.unwrap();
        meter.stop_at(&key, old_start + Duration::hours(1)).await.unwrap();

        let recent = job("phi-2");
        let key = meter.start(&gpu, &recent).await.unwrap();
        meter.stop(&key).await.unwrap();

        assert_eq!(meter.closed.read().await.len(), 1);
        let report = meter.report("acme", ReportWindow::last_hours(100)).await;
        assert_eq!(report.total_jobs, 1);
    }

    #[tokio::test]
    async fn test_efficiency_blend() {
        let meter = CostMeter::default();
        let mut gpu = gpu("NVIDIA A100", 6.0);
        gpu.bind(uuid::Uuid::new_v4(), 8000).unwrap();

        let score = meter.efficiency(&gpu, ReportWindow::last_hours(1)).await;
        assert!((score.utilization - 0.5).abs() < 1e-9);
        assert!((score.cost_ratio - 0.5).abs() < 1e-9);
        assert_eq!(score.throughput, 0.0);
        assert!((score.score - (0.4 * 0.5 + 0.3 * 0.5)).abs() < 1e-9);
    }
}
