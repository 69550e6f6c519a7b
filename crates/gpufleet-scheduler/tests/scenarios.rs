//! End-to-end scheduling scenarios against the in-memory store

use std::sync::Arc;
use std::time::{Duration, Instant};

use gpufleet_core::{
    Capabilities, DaemonConfig, FleetError, Gpu, GpuSpec, GpuStatus, Job, JobOutcome, JobSpec,
    JobStatus, ModelRequirements, PollConfig, ReportWindow, SpotConfig, SpotOffer,
};
use gpufleet_scheduler::{ManualExecutor, Scheduler};
use gpufleet_spot::{Marketplace, ProviderRegistry, SimulatedMarketplace, SpotProvisioner};
use gpufleet_store::{GpuLocks, MemoryStore, Store};
use uuid::Uuid;

fn model(name: &str, memory: u64) -> ModelRequirements {
    ModelRequirements {
        name: name.to_string(),
        min_memory: memory,
        preferred_memory: memory,
        ..ModelRequirements::fallback()
    }
}

fn config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.scheduler.memory_overhead = 1.0;
    config.models = Some(vec![
        model("small", 8000),
        model("medium", 10000),
        model("large", 12000),
        model("huge", 20000),
    ]);
    config
}

struct Fleet {
    store: Arc<MemoryStore>,
    locks: Arc<GpuLocks>,
    scheduler: Arc<Scheduler>,
    executor: Arc<ManualExecutor>,
}

async fn fleet() -> Fleet {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(GpuLocks::new());
    let executor = Arc::new(ManualExecutor::new());
    let scheduler = Scheduler::new(store.clone(), locks.clone(), executor.clone(), &config());
    scheduler.register_organization("acme", "Acme").await.unwrap();
    Fleet {
        store,
        locks,
        scheduler: Arc::new(scheduler),
        executor,
    }
}

fn dedicated(memory: u64) -> GpuSpec {
    GpuSpec {
        organization_id: "acme".to_string(),
        name: "A100".to_string(),
        total_memory: memory,
        capabilities: Capabilities::new(),
        cost_per_hour: 1.0,
        max_jobs: None,
    }
}

fn job(model: &str) -> JobSpec {
    JobSpec::new("acme", model)
}

async fn gpu(fleet: &Fleet, id: Uuid) -> Gpu {
    fleet.store.get_gpu(id).await.unwrap()
}

#[tokio::test]
async fn scenario_a_single_gpu_queue_drains_after_completion() {
    let fleet = fleet().await;
    let g = fleet.scheduler.register_gpu(dedicated(16000)).await.unwrap();
    assert_eq!(g.available_memory, 16000);

    let j1 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    assert_eq!(j1.memory_required, 8000);
    assert_eq!(j1.status, JobStatus::Running);
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 8000);

    let j2 = fleet.scheduler.submit_job(job("medium")).await.unwrap();
    assert_eq!(j2.status, JobStatus::Queued);
    assert!(matches!(
        fleet.scheduler.allocator().allocate(&j2).await,
        Err(FleetError::Allocation(_))
    ));
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 8000);

    fleet
        .scheduler
        .allocator()
        .release(g.id, j1.id, JobOutcome::Completed(None))
        .await
        .unwrap();
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 16000);

    let report = fleet.scheduler.sweep("acme").await.unwrap();
    assert_eq!(report.allocated, 1);
    assert_eq!(report.still_queued, 0);
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 6000);
    let j2 = fleet.scheduler.get_job(j2.id).await.unwrap();
    assert_eq!(j2.status, JobStatus::Running);
    assert_eq!(j2.gpu_id, Some(g.id));
}

#[tokio::test]
async fn scenario_a_completion_triggers_sweep() {
    let fleet = fleet().await;
    let g = fleet.scheduler.register_gpu(dedicated(16000)).await.unwrap();
    let j1 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    let j2 = fleet.scheduler.submit_job(job("medium")).await.unwrap();
    assert_eq!(j2.status, JobStatus::Queued);

    let done = fleet
        .scheduler
        .complete_job(j1.id, JobOutcome::Completed(None))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.gpu_id.is_none());

    assert_eq!(
        fleet.scheduler.get_job(j2.id).await.unwrap().status,
        JobStatus::Running
    );
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 6000);

    let report = fleet
        .scheduler
        .cost_report("acme", ReportWindow::last_hours(1))
        .await
        .unwrap();
    assert_eq!(report.total_jobs, 1);
}

fn offer(instance_type: &str, price: f64, memory: u64) -> SpotOffer {
    SpotOffer {
        provider: String::new(),
        instance_type: instance_type.to_string(),
        price,
        memory,
        capabilities: Capabilities::new(),
        gpu_name: "A100".to_string(),
    }
}

fn fast_poll() -> PollConfig {
    PollConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

async fn spot_fleet(markets: Vec<(&str, Arc<SimulatedMarketplace>)>, poll: PollConfig) -> Fleet {
    let mut providers = ProviderRegistry::new();
    for (name, market) in markets {
        providers
            .register(name, Marketplace::Simulated(market))
            .unwrap();
    }
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(GpuLocks::new());
    let spot = SpotProvisioner::new(
        store.clone(),
        locks.clone(),
        providers,
        SpotConfig {
            enabled: true,
            poll,
            ..Default::default()
        },
    );
    let executor = Arc::new(ManualExecutor::new());
    let scheduler = Scheduler::new(store.clone(), locks.clone(), executor.clone(), &config())
        .with_spot(Arc::new(spot));
    scheduler.register_organization("acme", "Acme").await.unwrap();
    Fleet {
        store,
        locks,
        scheduler: Arc::new(scheduler),
        executor,
    }
}

async fn wait_for_status(scheduler: &Scheduler, id: Uuid, status: JobStatus) -> Job {
    for _ in 0..500 {
        let job = scheduler.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, status);
}

async fn wait_spot_idle(scheduler: &Scheduler, organization: &str) {
    for _ in 0..500 {
        if !scheduler.spot_in_flight(organization) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("spot provision for {} never finished", organization);
}

#[tokio::test]
async fn scenario_b_spot_fallback_takes_cheapest_offer_under_price() {
    let cheap = Arc::new(SimulatedMarketplace::new(
        "cheap",
        vec![offer("a100-cheap", 0.9, 16000)],
        1,
    ));
    let pricey = Arc::new(SimulatedMarketplace::new(
        "pricey",
        vec![offer("a100-pricey", 1.2, 16000)],
        0,
    ));
    let fleet = spot_fleet(
        vec![("cheap", cheap.clone()), ("pricey", pricey.clone())],
        fast_poll(),
    )
    .await;
    let scheduler = &fleet.scheduler;
    assert!(scheduler.list_gpus(Some("acme"), None).await.unwrap().is_empty());

    let mut spec = job("large");
    spec.max_price = Some(1.0);
    let j3 = scheduler.submit_job(spec).await.unwrap();
    assert_eq!(j3.status, JobStatus::Queued);

    let j3 = wait_for_status(scheduler, j3.id, JobStatus::Running).await;
    assert_eq!(cheap.provisioned().len(), 1);
    assert!(pricey.provisioned().is_empty());

    let gpus = scheduler.list_gpus(Some("acme"), None).await.unwrap();
    assert_eq!(gpus.len(), 1);
    let spot_gpu = &gpus[0];
    assert!(spot_gpu.is_spot());
    assert_eq!(spot_gpu.cost_per_hour, 0.9);
    assert_eq!(spot_gpu.status, GpuStatus::InUse);
    assert_eq!(spot_gpu.available_memory, 16000 - 12000);
    assert_eq!(
        spot_gpu.lease.as_ref().map(|l| l.provider.as_str()),
        Some("cheap")
    );
    assert_eq!(j3.gpu_id, Some(spot_gpu.id));
    assert_eq!(fleet.executor.launched(), vec![(j3.id, spot_gpu.id)]);
}

#[tokio::test]
async fn scenario_b_no_offer_under_price_leaves_job_queued() {
    let pricey = Arc::new(SimulatedMarketplace::new(
        "pricey",
        vec![offer("a100-pricey", 1.2, 16000)],
        0,
    ));
    let fleet = spot_fleet(vec![("pricey", pricey.clone())], fast_poll()).await;

    let mut spec = job("large");
    spec.max_price = Some(1.0);
    let j = fleet.scheduler.submit_job(spec).await.unwrap();
    wait_spot_idle(&fleet.scheduler, "acme").await;

    let j = fleet.scheduler.get_job(j.id).await.unwrap();
    assert_eq!(j.status, JobStatus::Queued);
    assert!(pricey.provisioned().is_empty());
    assert!(fleet.scheduler.list_gpus(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn spot_fallback_moves_past_a_miss_no_offer_can_serve() {
    // nothing on the market fits "large"; "medium" does
    let market = Arc::new(SimulatedMarketplace::new(
        "market",
        vec![offer("a10", 0.9, 10000)],
        0,
    ));
    let fleet = spot_fleet(vec![("market", market.clone())], fast_poll()).await;

    let mut large = job("large");
    large.priority = Some(90);
    large.max_price = Some(1.0);
    let large = fleet.scheduler.submit_job(large).await.unwrap();
    wait_spot_idle(&fleet.scheduler, "acme").await;
    assert!(market.provisioned().is_empty());

    let mut medium = job("medium");
    medium.priority = Some(10);
    medium.max_price = Some(1.0);
    let medium = fleet.scheduler.submit_job(medium).await.unwrap();

    let medium = wait_for_status(&fleet.scheduler, medium.id, JobStatus::Running).await;
    let spot_gpu = gpu(&fleet, medium.gpu_id.unwrap()).await;
    assert!(spot_gpu.is_spot());
    assert_eq!(spot_gpu.total_memory, 10000);
    assert_eq!(market.provisioned().len(), 1);
    assert_eq!(
        fleet.scheduler.get_job(large.id).await.unwrap().status,
        JobStatus::Queued
    );
}

#[tokio::test]
async fn slow_spot_lease_never_holds_back_a_freed_gpu() {
    let slow = Arc::new(SimulatedMarketplace::new(
        "slow",
        vec![offer("a100-80g", 0.9, 24000)],
        0,
    ));
    slow.never_ready(true);
    let fleet = spot_fleet(
        vec![("slow", slow.clone())],
        PollConfig {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 500,
        },
    )
    .await;
    let scheduler = &fleet.scheduler;
    let g = scheduler.register_gpu(dedicated(16000)).await.unwrap();
    let j1 = scheduler.submit_job(job("large")).await.unwrap();
    assert_eq!(j1.status, JobStatus::Running);

    let started = Instant::now();
    let mut spec = job("huge");
    spec.max_price = Some(1.0);
    let j3 = scheduler.submit_job(spec).await.unwrap();
    assert_eq!(j3.status, JobStatus::Queued);
    assert!(scheduler.spot_in_flight("acme"));

    let j2 = scheduler.submit_job(job("medium")).await.unwrap();
    assert_eq!(j2.status, JobStatus::Queued);
    scheduler
        .complete_job(j1.id, JobOutcome::Completed(None))
        .await
        .unwrap();

    // the lease is still polling while the freed GPU is reused
    let j2 = scheduler.get_job(j2.id).await.unwrap();
    assert_eq!(j2.status, JobStatus::Running);
    assert_eq!(j2.gpu_id, Some(g.id));
    assert!(scheduler.spot_in_flight("acme"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(gpu(&fleet, g.id).await.available_memory, 6000);

    wait_spot_idle(scheduler, "acme").await;
    assert_eq!(slow.provisioned().len(), 1);
    assert_eq!(slow.terminated().len(), 1);
    assert_eq!(
        scheduler.get_job(j3.id).await.unwrap().status,
        JobStatus::Queued
    );
    let offline = scheduler
        .list_gpus(Some("acme"), Some(GpuStatus::Offline))
        .await
        .unwrap();
    assert_eq!(offline.len(), 1);
    assert!(offline[0].is_spot());
}

#[tokio::test]
async fn scenario_c_cancel_touches_only_the_bound_gpu() {
    let fleet = fleet().await;
    let a = fleet.scheduler.register_gpu(dedicated(8000)).await.unwrap();
    let b = fleet.scheduler.register_gpu(dedicated(8000)).await.unwrap();

    let j1 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    let j2 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    let j3 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    assert_eq!(j1.status, JobStatus::Running);
    assert_eq!(j2.status, JobStatus::Running);
    assert_eq!(j3.status, JobStatus::Queued);

    let before_a = gpu(&fleet, a.id).await;
    let before_b = gpu(&fleet, b.id).await;

    let cancelled = fleet.scheduler.cancel_job(j3.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(gpu(&fleet, a.id).await, before_a);
    assert_eq!(gpu(&fleet, b.id).await, before_b);

    let (bound, other) = if j1.gpu_id == Some(a.id) {
        (before_a, before_b)
    } else {
        (before_b, before_a)
    };
    let cancelled = fleet.scheduler.cancel_job(j1.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.gpu_id.is_none());

    let released = gpu(&fleet, bound.id).await;
    assert_eq!(released.available_memory, 8000);
    assert_eq!(released.current_job_count, 0);
    assert_eq!(released.status, GpuStatus::Available);
    assert_eq!(gpu(&fleet, other.id).await, other);
}

#[tokio::test]
async fn scenario_d_mismatched_release_mutates_nothing() {
    let fleet = fleet().await;
    let a = fleet.scheduler.register_gpu(dedicated(8000)).await.unwrap();
    let b = fleet.scheduler.register_gpu(dedicated(8000)).await.unwrap();
    let j1 = fleet.scheduler.submit_job(job("small")).await.unwrap();
    let j2 = fleet.scheduler.submit_job(job("small")).await.unwrap();

    let wrong_gpu = if j1.gpu_id == Some(a.id) { b.id } else { a.id };
    let before_gpu = gpu(&fleet, wrong_gpu).await;
    let before_job = fleet.store.get_job(j1.id).await.unwrap();

    let result = fleet
        .scheduler
        .allocator()
        .release(wrong_gpu, j1.id, JobOutcome::Completed(None))
        .await;
    assert!(matches!(result, Err(FleetError::Consistency(_))));

    assert_eq!(gpu(&fleet, wrong_gpu).await, before_gpu);
    assert_eq!(fleet.store.get_job(j1.id).await.unwrap(), before_job);
    assert_eq!(
        fleet.store.get_job(j2.id).await.unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn transitions_outside_the_state_machine_are_rejected() {
    let fleet = fleet().await;
    let queued = fleet.scheduler.submit_job(job("small")).await.unwrap();
    assert!(matches!(
        fleet
            .scheduler
            .complete_job(queued.id, JobOutcome::Failed("boom".into()))
            .await,
        Err(FleetError::InvalidTransition { .. })
    ));
    assert_eq!(
        fleet.store.get_job(queued.id).await.unwrap(),
        queued,
        "rejected transition leaves the job as it was"
    );

    fleet.scheduler.register_gpu(dedicated(8000)).await.unwrap();
    let done = fleet
        .scheduler
        .complete_job(queued.id, JobOutcome::Completed(None))
        .await
        .unwrap();
    assert!(matches!(
        fleet.scheduler.cancel_job(done.id).await,
        Err(FleetError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn concurrent_submissions_never_overcommit() {
    let fleet = fleet().await;
    let g = fleet.scheduler.register_gpu(dedicated(16000)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = fleet.scheduler.clone();
            tokio::spawn(async move { scheduler.submit_job(job("small")).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let g = gpu(&fleet, g.id).await;
    g.check_invariants().unwrap();
    assert_eq!(g.current_job_count, 2);
    assert_eq!(g.available_memory, 0);
    let running = fleet
        .scheduler
        .list_jobs(Some("acme"), Some(JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 2);
    assert_eq!(fleet.executor.launched().len(), 2);

    // drain: every completion frees room for exactly one more job
    for _ in 0..4 {
        let running = fleet
            .scheduler
            .list_jobs(Some("acme"), Some(JobStatus::Running))
            .await
            .unwrap();
        let completions: Vec<_> = running
            .into_iter()
            .map(|j| {
                let scheduler = fleet.scheduler.clone();
                tokio::spawn(async move {
                    scheduler
                        .complete_job(j.id, JobOutcome::Completed(None))
                        .await
                })
            })
            .collect();
        for handle in completions {
            handle.await.unwrap().unwrap();
        }
        gpu(&fleet, g.id).await.check_invariants().unwrap();
    }

    let completed = fleet
        .scheduler
        .list_jobs(Some("acme"), Some(JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 8);
    let g = gpu(&fleet, g.id).await;
    assert_eq!(g.available_memory, 16000);
    assert_eq!(g.status, GpuStatus::Available);
    assert!(fleet.locks.try_lock(g.id).is_some());
}

#[tokio::test]
async fn organizations_are_isolated() {
    let fleet = fleet().await;
    fleet
        .scheduler
        .register_organization("globex", "Globex")
        .await
        .unwrap();
    fleet.scheduler.register_gpu(dedicated(16000)).await.unwrap();

    let foreign = fleet
        .scheduler
        .submit_job(JobSpec::new("globex", "small"))
        .await
        .unwrap();
    assert_eq!(foreign.status, JobStatus::Queued);

    let mut spec = dedicated(8000);
    spec.organization_id = "globex".to_string();
    let theirs = fleet.scheduler.register_gpu(spec).await.unwrap();
    let foreign = fleet.scheduler.get_job(foreign.id).await.unwrap();
    assert_eq!(foreign.gpu_id, Some(theirs.id));
    assert_eq!(theirs.available_memory, 8000, "registration returns the record before binding");
}
