//! Execution backends for bound jobs

use async_trait::async_trait;
use gpufleet_core::{FleetError, FleetResult, Gpu, Job, JobOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A finished job reported back to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub job_id: Uuid,
    pub outcome: JobOutcome,
}

/// Runs a job once it is bound to a GPU.
///
/// `launch` returns as soon as the job is started; the outcome is reported
/// later through `Scheduler::complete_job`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn launch(&self, job: &Job, gpu: &Gpu) -> FleetResult<()>;

    fn name(&self) -> &'static str;
}

/// Finishes every job successfully after a fixed run time
pub struct SimulatedExecutor {
    run_time: Duration,
    completions: mpsc::UnboundedSender<Completion>,
}

impl SimulatedExecutor {
    /// Create the executor and the channel its completions arrive on
    pub fn new(run_time: Duration) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                run_time,
                completions: tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn launch(&self, job: &Job, gpu: &Gpu) -> FleetResult<()> {
        let completion = Completion {
            job_id: job.id,
            outcome: JobOutcome::Completed(Some(serde_json::json!({
                "model": job.model_name,
                "gpu": gpu.name,
            }))),
        };
        let tx = self.completions.clone();
        let run_time = self.run_time;
        debug!(job_id = %job.id, gpu_id = %gpu.id, "Simulated run started");
        tokio::spawn(async move {
            tokio::time::sleep(run_time).await;
            let _ = tx.send(completion);
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Starts nothing; completions are reported by an outside caller.
///
/// Records every launch so callers can see what was started.
#[derive(Default)]
pub struct ManualExecutor {
    launched: Mutex<Vec<(Uuid, Uuid)>>,
    fail_launches: AtomicBool,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// (job, GPU) pairs launched so far
    pub fn launched(&self) -> Vec<(Uuid, Uuid)> {
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make subsequent launches fail
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ManualExecutor {
    async fn launch(&self, job: &Job, gpu: &Gpu) -> FleetResult<()> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(FleetError::Execution(format!(
                "launch of job {} refused",
                job.id
            )));
        }
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job.id, gpu.id));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
