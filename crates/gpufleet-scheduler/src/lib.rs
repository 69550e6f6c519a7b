//! gpufleet-scheduler: Job scheduling for gpufleet
//!
//! This crate provides the logic that turns queued jobs into running ones:
//! - Best-fit placement and atomic GPU binding
//! - Batch windows for underused GPUs
//! - Per-session cost metering and efficiency scoring
//! - Per-organization sweeps with spot fallback
//! - Execution backends

pub mod batch;
pub mod cost;
pub mod executor;
pub mod gpu_allocator;
pub mod placement;
pub mod queue;
pub mod scheduler;

pub use batch::{BatchOptimizer, BatchWindow};
pub use cost::CostMeter;
pub use executor::{Completion, Executor, ManualExecutor, SimulatedExecutor};
pub use gpu_allocator::GpuAllocator;
pub use placement::{BestFitStrategy, PlacementDecision, PlacementStrategy};
pub use queue::{SweepGuard, SweepReport};
pub use scheduler::{FleetStatus, Scheduler};
