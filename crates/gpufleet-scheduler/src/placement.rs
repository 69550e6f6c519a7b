//! Job placement decisions

use chrono::{DateTime, Utc};
use gpufleet_core::{Capabilities, Gpu};
use uuid::Uuid;

/// A candidate GPU for a job
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementDecision {
    pub gpu_id: Uuid,
    /// Free memory left on the GPU after placement
    pub leftover_memory: u64,
    pub cost_per_hour: f64,
}

/// Whether `gpu` can take a job needing `memory` and `capabilities` right now
pub fn is_eligible(gpu: &Gpu, memory: u64, capabilities: &Capabilities, now: DateTime<Utc>) -> bool {
    gpu.is_placeable(now)
        && gpu.available_memory >= memory
        && gpu.capabilities.satisfies(capabilities)
}

/// Strategy for ordering candidate GPUs
pub trait PlacementStrategy: Send + Sync {
    /// Eligible GPUs in the order they should be tried
    fn rank(
        &self,
        memory: u64,
        capabilities: &Capabilities,
        gpus: &[Gpu],
        now: DateTime<Utc>,
    ) -> Vec<PlacementDecision>;
}

/// Best fit: smallest leftover memory first, then cheapest
pub struct BestFitStrategy;

impl PlacementStrategy for BestFitStrategy {
    fn rank(
        &self,
        memory: u64,
        capabilities: &Capabilities,
        gpus: &[Gpu],
        now: DateTime<Utc>,
    ) -> Vec<PlacementDecision> {
        let mut decisions: Vec<PlacementDecision> = gpus
            .iter()
            .filter(|g| is_eligible(g, memory, capabilities, now))
            .map(|g| PlacementDecision {
                gpu_id: g.id,
                leftover_memory: g.available_memory - memory,
                cost_per_hour: g.cost_per_hour,
            })
            .collect();

        decisions.sort_by(|a, b| {
            a.leftover_memory
                .cmp(&b.leftover_memory)
                .then(a.cost_per_hour.total_cmp(&b.cost_per_hour))
                .then(a.gpu_id.cmp(&b.gpu_id))
        });
        decisions
    }
}
