//! Batch optimizer
//!
//! Picks the best contiguous window of queued jobs for one model to pack onto
//! an underused GPU. Windows are taken over the queue ordered by urgency
//! (`priority * (1 + age_hours)`) and scored by urgency, batch fill, and
//! how uniform the jobs' workloads are.

use chrono::{DateTime, Utc};
use gpufleet_core::{BatchConfig, Gpu, Job, ModelKind, ModelRegistry, ModelRequirements};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::placement::is_eligible;

/// A window chosen for one GPU
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWindow {
    pub model_name: String,
    /// Jobs in queue order with the memory each is charged
    pub charges: Vec<(Uuid, u64)>,
    pub footprint: u64,
    pub score: f64,
}

impl BatchWindow {
    pub fn len(&self) -> usize {
        self.charges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charges.is_empty()
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.charges.iter().map(|(id, _)| *id).collect()
    }
}

pub fn urgency(job: &Job, now: DateTime<Utc>) -> f64 {
    job.priority as f64 * (1.0 + job.age_hours(now))
}

pub struct BatchOptimizer {
    config: BatchConfig,
}

impl BatchOptimizer {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Estimated work units: tokens for text models, images for image models
    pub fn units(&self, job: &Job, reqs: &ModelRequirements) -> u64 {
        match reqs.kind {
            ModelKind::Text => {
                (job.prompt.chars().count() as f64 * self.config.tokens_per_char).ceil() as u64
            }
            ModelKind::Image => job.batch_size.max(1) as u64,
        }
    }

    /// Memory a batch of `jobs` needs: shared base plus per-unit cost
    pub fn footprint(&self, jobs: &[&Job], reqs: &ModelRequirements) -> u64 {
        let Some(profile) = &reqs.batching else {
            return jobs.iter().map(|j| j.memory_required).sum();
        };
        let per_unit: f64 = jobs
            .iter()
            .map(|j| self.units(j, reqs) as f64 * profile.memory_per_unit)
            .sum();
        profile.base_memory + per_unit.ceil() as u64
    }

    /// 1.0 for identical workloads, falling with their coefficient of variation
    pub fn uniformity(&self, jobs: &[&Job], reqs: &ModelRequirements) -> f64 {
        if reqs.kind == ModelKind::Image || jobs.len() < 2 {
            return 1.0;
        }
        let lengths: Vec<f64> = jobs.iter().map(|j| self.units(j, reqs) as f64).collect();
        let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
        if mean == 0.0 {
            return 1.0;
        }
        let variance =
            lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64;
        (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
    }

    /// Best window of `jobs` (all one model) fitting in `available_memory`
    /// and at most `slots` jobs.
    pub fn best_window(
        &self,
        jobs: &[Job],
        reqs: &ModelRequirements,
        available_memory: u64,
        slots: usize,
        now: DateTime<Utc>,
    ) -> Option<BatchWindow> {
        if slots == 0 || jobs.is_empty() {
            return None;
        }
        let mut ordered: Vec<&Job> = jobs.iter().collect();
        ordered.sort_by(|a, b| {
            urgency(b, now)
                .total_cmp(&urgency(a, now))
                .then(a.submitted_at.cmp(&b.submitted_at))
        });

        if !reqs.supports_batching() {
            return ordered
                .into_iter()
                .find(|j| j.memory_required <= available_memory)
                .map(|j| BatchWindow {
                    model_name: j.model_name.clone(),
                    charges: vec![(j.id, j.memory_required)],
                    footprint: j.memory_required,
                    score: urgency(j, now),
                });
        }

        let max_batch = (reqs.max_batch_size.max(1) as usize).min(slots);
        let mut best: Option<BatchWindow> = None;
        for start in 0..ordered.len() {
            for size in 1..=max_batch {
                let Some(window) = ordered.get(start..start + size) else {
                    break;
                };
                let footprint = self.footprint(window, reqs);
                if footprint > available_memory {
                    continue;
                }
                let score = self.score(window, reqs, now);
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(BatchWindow {
                        model_name: reqs.name.clone(),
                        charges: self.charges(window, reqs, footprint),
                        footprint,
                        score,
                    });
                }
            }
        }
        best
    }

    fn score(&self, window: &[&Job], reqs: &ModelRequirements, now: DateTime<Utc>) -> f64 {
        let total_urgency: f64 = window.iter().map(|j| urgency(j, now)).sum();
        let fill = 1.0 + window.len() as f64 / reqs.max_batch_size.max(1) as f64;
        let penalty = reqs.batching.as_ref().map_or(0.0, |b| b.padding_penalty);
        total_urgency * fill * (1.0 - penalty * (1.0 - self.uniformity(window, reqs)))
    }

    /// Split `footprint` across the window: each job pays its units plus an
    /// even share of the base, the first job absorbing rounding.
    fn charges(&self, window: &[&Job], reqs: &ModelRequirements, footprint: u64) -> Vec<(Uuid, u64)> {
        let per_unit = reqs.batching.as_ref().map_or(0.0, |b| b.memory_per_unit);
        let mut charges: Vec<(Uuid, u64)> = window
            .iter()
            .map(|j| {
                let units = (self.units(j, reqs) as f64 * per_unit).floor() as u64;
                (j.id, units)
            })
            .collect();
        let unit_total: u64 = charges.iter().map(|(_, c)| c).sum();
        let shared = footprint.saturating_sub(unit_total);
        let share = shared / charges.len() as u64;
        let remainder = shared - share * charges.len() as u64;
        for (i, (_, charge)) in charges.iter_mut().enumerate() {
            *charge += share + if i == 0 { remainder } else { 0 };
        }
        charges
    }

    /// Best window across every model queued for `gpu`'s organization
    pub fn select(
        &self,
        queued: &[Job],
        registry: &ModelRegistry,
        gpu: &Gpu,
        now: DateTime<Utc>,
    ) -> Option<BatchWindow> {
        let slots = gpu.max_jobs.saturating_sub(gpu.current_job_count) as usize;
        let mut by_model: BTreeMap<&str, Vec<Job>> = BTreeMap::new();
        for job in queued.iter().filter(|j| j.organization_id == gpu.organization_id) {
            by_model.entry(job.model_name.as_str()).or_default().push(job.clone());
        }

        by_model
            .into_iter()
            .filter_map(|(model, jobs)| {
                let reqs = registry.lookup(model);
                if !is_eligible(gpu, 0, &reqs.capabilities, now) {
                    return None;
                }
                self.best_window(&jobs, reqs, gpu.available_memory, slots, now)
                    .map(|mut w| {
                        w.model_name = model.to_string();
                        w
                    })
            })
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    /// Whether `gpu` has room worth filling
    pub fn is_underutilized(&self, gpu: &Gpu) -> bool {
        gpu.current_job_count == 0
            || (gpu.current_job_count as f64)
                < self.config.underutilized_batch_ratio * gpu.max_jobs as f64
            || gpu.memory_utilization() < self.config.underutilized_memory_ratio
    }
}

impl Default for BatchOptimizer {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gpufleet_core::{Capabilities, GpuSpec, JobSpec};

    fn text_job(priority: i32, prompt: &str) -> Job {
        let mut spec = JobSpec::new("acme", "phi-2");
        spec.prompt = prompt.to_string();
        Job::queued(spec, "llm".to_string(), priority, 19200, 3)
    }

    fn gpu(total: u64, max_jobs: u32) -> Gpu {
        Gpu::dedicated(
            GpuSpec {
                organization_id: "acme".to_string(),
                name: "A100".to_string(),
                total_memory: total,
                capabilities: Capabilities::new().with("compute_capability", "8.0"),
                cost_per_hour: 1.0,
                max_jobs: Some(max_jobs),
            },
            4,
        )
    }

    #[test]
    fn test_urgency_grows_with_age() {
        let now = Utc::now();
        let mut job = text_job(10, "hi");
        assert!((urgency(&job, now) - 10.0).abs() < 0.01);
        job.submitted_at = now - Duration::hours(2);
        assert!((urgency(&job, now) - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_uniformity() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let reqs = registry.lookup("phi-2");

        let a = text_job(10, "abcd");
        let b = text_job(10, "abcd");
        assert_eq!(optimizer.uniformity(&[&a, &b], reqs), 1.0);

        let short = text_job(10, "a");
        let long = text_job(10, &"a".repeat(100));
        assert!(optimizer.uniformity(&[&short, &long], reqs) < 0.1);

        let sdxl = registry.lookup("stable-diffusion-xl");
        assert_eq!(optimizer.uniformity(&[&short, &long], sdxl), 1.0);
    }

    #[test]
    fn test_window_never_exceeds_available_memory() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let reqs = registry.lookup("phi-2");
        let now = Utc::now();
        let jobs: Vec<Job> = (0..6)
            .map(|i| text_job(10 + i, &"x".repeat(200 * (i as usize + 1))))
            .collect();

        for available in [15000, 16200, 16500, 17000, 20000] {
            if let Some(window) = optimizer.best_window(&jobs, reqs, available, 4, now) {
                assert!(window.footprint <= available);
                let charged: u64 = window.charges.iter().map(|(_, c)| c).sum();
                assert_eq!(charged, window.footprint);
            }
        }
        assert!(optimizer.best_window(&jobs, reqs, 15000, 4, now).is_none());
    }

    #[test]
    fn test_full_window_wins_when_it_fits() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let reqs = registry.lookup("phi-2");
        let jobs: Vec<Job> = (0..4).map(|_| text_job(10, "same prompt")).collect();

        let window = optimizer
            .best_window(&jobs, reqs, 48000, 4, Utc::now())
            .unwrap();
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_slots_cap_window_size() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let reqs = registry.lookup("phi-2");
        let jobs: Vec<Job> = (0..4).map(|_| text_job(10, "same prompt")).collect();

        let window = optimizer
            .best_window(&jobs, reqs, 48000, 2, Utc::now())
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_non_batching_model_falls_back_to_single_job() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let reqs = registry.lookup("unknown-model");
        let mut low = text_job(10, "a");
        low.model_name = "unknown-model".to_string();
        low.memory_required = 8000;
        let mut high = low.clone();
        high.id = Uuid::new_v4();
        high.priority = 90;

        let window = optimizer
            .best_window(&[low, high.clone()], reqs, 16000, 4, Utc::now())
            .unwrap();
        assert_eq!(window.job_ids(), vec![high.id]);
        assert_eq!(window.footprint, 8000);
    }

    #[test]
    fn test_select_respects_capabilities() {
        let optimizer = BatchOptimizer::default();
        let registry = ModelRegistry::builtin();
        let mut old_gpu = gpu(48000, 4);
        old_gpu.capabilities = Capabilities::new().with("compute_capability", "7.0");
        let jobs = vec![text_job(10, "hello")];

        assert!(optimizer
            .select(&jobs, &registry, &old_gpu, Utc::now())
            .is_none());
        assert!(optimizer
            .select(&jobs, &registry, &gpu(48000, 4), Utc::now())
            .is_some());
    }

    #[test]
    fn test_underutilized() {
        let optimizer = BatchOptimizer::default();
        let mut g = gpu(16000, 4);
        assert!(optimizer.is_underutilized(&g));

        g.bind(Uuid::new_v4(), 7000).unwrap();
        g.bind(Uuid::new_v4(), 7000).unwrap();
        assert!(!optimizer.is_underutilized(&g));

        let mut light = gpu(16000, 2);
        light.bind(Uuid::new_v4(), 1000).unwrap();
        light.bind(Uuid::new_v4(), 1000).unwrap();
        assert!(optimizer.is_underutilized(&light));
    }
}
