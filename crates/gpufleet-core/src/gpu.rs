//! GPU records, capabilities and per-GPU binding bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{FleetError, FleetResult};

/// GPU lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatus {
    /// Idle and placeable
    Available,
    /// Hosting at least one job
    InUse,
    /// Spot lease requested, not ready yet
    Provisioning,
    /// Termination notice received; no new placements
    Terminating,
    /// Failed or retired
    Offline,
}

impl std::fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuStatus::Available => write!(f, "available"),
            GpuStatus::InUse => write!(f, "in_use"),
            GpuStatus::Provisioning => write!(f, "provisioning"),
            GpuStatus::Terminating => write!(f, "terminating"),
            GpuStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for GpuStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(GpuStatus::Available),
            "in_use" | "in-use" | "busy" => Ok(GpuStatus::InUse),
            "provisioning" => Ok(GpuStatus::Provisioning),
            "terminating" => Ok(GpuStatus::Terminating),
            "offline" => Ok(GpuStatus::Offline),
            other => Err(FleetError::Validation(format!("unknown GPU status: {}", other))),
        }
    }
}

/// Where a GPU comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuProvider {
    /// Owned by the organization
    Dedicated,
    /// Rented from a spot marketplace
    Spot,
}

impl std::fmt::Display for GpuProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuProvider::Dedicated => write!(f, "dedicated"),
            GpuProvider::Spot => write!(f, "spot"),
        }
    }
}

/// Capability name to value mapping (e.g. `compute_capability = "8.0"`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub BTreeMap<String, String>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every predicate in `required` against this set.
    ///
    /// Numeric requirements are minimums (a compute tier of 8.6 satisfies
    /// 8.0); anything else must match exactly.
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        required.0.iter().all(|(name, wanted)| match self.0.get(name) {
            Some(have) => match (have.parse::<f64>(), wanted.parse::<f64>()) {
                (Ok(have), Ok(wanted)) => have >= wanted,
                _ => have == wanted,
            },
            None => false,
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Capabilities {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Marketplace lease backing a spot GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotLease {
    /// Marketplace name the lease was taken from
    pub provider: String,
    /// Provider-side lease identifier
    pub lease_id: String,
    /// Provider instance type
    pub instance_type: String,
}

/// A job currently bound to a GPU and the memory it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundJob {
    pub job_id: Uuid,
    pub memory: u64,
}

/// Registration request for a dedicated GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSpec {
    pub organization_id: String,
    pub name: String,
    pub total_memory: u64,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub cost_per_hour: f64,
    #[serde(default)]
    pub max_jobs: Option<u32>,
}

/// A GPU in an organization's fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub id: Uuid,
    pub organization_id: String,
    /// Human-readable name, e.g. "NVIDIA A100 80GB"
    pub name: String,
    pub total_memory: u64,
    pub available_memory: u64,
    pub status: GpuStatus,
    pub capabilities: Capabilities,
    pub cost_per_hour: f64,
    pub provider: GpuProvider,
    /// Set for spot GPUs
    pub lease: Option<SpotLease>,
    pub termination_time: Option<DateTime<Utc>>,
    pub current_job_count: u32,
    pub max_jobs: u32,
    pub bound_jobs: Vec<BoundJob>,
    pub last_error: Option<String>,
    /// Bumped by the store on every committed update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gpu {
    /// Create a dedicated GPU from a registration request
    pub fn dedicated(spec: GpuSpec, default_max_jobs: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id: spec.organization_id,
            name: spec.name,
            total_memory: spec.total_memory,
            available_memory: spec.total_memory,
            status: GpuStatus::Available,
            capabilities: spec.capabilities,
            cost_per_hour: spec.cost_per_hour,
            provider: GpuProvider::Dedicated,
            lease: None,
            termination_time: None,
            current_job_count: 0,
            max_jobs: spec.max_jobs.unwrap_or(default_max_jobs).max(1),
            bound_jobs: Vec::new(),
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a spot GPU record in `Provisioning`
    #[allow(clippy::too_many_arguments)]
    pub fn spot(
        organization_id: String,
        name: String,
        total_memory: u64,
        capabilities: Capabilities,
        cost_per_hour: f64,
        lease: SpotLease,
        termination_time: Option<DateTime<Utc>>,
        max_jobs: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name,
            total_memory,
            available_memory: total_memory,
            status: GpuStatus::Provisioning,
            capabilities,
            cost_per_hour,
            provider: GpuProvider::Spot,
            lease: Some(lease),
            termination_time,
            current_job_count: 0,
            max_jobs: max_jobs.max(1),
            bound_jobs: Vec::new(),
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_spot(&self) -> bool {
        self.provider == GpuProvider::Spot
    }

    /// Fraction of memory held by bound jobs (0.0 - 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        (self.total_memory - self.available_memory) as f64 / self.total_memory as f64
    }

    /// Whether a scheduled termination time has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.termination_time.is_some_and(|t| now >= t)
    }

    /// Whether new jobs may be placed here at all
    pub fn is_placeable(&self, now: DateTime<Utc>) -> bool {
        let status_ok = match self.status {
            GpuStatus::Available => true,
            GpuStatus::InUse => self.current_job_count < self.max_jobs,
            _ => false,
        };
        status_ok && !self.is_expired(now)
    }

    pub fn has_job(&self, job_id: Uuid) -> bool {
        self.bound_jobs.iter().any(|b| b.job_id == job_id)
    }

    /// Charge `memory` for `job_id` against this GPU.
    ///
    /// Fails without touching the record if the job cap or the free memory
    /// would be exceeded.
    pub fn bind(&mut self, job_id: Uuid, memory: u64) -> FleetResult<()> {
        if !matches!(self.status, GpuStatus::Available | GpuStatus::InUse) {
            return Err(FleetError::Allocation(format!(
                "GPU {} is {}",
                self.id, self.status
            )));
        }
        if self.has_job(job_id) {
            return Err(FleetError::Consistency(format!(
                "job {} already bound to GPU {}",
                job_id, self.id
            )));
        }
        if self.current_job_count + 1 > self.max_jobs {
            return Err(FleetError::Allocation(format!(
                "GPU {} already hosts {} of {} jobs",
                self.id, self.current_job_count, self.max_jobs
            )));
        }
        if memory > self.available_memory {
            return Err(FleetError::Allocation(format!(
                "GPU {} has {} free, job needs {}",
                self.id, self.available_memory, memory
            )));
        }

        self.available_memory -= memory;
        self.current_job_count += 1;
        self.bound_jobs.push(BoundJob { job_id, memory });
        self.status = GpuStatus::InUse;
        Ok(())
    }

    /// Return the memory held by `job_id`.
    ///
    /// Only an `InUse` GPU drops back to `Available`; a terminating or
    /// offline GPU keeps its status.
    pub fn unbind(&mut self, job_id: Uuid) -> FleetResult<u64> {
        let pos = self
            .bound_jobs
            .iter()
            .position(|b| b.job_id == job_id)
            .ok_or_else(|| {
                FleetError::Consistency(format!("job {} is not bound to GPU {}", job_id, self.id))
            })?;

        let bound = self.bound_jobs.remove(pos);
        self.available_memory = (self.available_memory + bound.memory).min(self.total_memory);
        self.current_job_count = self.current_job_count.saturating_sub(1);
        if self.current_job_count == 0 && self.status == GpuStatus::InUse {
            self.status = GpuStatus::Available;
        }
        Ok(bound.memory)
    }

    /// Verify the memory and job-count invariants
    pub fn check_invariants(&self) -> FleetResult<()> {
        let held: u64 = self.bound_jobs.iter().map(|b| b.memory).sum();
        if self.available_memory > self.total_memory {
            return Err(FleetError::Consistency(format!(
                "GPU {} available {} exceeds total {}",
                self.id, self.available_memory, self.total_memory
            )));
        }
        if self.available_memory + held != self.total_memory {
            return Err(FleetError::Consistency(format!(
                "GPU {} available {} + held {} != total {}",
                self.id, self.available_memory, held, self.total_memory
            )));
        }
        if self.current_job_count as usize != self.bound_jobs.len()
            || self.current_job_count > self.max_jobs
        {
            return Err(FleetError::Consistency(format!(
                "GPU {} job count {} (bound {}, max {})",
                self.id,
                self.current_job_count,
                self.bound_jobs.len(),
                self.max_jobs
            )));
        }
        Ok(())
    }
}
