//! Error types for gpufleet

use crate::job::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for gpufleet
#[derive(Error, Debug)]
pub enum FleetError {
    /// Bad job/GPU spec or unknown organization; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// No GPU in the fleet can host the job right now
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// A single marketplace call failed
    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// A spot instance never became ready
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The model run raised
    #[error("Execution error: {0}")]
    Execution(String),

    /// GPU and job records disagree about their binding
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Job state machine rejected a transition
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// GPU not found
    #[error("GPU not found: {0}")]
    GpuNotFound(Uuid),

    /// Organization not found
    #[error("Organization not found: {0}")]
    OrganizationNotFound(String),

    /// Conditional update lost against a concurrent writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Spot fleet is at its lease cap
    #[error("Spot capacity reached: {0}")]
    SpotCapacity(String),

    /// GPU still has bound jobs
    #[error("GPU busy: {0}")]
    GpuBusy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpufleet operations
pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    /// Shorthand for a provider failure
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is transient and the work should simply wait for
    /// the next sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Allocation(_)
                | FleetError::Provider { .. }
                | FleetError::Provisioning(_)
                | FleetError::Conflict(_)
                | FleetError::SpotCapacity(_)
        )
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}
