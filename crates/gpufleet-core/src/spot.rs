//! Spot marketplace exchange types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Capabilities, SpotLease};

/// An offer returned by a marketplace query; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotOffer {
    /// Marketplace name the offer came from
    #[serde(default)]
    pub provider: String,
    pub instance_type: String,
    /// Hourly price
    pub price: f64,
    pub memory: u64,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub gpu_name: String,
}

/// What a marketplace hands back after a successful provision call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseHandle {
    #[serde(default)]
    pub provider: String,
    pub lease_id: String,
    pub instance_type: String,
    pub gpu_name: String,
    pub total_memory: u64,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub cost_per_hour: f64,
    /// Provider-reported end of the lease, if any
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseHandle {
    pub fn to_lease(&self) -> SpotLease {
        SpotLease {
            provider: self.provider.clone(),
            lease_id: self.lease_id.clone(),
            instance_type: self.instance_type.clone(),
        }
    }
}

/// Provider-side readiness of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Provisioning,
    Ready,
    Failed,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Provisioning => write!(f, "provisioning"),
            LeaseState::Ready => write!(f, "ready"),
            LeaseState::Failed => write!(f, "failed"),
        }
    }
}

/// Result of polling a lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub state: LeaseState,
    /// Set once the provider has scheduled the instance for reclamation
    #[serde(default)]
    pub termination_notice: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LeaseStatus {
    pub fn ready() -> Self {
        Self {
            state: LeaseState::Ready,
            termination_notice: None,
            error: None,
        }
    }

    pub fn provisioning() -> Self {
        Self {
            state: LeaseState::Provisioning,
            termination_notice: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: LeaseState::Failed,
            termination_notice: None,
            error: Some(error.into()),
        }
    }
}
