//! In-process marketplace with scripted behaviour
//!
//! Serves a fixed offer list, turns leases ready after a configurable number
//! of polls, and lets callers inject termination notices and failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpufleet_core::{
    Capabilities, FleetError, FleetResult, LeaseHandle, LeaseStatus, ProviderConfig, SpotOffer,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::provider::SpotProvider;

#[derive(Debug)]
struct SimLease {
    polls: u32,
    ready_after: u32,
    termination_notice: Option<DateTime<Utc>>,
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    offers: Vec<SpotOffer>,
    leases: HashMap<String, SimLease>,
    next_lease: u64,
    offers_error: Option<String>,
    provision_error: Option<String>,
    never_ready: bool,
    provisioned: Vec<String>,
    terminated: Vec<String>,
}

/// Scripted marketplace used by the daemon's demo mode and by tests
pub struct SimulatedMarketplace {
    name: String,
    ready_after_polls: u32,
    state: Mutex<SimState>,
}

impl SimulatedMarketplace {
    pub fn new(name: impl Into<String>, offers: Vec<SpotOffer>, ready_after_polls: u32) -> Self {
        let name = name.into();
        let offers = offers
            .into_iter()
            .map(|mut o| {
                o.provider = name.clone();
                o
            })
            .collect();
        Self {
            name,
            ready_after_polls,
            state: Mutex::new(SimState {
                offers,
                ..Default::default()
            }),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(&config.name, config.offers.clone(), config.ready_after_polls)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make offer queries fail with `message` (or succeed again with `None`)
    pub fn fail_offers(&self, message: Option<&str>) {
        self.state().offers_error = message.map(str::to_string);
    }

    /// Make provision calls fail with `message`
    pub fn fail_provisioning(&self, message: Option<&str>) {
        self.state().provision_error = message.map(str::to_string);
    }

    /// Keep new leases provisioning forever
    pub fn never_ready(&self, never: bool) {
        self.state().never_ready = never;
    }

    /// Report a reclamation notice for `lease_id`
    pub fn notify_termination(&self, lease_id: &str, at: DateTime<Utc>) {
        if let Some(lease) = self.state().leases.get_mut(lease_id) {
            lease.termination_notice = Some(at);
        }
    }

    /// Report `lease_id` as failed
    pub fn fail_lease(&self, lease_id: &str, message: &str) {
        if let Some(lease) = self.state().leases.get_mut(lease_id) {
            lease.failure = Some(message.to_string());
        }
    }

    /// Lease ids handed out so far
    pub fn provisioned(&self) -> Vec<String> {
        self.state().provisioned.clone()
    }

    /// Lease ids terminated so far
    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }
}

#[async_trait]
impl SpotProvider for SimulatedMarketplace {
    async fn offers(
        &self,
        min_memory: u64,
        capabilities: &Capabilities,
    ) -> FleetResult<Vec<SpotOffer>> {
        let state = self.state();
        if let Some(message) = &state.offers_error {
            return Err(FleetError::provider(&self.name, message.clone()));
        }
        Ok(state
            .offers
            .iter()
            .filter(|o| o.memory >= min_memory && o.capabilities.satisfies(capabilities))
            .cloned()
            .collect())
    }

    async fn provision(&self, offer: &SpotOffer) -> FleetResult<LeaseHandle> {
        let mut state = self.state();
        if let Some(message) = &state.provision_error {
            return Err(FleetError::provider(&self.name, message.clone()));
        }
        state.next_lease += 1;
        let lease_id = format!("{}-lease-{}", self.name, state.next_lease);
        let ready_after = if state.never_ready {
            u32::MAX
        } else {
            self.ready_after_polls
        };
        state.leases.insert(
            lease_id.clone(),
            SimLease {
                polls: 0,
                ready_after,
                termination_notice: None,
                failure: None,
            },
        );
        state.provisioned.push(lease_id.clone());
        info!(provider = %self.name, lease = %lease_id, instance_type = %offer.instance_type, "Simulated lease created");

        let gpu_name = if offer.gpu_name.is_empty() {
            offer.instance_type.clone()
        } else {
            offer.gpu_name.clone()
        };
        Ok(LeaseHandle {
            provider: self.name.clone(),
            lease_id,
            instance_type: offer.instance_type.clone(),
            gpu_name,
            total_memory: offer.memory,
            capabilities: offer.capabilities.clone(),
            cost_per_hour: offer.price,
            expires_at: None,
        })
    }

    async fn status(&self, lease_id: &str) -> FleetResult<LeaseStatus> {
        let mut state = self.state();
        let lease = state
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| FleetError::provider(&self.name, format!("unknown lease {}", lease_id)))?;
        lease.polls = lease.polls.saturating_add(1);

        let mut status = if let Some(error) = &lease.failure {
            LeaseStatus::failed(error.clone())
        } else if lease.polls > lease.ready_after {
            LeaseStatus::ready()
        } else {
            LeaseStatus::provisioning()
        };
        status.termination_notice = lease.termination_notice;
        Ok(status)
    }

    async fn terminate(&self, lease_id: &str) -> FleetResult<()> {
        let mut state = self.state();
        if state.leases.remove(lease_id).is_none() {
            return Err(FleetError::provider(
                &self.name,
                format!("unknown lease {}", lease_id),
            ));
        }
        state.terminated.push(lease_id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
