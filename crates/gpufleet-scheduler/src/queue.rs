//! Per-organization sweep exclusion

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepState {
    Running,
    /// Another trigger arrived while running; run again before going idle
    RunningRerun,
}

/// Keeps sweeps of one organization from overlapping.
///
/// A trigger that arrives while a sweep is running is not dropped: the
/// running sweep makes another pass before it releases the organization.
#[derive(Default)]
pub struct SweepGuard {
    state: Mutex<HashMap<String, SweepState>>,
}

impl SweepGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the organization, or flag a rerun if it is already being swept
    pub fn try_enter(&self, organization: &str) -> Option<SweepTicket<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get_mut(organization) {
            Some(s) => {
                *s = SweepState::RunningRerun;
                None
            }
            None => {
                state.insert(organization.to_string(), SweepState::Running);
                Some(SweepTicket {
                    guard: self,
                    organization: organization.to_string(),
                    done: false,
                })
            }
        }
    }

    pub fn is_running(&self, organization: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(organization)
    }
}

/// Held by the one sweep running for an organization
pub struct SweepTicket<'a> {
    guard: &'a SweepGuard,
    organization: String,
    done: bool,
}

impl SweepTicket<'_> {
    /// True if another pass is owed; otherwise releases the organization
    pub fn should_rerun(&mut self) -> bool {
        let mut state = self.guard.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get_mut(&self.organization) {
            Some(s) if *s == SweepState::RunningRerun => {
                *s = SweepState::Running;
                true
            }
            _ => {
                state.remove(&self.organization);
                self.done = true;
                false
            }
        }
    }
}

impl Drop for SweepTicket<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut state = self.guard.state.lock().unwrap_or_else(|e| e.into_inner());
            state.remove(&self.organization);
        }
    }
}

/// Organizations with a spot provision running in the background.
///
/// At most one provision per organization is in flight; the claim is
/// released when its [`ProvisionSlot`] drops.
#[derive(Default, Clone)]
pub struct ProvisionSlots {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ProvisionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, organization: &str) -> Option<ProvisionSlot> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(organization.to_string()) {
            return None;
        }
        Some(ProvisionSlot {
            in_flight: self.in_flight.clone(),
            organization: organization.to_string(),
        })
    }

    pub fn is_claimed(&self, organization: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(organization)
    }
}

/// Owned claim on an organization's provision slot
pub struct ProvisionSlot {
    in_flight: Arc<Mutex<HashSet<String>>>,
    organization: String,
}

impl Drop for ProvisionSlot {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.organization);
    }
}

/// Result of sweeping one organization's queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub organization: String,
    pub passes: u32,
    pub considered: usize,
    pub allocated: usize,
    pub still_queued: usize,
    /// A spot provision was started for this sweep's misses
    pub spot_requested: bool,
    /// Another sweep was already running; it will pick up this trigger
    pub deferred: bool,
}

impl SweepReport {
    pub fn deferred(organization: &str) -> Self {
        Self {
            organization: organization.to_string(),
            deferred: true,
            ..Default::default()
        }
    }
}
