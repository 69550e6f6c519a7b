//! Per-GPU mutual exclusion

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Table of async mutexes keyed by GPU id.
///
/// Every read-modify-write of a GPU record (bind, release, lease watch,
/// termination) runs while holding that GPU's guard. Operations on
/// different GPUs never contend.
#[derive(Default)]
pub struct GpuLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl GpuLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, gpu_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(gpu_id).or_default().clone()
    }

    /// Wait for exclusive access to `gpu_id`
    pub async fn lock(&self, gpu_id: Uuid) -> OwnedMutexGuard<()> {
        self.entry(gpu_id).lock_owned().await
    }

    /// Take the guard only if nobody holds it
    pub fn try_lock(&self, gpu_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.entry(gpu_id).try_lock_owned().ok()
    }

    /// Drop the table entry for a deleted GPU
    pub fn forget(&self, gpu_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&gpu_id);
    }
}
