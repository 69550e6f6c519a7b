//! gpufleet-store: Record storage
//!
//! This crate provides the persistence seam for gpufleet:
//! - The `Store` trait with version-checked updates
//! - An in-memory implementation
//! - The per-GPU lock table

pub mod lock;
pub mod memory;
pub mod store;

pub use lock::GpuLocks;
pub use memory::MemoryStore;
pub use store::{GpuFilter, JobFilter, JobOrder, Store};
