//! gpufleet-core: Core types for the gpufleet scheduler
//!
//! This crate provides the fundamental types used throughout gpufleet:
//! - GPU and job records, with the job state machine
//! - Cost sessions and reports
//! - Spot marketplace exchange types
//! - The model requirement registry
//! - Configuration types
//! - Error handling

pub mod config;
pub mod cost;
pub mod error;
pub mod gpu;
pub mod job;
pub mod organization;
pub mod registry;
pub mod spot;

pub use config::*;
pub use cost::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
pub use organization::*;
pub use registry::*;
pub use spot::*;
