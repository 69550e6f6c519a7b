//! gpufleet-api: REST API server for gpufleet
//!
//! This crate provides the REST API for interacting with the scheduler:
//! - Organization registration
//! - Job submission, completion and cancellation
//! - GPU registration and listing
//! - Cost reports and fleet status

pub mod rest;

pub use rest::{create_router, error_status};
