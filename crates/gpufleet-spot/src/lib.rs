//! gpufleet-spot: Spot capacity
//!
//! This crate provides on-demand GPU capacity from external marketplaces:
//! - The `SpotProvider` capability trait and the `Marketplace` variants
//! - An HTTP marketplace client and a simulated marketplace
//! - The provider registry
//! - The `SpotProvisioner` lifecycle and lease watch loop

pub mod http;
pub mod provider;
pub mod provisioner;
pub mod registry;
pub mod simulated;

pub use http::HttpMarketplace;
pub use provider::{Marketplace, SpotProvider};
pub use provisioner::{SpotProvisioner, SpotRequest, WatchReport};
pub use registry::ProviderRegistry;
pub use simulated::SimulatedMarketplace;
