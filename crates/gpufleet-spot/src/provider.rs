//! Spot provider trait and the marketplace variants

use async_trait::async_trait;
use gpufleet_core::{Capabilities, FleetResult, LeaseHandle, LeaseStatus, SpotOffer};
use std::sync::Arc;

use crate::http::HttpMarketplace;
use crate::simulated::SimulatedMarketplace;

/// Capability interface every marketplace implements
#[async_trait]
pub trait SpotProvider: Send + Sync {
    /// Offers with at least `min_memory` that satisfy `capabilities`
    async fn offers(
        &self,
        min_memory: u64,
        capabilities: &Capabilities,
    ) -> FleetResult<Vec<SpotOffer>>;

    /// Rent the instance behind `offer`
    async fn provision(&self, offer: &SpotOffer) -> FleetResult<LeaseHandle>;

    /// Poll readiness and termination notices for a lease
    async fn status(&self, lease_id: &str) -> FleetResult<LeaseStatus>;

    /// Release a lease
    async fn terminate(&self, lease_id: &str) -> FleetResult<()>;

    /// Configured provider name
    fn name(&self) -> &str;
}

/// The supported marketplaces
#[derive(Clone)]
pub enum Marketplace {
    SfCompute(Arc<HttpMarketplace>),
    VastAi(Arc<HttpMarketplace>),
    Simulated(Arc<SimulatedMarketplace>),
}

impl Marketplace {
    fn inner(&self) -> &dyn SpotProvider {
        match self {
            Marketplace::SfCompute(m) | Marketplace::VastAi(m) => m.as_ref(),
            Marketplace::Simulated(m) => m.as_ref(),
        }
    }

    /// Marketplace kind, for logs and status output
    pub fn kind(&self) -> &'static str {
        match self {
            Marketplace::SfCompute(_) => "sfcompute",
            Marketplace::VastAi(_) => "vast",
            Marketplace::Simulated(_) => "simulated",
        }
    }
}

#[async_trait]
impl SpotProvider for Marketplace {
    async fn offers(
        &self,
        min_memory: u64,
        capabilities: &Capabilities,
    ) -> FleetResult<Vec<SpotOffer>> {
        self.inner().offers(min_memory, capabilities).await
    }

    async fn provision(&self, offer: &SpotOffer) -> FleetResult<LeaseHandle> {
        self.inner().provision(offer).await
    }

    async fn status(&self, lease_id: &str) -> FleetResult<LeaseStatus> {
        self.inner().status(lease_id).await
    }

    async fn terminate(&self, lease_id: &str) -> FleetResult<()> {
        self.inner().terminate(lease_id).await
    }

    fn name(&self) -> &str {
        self.inner().name()
    }
}
