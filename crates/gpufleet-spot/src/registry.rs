//! Name-keyed registry of configured marketplaces

use gpufleet_core::{FleetError, FleetResult, ProviderConfig, ProviderKind};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::http::{HttpMarketplace, SFCOMPUTE_API_URL, VAST_API_URL};
use crate::provider::Marketplace;
use crate::simulated::SimulatedMarketplace;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Marketplace>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured marketplace
    pub fn from_config(configs: &[ProviderConfig]) -> FleetResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            let market = match config.kind {
                ProviderKind::SfCompute => Marketplace::SfCompute(Arc::new(
                    HttpMarketplace::from_config(config, SFCOMPUTE_API_URL)?,
                )),
                ProviderKind::Vast => Marketplace::VastAi(Arc::new(HttpMarketplace::from_config(
                    config,
                    VAST_API_URL,
                )?)),
                ProviderKind::Simulated => {
                    Marketplace::Simulated(Arc::new(SimulatedMarketplace::from_config(config)))
                }
            };
            registry.register(&config.name, market)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, market: Marketplace) -> FleetResult<()> {
        if self.providers.contains_key(name) {
            return Err(FleetError::Config(format!(
                "duplicate spot provider name: {}",
                name
            )));
        }
        self.providers.insert(name.to_string(), market);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Marketplace> {
        self.providers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Marketplace)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind,
            api_url: None,
            api_key_env: None,
            request_timeout_secs: 5,
            offers: Vec::new(),
            ready_after_polls: 0,
        }
    }

    #[test]
    fn test_from_config() {
        let registry = ProviderRegistry::from_config(&[
            provider("sfc", ProviderKind::SfCompute),
            provider("vast", ProviderKind::Vast),
            provider("sim", ProviderKind::Simulated),
        ])
        .unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("vast").map(|m| m.kind()), Some("vast"));
        assert_eq!(registry.get("sim").map(|m| m.kind()), Some("simulated"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ProviderRegistry::from_config(&[
            provider("sim", ProviderKind::Simulated),
            provider("sim", ProviderKind::Simulated),
        ]);
        assert!(matches!(result, Err(FleetError::Config(_))));
    }
}
