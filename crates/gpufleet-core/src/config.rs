//! Configuration types for gpufleet

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{GpuSpec, ModelRegistry, ModelRequirements, SpotOffer};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Queue sweep and placement configuration
    pub scheduler: SchedulerConfig,
    /// Spot provisioning configuration
    pub spot: SpotConfig,
    /// Cost metering configuration
    pub cost: CostConfig,
    /// Batch optimizer configuration
    pub batch: BatchConfig,
    /// Model table replacing the built-in registry entries
    pub models: Option<Vec<ModelRequirements>>,
    /// Entry used for models the registry does not know
    pub default_model: Option<ModelRequirements>,
    /// Organizations registered at startup
    pub organizations: Vec<OrganizationEntry>,
    /// Dedicated GPUs registered at startup
    pub gpus: Vec<GpuSpec>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::FleetError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::FleetError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::FleetError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Build the model registry from the configured table (or the built-in one)
    pub fn registry(&self) -> ModelRegistry {
        let default = self
            .default_model
            .clone()
            .unwrap_or_else(ModelRequirements::fallback);
        match &self.models {
            Some(models) => ModelRegistry::new(models.clone(), default),
            None => {
                let builtin = ModelRegistry::builtin();
                ModelRegistry::new(builtin.models().cloned().collect(), default)
            }
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Queue sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval of the recurring sweep in seconds
    pub sweep_interval_secs: u64,
    /// Interval of the rebalancing pass in seconds
    pub rebalance_interval_secs: u64,
    /// Queued jobs considered per organization per sweep
    pub sweep_limit: usize,
    /// Multiplier applied to registry memory when a job is submitted
    pub memory_overhead: f64,
    /// Job cap for GPUs registered without one
    pub default_max_jobs: u32,
    pub default_max_retries: u32,
    pub default_priority: i32,
    /// How bound jobs are run
    pub executor: ExecutorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            rebalance_interval_secs: 60,
            sweep_limit: 100,
            memory_overhead: 1.2,
            default_max_jobs: 4,
            default_max_retries: 3,
            default_priority: 50,
            executor: ExecutorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs.max(1))
    }
}

/// Execution backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Jobs finish on their own after a fixed run time
    Simulated,
    /// Nothing runs; completions arrive through the API
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    /// Run time of a simulated job in seconds
    pub run_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Simulated,
            run_secs: 30,
        }
    }
}

/// Spot provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotConfig {
    pub enabled: bool,
    /// Cap on concurrently live spot leases across the cluster
    pub max_spot_instances: u32,
    /// Hourly price ceiling for jobs that name none
    pub price_threshold: f64,
    /// Lease lifetime assumed when the provider reports no expiry
    pub lease_duration_secs: u64,
    /// Interval of the lease watch loop in seconds
    pub watch_interval_secs: u64,
    /// Provision a replacement when a lease with bound jobs fails
    pub replace_failed: bool,
    /// Job cap for spot GPUs
    pub max_jobs: u32,
    pub poll: PollConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_spot_instances: 5,
            price_threshold: 2.0,
            lease_duration_secs: 3600,
            watch_interval_secs: 60,
            replace_failed: true,
            max_jobs: 4,
            poll: PollConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl SpotConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }
}

/// Bounded exponential backoff for readiness polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 4000,
            max_backoff_ms: 30000,
        }
    }
}

impl PollConfig {
    /// Delay before poll number `attempt` (0-based): doubles, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Supported marketplace kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// sfcompute.com
    SfCompute,
    /// vast.ai
    Vast,
    /// In-process marketplace with scripted offers
    Simulated,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::SfCompute => write!(f, "sfcompute"),
            ProviderKind::Vast => write!(f, "vast"),
            ProviderKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// One configured marketplace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name; recorded on leases
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Offers served by a simulated marketplace
    #[serde(default)]
    pub offers: Vec<SpotOffer>,
    /// Polls a simulated lease stays provisioning before it is ready
    #[serde(default)]
    pub ready_after_polls: u32,
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Cost meter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub utilization_weight: f64,
    pub cost_weight: f64,
    pub throughput_weight: f64,
    /// List price per hour keyed by GPU class (matched against the GPU name)
    pub baseline_prices: BTreeMap<String, f64>,
    pub default_baseline_price: f64,
    pub baseline_jobs_per_hour: f64,
    /// Closed sessions older than this many hours are pruned
    pub retention_hours: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        let baseline_prices = [("A100", 3.0), ("A6000", 2.0), ("V100", 1.5), ("T4", 0.5)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            utilization_weight: 0.4,
            cost_weight: 0.3,
            throughput_weight: 0.3,
            baseline_prices,
            default_baseline_price: 1.0,
            baseline_jobs_per_hour: 2.0,
            retention_hours: 24 * 30,
        }
    }
}

impl CostConfig {
    /// Baseline price for a GPU by name
    pub fn baseline_price(&self, gpu_name: &str) -> f64 {
        let upper = gpu_name.to_uppercase();
        // longest class first so "A6000" wins over a shorter overlapping key
        let mut classes: Vec<_> = self.baseline_prices.iter().collect();
        classes.sort_by_key(|(class, _)| std::cmp::Reverse(class.len()));
        classes
            .into_iter()
            .find(|(class, _)| upper.contains(&class.to_uppercase()))
            .map(|(_, price)| *price)
            .unwrap_or(self.default_baseline_price)
    }
}

/// Batch optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Below this fraction of batch capacity a GPU counts as underutilized
    pub underutilized_batch_ratio: f64,
    /// Below this memory utilization a GPU counts as underutilized
    pub underutilized_memory_ratio: f64,
    /// Estimated tokens per prompt character
    pub tokens_per_char: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            underutilized_batch_ratio: 0.5,
            underutilized_memory_ratio: 0.4,
            tokens_per_char: 1.5,
        }
    }
}

/// Organization registered from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.scheduler.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.spot.max_spot_instances, 5);
        assert!(!config.spot.enabled);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let poll = PollConfig {
            max_attempts: 6,
            initial_backoff_ms: 4000,
            max_backoff_ms: 30000,
        };
        assert_eq!(poll.backoff(0), Duration::from_millis(4000));
        assert_eq!(poll.backoff(1), Duration::from_millis(8000));
        assert_eq!(poll.backoff(2), Duration::from_millis(16000));
        assert_eq!(poll.backoff(3), Duration::from_millis(30000));
        assert_eq!(poll.backoff(40), Duration::from_millis(30000));
    }

    #[test]
    fn test_baseline_price_lookup() {
        let cost = CostConfig::default();
        assert_eq!(cost.baseline_price("NVIDIA A100 80GB"), 3.0);
        assert_eq!(cost.baseline_price("nvidia rtx a6000"), 2.0);
        assert_eq!(cost.baseline_price("H100"), 1.0);
    }

    #[test]
    fn test_config_parse() {
        let toml_str = r#"
[api]
port = 8088

[scheduler]
sweep_interval_secs = 2

[scheduler.executor]
kind = "manual"

[spot]
enabled = true
max_spot_instances = 2

[[spot.providers]]
name = "sim"
kind = "simulated"

[[spot.providers.offers]]
instance_type = "a100-80g"
price = 0.9
memory = 80000
gpu_name = "A100"

[[organizations]]
id = "acme"

[[gpus]]
organization_id = "acme"
name = "RTX 4090"
total_memory = 24000
cost_per_hour = 0.4
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.port, 8088);
        assert_eq!(config.api.address, "0.0.0.0");
        assert_eq!(config.scheduler.sweep_limit, 100);
        assert_eq!(config.scheduler.executor.kind, ExecutorKind::Manual);
        assert_eq!(config.scheduler.executor.run_secs, 30);
        assert_eq!(config.spot.providers[0].kind, ProviderKind::Simulated);
        assert_eq!(config.spot.providers[0].offers[0].memory, 80000);
        assert_eq!(config.gpus[0].total_memory, 24000);
        assert!(config.registry().is_known("phi-2"));
    }
}
