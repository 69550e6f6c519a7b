//! Model requirement registry
//!
//! Static lookup from model name to the memory, capability and batching
//! profile a job for that model needs. Unknown models resolve to a default
//! entry instead of failing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Capabilities;

/// Workload shape, drives how batch footprints are estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Footprint scales with estimated token count
    Text,
    /// Footprint scales with image count; batches are uniform
    Image,
}

/// Batching characteristics of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProfile {
    pub supports_batching: bool,
    /// Memory to hold the weights once, shared by the whole batch
    pub base_memory: u64,
    /// Memory per token (text) or per image (image)
    pub memory_per_unit: f64,
    /// Score penalty applied in proportion to batch non-uniformity
    pub padding_penalty: f64,
}

/// Requirements for running one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequirements {
    pub name: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default = "default_kind")]
    pub kind: ModelKind,
    pub min_memory: u64,
    pub preferred_memory: u64,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    pub cost_per_hour: f64,
    #[serde(default)]
    pub batching: Option<BatchProfile>,
}

fn default_model_type() -> String {
    "llm".to_string()
}

fn default_kind() -> ModelKind {
    ModelKind::Text
}

fn default_max_batch_size() -> u32 {
    1
}

impl ModelRequirements {
    /// Fallback profile for models the registry does not know
    pub fn fallback() -> Self {
        Self {
            name: "default".to_string(),
            model_type: default_model_type(),
            kind: ModelKind::Text,
            min_memory: 8000,
            preferred_memory: 12000,
            capabilities: Capabilities::new(),
            max_batch_size: 1,
            cost_per_hour: 0.30,
            batching: None,
        }
    }

    pub fn supports_batching(&self) -> bool {
        self.batching.as_ref().is_some_and(|b| b.supports_batching)
    }
}

/// Name-keyed registry with a default entry
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelRequirements>,
    default: ModelRequirements,
}

impl ModelRegistry {
    /// Create a registry from explicit entries
    pub fn new(models: Vec<ModelRequirements>, default: ModelRequirements) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
            default,
        }
    }

    /// The built-in model table
    pub fn builtin() -> Self {
        let models = vec![
            ModelRequirements {
                name: "phi-2".to_string(),
                model_type: "llm".to_string(),
                kind: ModelKind::Text,
                min_memory: 16000,
                preferred_memory: 24000,
                capabilities: Capabilities::new().with("compute_capability", "8.0"),
                max_batch_size: 4,
                cost_per_hour: 0.60,
                batching: Some(BatchProfile {
                    supports_batching: true,
                    base_memory: 16000,
                    memory_per_unit: 0.5,
                    padding_penalty: 0.1,
                }),
            },
            ModelRequirements {
                name: "deepseek-coder".to_string(),
                model_type: "llm".to_string(),
                kind: ModelKind::Text,
                min_memory: 24000,
                preferred_memory: 32000,
                capabilities: Capabilities::new().with("compute_capability", "8.0"),
                max_batch_size: 2,
                cost_per_hour: 0.90,
                batching: Some(BatchProfile {
                    supports_batching: true,
                    base_memory: 24000,
                    memory_per_unit: 1.0,
                    padding_penalty: 0.15,
                }),
            },
            ModelRequirements {
                name: "stable-diffusion-xl".to_string(),
                model_type: "stable-diffusion".to_string(),
                kind: ModelKind::Image,
                min_memory: 12000,
                preferred_memory: 16000,
                capabilities: Capabilities::new().with("compute_capability", "7.5"),
                max_batch_size: 4,
                cost_per_hour: 0.45,
                batching: Some(BatchProfile {
                    supports_batching: true,
                    base_memory: 12000,
                    memory_per_unit: 3000.0,
                    padding_penalty: 0.05,
                }),
            },
        ];
        Self::new(models, ModelRequirements::fallback())
    }

    /// Look up a model, falling back to the default entry
    pub fn lookup(&self, model_name: &str) -> &ModelRequirements {
        self.models.get(model_name).unwrap_or(&self.default)
    }

    pub fn is_known(&self, model_name: &str) -> bool {
        self.models.contains_key(model_name)
    }

    /// Memory a job needs: `min_memory * batch_size * overhead`, rounded up
    pub fn memory_required(&self, model_name: &str, batch_size: u32, overhead: f64) -> u64 {
        let reqs = self.lookup(model_name);
        let raw = reqs.min_memory as f64 * batch_size.max(1) as f64 * overhead;
        raw.ceil() as u64
    }

    /// Known model entries
    pub fn models(&self) -> impl Iterator<Item = &ModelRequirements> {
        self.models.values()
    }

    pub fn default_entry(&self) -> &ModelRequirements {
        &self.default
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_and_fallback() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.lookup("phi-2").min_memory, 16000);
        assert!(registry.is_known("deepseek-coder"));

        let unknown = registry.lookup("mystery-model");
        assert_eq!(unknown.name, "default");
        assert_eq!(unknown.min_memory, 8000);
        assert!(!unknown.supports_batching());
    }

    #[test]
    fn test_memory_required_applies_overhead() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.memory_required("phi-2", 1, 1.2), 19200);
        assert_eq!(registry.memory_required("stable-diffusion-xl", 2, 1.2), 28800);
        assert_eq!(registry.memory_required("unknown", 1, 1.0), 8000);
        // batch size zero is treated as one
        assert_eq!(registry.memory_required("unknown", 0, 1.0), 8000);
    }

    #[test]
    fn test_custom_entries_parse_from_toml() {
        let toml_str = r#"
name = "llama3-8b"
min_memory = 10000
preferred_memory = 16000
max_batch_size = 8
cost_per_hour = 0.5

[capabilities]
compute_capability = "8.0"

[batching]
supports_batching = true
base_memory = 10000
memory_per_unit = 0.25
padding_penalty = 0.1
"#;
        let entry: ModelRequirements = toml::from_str(toml_str).unwrap();
        assert_eq!(entry.kind, ModelKind::Text);
        assert!(entry.supports_batching());

        let registry = ModelRegistry::new(vec![entry], ModelRequirements::fallback());
        assert_eq!(registry.lookup("llama3-8b").max_batch_size, 8);
    }
}
