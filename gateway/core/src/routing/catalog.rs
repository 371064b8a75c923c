//! Model Catalog
//!
//! Read-only registry of the models the gateway can route to. Built once at
//! startup, validated, then shared behind an `Arc`. There is no mutation API.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

// ============================================================================
// Capabilities
// ============================================================================

/// What a model is particularly good at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Code-specialized family
    Code,
    /// General reasoning and analysis family
    Analysis,
    /// Conversational use
    Chat,
    /// Image input
    Vision,
    /// Tool / function calling
    Tools,
    /// Large context windows
    LongContext,
}

// ============================================================================
// Model Descriptors
// ============================================================================

/// Static description of one routable model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Catalog id, unique
    pub id: String,

    /// Provider that serves it (matches a registered invoker)
    pub provider: String,

    /// Name sent to the provider, when it differs from the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_name: Option<String>,

    /// Baseline quality in [0, 1]
    pub quality_base: f64,

    /// Price per 1000 tokens
    pub cost_per_1k_tokens: f64,

    /// Typical end-to-end latency
    pub avg_latency_ms: u64,

    /// Capability flags
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Context window in tokens
    pub max_context_tokens: u32,
}

impl ModelConfig {
    /// Descriptor with neutral defaults
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            upstream_name: None,
            quality_base: 0.5,
            cost_per_1k_tokens: 0.0,
            avg_latency_ms: 1_000,
            capabilities: BTreeSet::new(),
            max_context_tokens: 8_192,
        }
    }

    /// Set baseline quality
    #[must_use]
    pub fn with_quality(mut self, quality_base: f64) -> Self {
        self.quality_base = quality_base;
        self
    }

    /// Set price per 1000 tokens
    #[must_use]
    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    /// Set typical latency
    #[must_use]
    pub fn with_latency_ms(mut self, avg_latency_ms: u64) -> Self {
        self.avg_latency_ms = avg_latency_ms;
        self
    }

    /// Set context window
    #[must_use]
    pub fn with_max_context(mut self, max_context_tokens: u32) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    /// Set the provider-side model name
    #[must_use]
    pub fn with_upstream_name(mut self, name: impl Into<String>) -> Self {
        self.upstream_name = Some(name.into());
        self
    }

    /// Add capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    /// Whether the model has a capability
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Name to send to the provider
    #[must_use]
    pub fn upstream_name(&self) -> &str {
        self.upstream_name.as_deref().unwrap_or(&self.id)
    }

    /// Price of `tokens` tokens
    #[must_use]
    pub fn cost_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1_000.0 * self.cost_per_1k_tokens
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::ValidationError(format!("model '{}': {msg}", self.id));

        if self.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "model id must not be empty".to_string(),
            ));
        }
        if self.provider.trim().is_empty() {
            return Err(invalid("provider must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.quality_base) {
            return Err(invalid(format!(
                "quality_base must be within [0, 1] (got {})",
                self.quality_base
            )));
        }
        if !self.cost_per_1k_tokens.is_finite() || self.cost_per_1k_tokens < 0.0 {
            return Err(invalid(format!(
                "cost_per_1k_tokens must be a finite, non-negative number (got {})",
                self.cost_per_1k_tokens
            )));
        }
        if self.max_context_tokens == 0 {
            return Err(invalid("max_context_tokens must be greater than zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Immutable, ordered set of model descriptors
#[derive(Clone, Debug, PartialEq)]
pub struct ModelCatalog {
    models: Vec<ModelConfig>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Validate and freeze a list of models, keeping declaration order
    pub fn new(models: Vec<ModelConfig>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(models.len());
        for (position, model) in models.iter().enumerate() {
            model.validate()?;
            if index.insert(model.id.clone(), position).is_some() {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate model id '{}' in catalog",
                    model.id
                )));
            }
        }
        Ok(Self { models, index })
    }

    /// Built-in catalog of widely available models
    #[must_use]
    pub fn default_models() -> Vec<ModelConfig> {
        use Capability::{Analysis, Chat, Code, LongContext, Tools, Vision};

        vec![
            ModelConfig::new("gpt-4o", "openai")
                .with_quality(0.92)
                .with_cost(0.005)
                .with_latency_ms(1_800)
                .with_max_context(128_000)
                .with_capabilities([Analysis, Chat, Vision, Tools, LongContext]),
            ModelConfig::new("claude-3-5-sonnet", "anthropic")
                .with_upstream_name("claude-3-5-sonnet-latest")
                .with_quality(0.93)
                .with_cost(0.003)
                .with_latency_ms(1_500)
                .with_max_context(200_000)
                .with_capabilities([Analysis, Code, Chat, Tools, LongContext]),
            ModelConfig::new("gpt-4o-mini", "openai")
                .with_quality(0.78)
                .with_cost(0.000_15)
                .with_latency_ms(900)
                .with_max_context(128_000)
                .with_capabilities([Analysis, Chat, Tools]),
            ModelConfig::new("claude-3-haiku", "anthropic")
                .with_upstream_name("claude-3-haiku-20240307")
                .with_quality(0.75)
                .with_cost(0.000_25)
                .with_latency_ms(700)
                .with_max_context(200_000)
                .with_capabilities([Analysis, Chat]),
            ModelConfig::new("qwen2.5-coder", "ollama")
                .with_upstream_name("qwen2.5-coder:7b")
                .with_quality(0.74)
                .with_latency_ms(2_200)
                .with_max_context(32_768)
                .with_capabilities([Code]),
            ModelConfig::new("llama3.1-8b", "ollama")
                .with_upstream_name("llama3.1:8b")
                .with_quality(0.68)
                .with_latency_ms(1_200)
                .with_max_context(8_192)
                .with_capabilities([Chat]),
        ]
    }

    /// Catalog of [`ModelCatalog::default_models`]
    pub fn default_catalog() -> Result<Self, ConfigError> {
        Self::new(Self::default_models())
    }

    /// Look up a model by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.index.get(id).map(|&position| &self.models[position])
    }

    /// Whether a model id is known
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of a model, used as the tie-breaker in rankings
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Models in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.iter()
    }

    /// Distinct provider names in declaration order
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for model in &self.models {
            if !seen.contains(&model.provider.as_str()) {
                seen.push(model.provider.as_str());
            }
        }
        seen
    }

    /// Number of models
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog = ModelCatalog::default_catalog().unwrap();
        assert_eq!(catalog.len(), 6);
        assert_eq!(catalog.position("gpt-4o"), Some(0));
        assert!(catalog.get("claude-3-5-sonnet").unwrap().has(Capability::Code));
        assert_eq!(catalog.providers(), vec!["openai", "anthropic", "ollama"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ModelCatalog::new(vec![
            ModelConfig::new("m", "ollama"),
            ModelConfig::new("m", "openai"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate model id 'm'"));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(ModelCatalog::new(vec![ModelConfig::new("m", "x").with_quality(1.2)]).is_err());
        assert!(ModelCatalog::new(vec![ModelConfig::new("m", "x").with_quality(f64::NAN)]).is_err());
        assert!(ModelCatalog::new(vec![ModelConfig::new("m", "x").with_cost(-0.1)]).is_err());
        assert!(ModelCatalog::new(vec![ModelConfig::new("m", "x").with_max_context(0)]).is_err());
        assert!(ModelCatalog::new(vec![ModelConfig::new(" ", "x")]).is_err());
    }

    #[test]
    fn test_upstream_name_defaults_to_id() {
        let model = ModelConfig::new("gpt-4o", "openai");
        assert_eq!(model.upstream_name(), "gpt-4o");
        let model = model.with_upstream_name("gpt-4o-2024-08-06");
        assert_eq!(model.upstream_name(), "gpt-4o-2024-08-06");
    }

    #[test]
    fn test_capabilities_deserialize_snake_case() {
        let model: ModelConfig = toml::from_str(
            r#"
            id = "m"
            provider = "ollama"
            quality_base = 0.7
            cost_per_1k_tokens = 0.0
            avg_latency_ms = 900
            capabilities = ["code", "long_context"]
            max_context_tokens = 4096
            "#,
        )
        .unwrap();
        assert!(model.has(Capability::LongContext));
        assert!(model.has(Capability::Code));
    }
}
