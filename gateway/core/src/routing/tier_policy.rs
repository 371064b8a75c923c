//! Tier Policy
//!
//! Which catalog models each subscription tier may be routed to. Lookups by
//! raw tier string never fail open: an unrecognized tier gets the most
//! restrictive tier's set.

use std::collections::BTreeMap;

use crate::config::ConfigError;
use crate::tier::Tier;

use super::catalog::ModelCatalog;

/// Tier → ordered, de-duplicated list of allowed model ids
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TierPolicy {
    allowed: BTreeMap<Tier, Vec<String>>,
}

impl TierPolicy {
    /// Empty policy (every tier allowed nothing)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the allowed models of a tier, dropping repeated ids
    #[must_use]
    pub fn with_tier<I, S>(mut self, tier: Tier, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_tier(tier, models);
        self
    }

    /// Set the allowed models of a tier in place
    pub fn set_tier<I, S>(&mut self, tier: Tier, models: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = Vec::new();
        for id in models {
            let id = id.into();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.allowed.insert(tier, ids);
    }

    /// Policy matching [`ModelCatalog::default_models`]
    #[must_use]
    pub fn defaults() -> Self {
        let free = ["gpt-4o-mini", "claude-3-haiku", "llama3.1-8b"];
        let basic = ["gpt-4o-mini", "claude-3-haiku", "qwen2.5-coder", "llama3.1-8b"];
        let pro = [
            "gpt-4o",
            "claude-3-5-sonnet",
            "gpt-4o-mini",
            "claude-3-haiku",
            "qwen2.5-coder",
        ];
        let enterprise = [
            "gpt-4o",
            "claude-3-5-sonnet",
            "gpt-4o-mini",
            "claude-3-haiku",
            "qwen2.5-coder",
            "llama3.1-8b",
        ];

        Self::new()
            .with_tier(Tier::Free, free)
            .with_tier(Tier::Basic, basic)
            .with_tier(Tier::Pro, pro)
            .with_tier(Tier::Enterprise, enterprise)
    }

    /// Allowed model ids for a tier, in configured order
    #[must_use]
    pub fn allowed_models(&self, tier: Tier) -> &[String] {
        self.allowed.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Allowed model ids for an untrusted tier string
    #[must_use]
    pub fn allowed_models_for(&self, raw_tier: &str) -> &[String] {
        self.allowed_models(Tier::resolve(raw_tier))
    }

    /// Whether a tier may use a model
    #[must_use]
    pub fn permits(&self, tier: Tier, model_id: &str) -> bool {
        self.allowed_models(tier).iter().any(|id| id == model_id)
    }

    /// Check that every tier has models and every id is in the catalog
    pub fn validate(&self, catalog: &ModelCatalog) -> Result<(), ConfigError> {
        for tier in Tier::ALL {
            let models = self.allowed_models(tier);
            if models.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{tier}' allows no models"
                )));
            }
            if let Some(unknown) = models.iter().find(|id| !catalog.contains(id)) {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{tier}' references unknown model '{unknown}'"
                )));
            }
        }
        Ok(())
    }
}
