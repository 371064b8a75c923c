//! Router
//!
//! Ranks the models a tenant's tier allows and produces a [`RoutingDecision`]:
//! the best model plus the rest in order, as fallbacks.
//!
//! # Decision Flow
//!
//! ```text
//! 1. Tier → allowed model ids (unknown tiers get the most restrictive set)
//! 2. Keep ids present in the catalog
//! 3. Score each on quality / cost / availability
//! 4. Stable sort by final score, ties keep catalog order
//! 5. Top = selected model, rest = fallbacks
//! ```
//!
//! Given the same context and metrics snapshot, routing is deterministic.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::tier::Tier;

use super::catalog::ModelCatalog;
use super::health::MetricsSource;
use super::scorer::{HybridScorer, MetricsSnapshot, ModelScore, PromptSignals};
use super::tier_policy::TierPolicy;

// ============================================================================
// Routing Context
// ============================================================================

/// Request-scoped routing inputs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingContext {
    /// Correlation id
    pub request_id: String,
    /// Caller
    pub user_id: String,
    /// Caller's resolved tier
    pub tier: Tier,
    /// Prompt text, used for keyword signals
    pub prompt: String,
    /// Approximate request size in tokens
    pub estimated_tokens: u64,
}

impl RoutingContext {
    /// Context with a fresh request id and a `ceil(chars / 4)` token estimate
    pub fn new(user_id: impl Into<String>, tier: Tier, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tier,
            estimated_tokens: estimate_tokens(&prompt),
            prompt,
        }
    }

    /// Use a specific request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Use a caller-supplied token estimate
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

/// Rough token count: one token per four characters, rounded up
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

// ============================================================================
// Routing Decision
// ============================================================================

/// Outcome of routing one request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Correlation id
    pub request_id: String,
    /// Best-scoring model
    pub selected_model: String,
    /// Its provider
    pub provider: String,
    /// Every eligible model, best first
    pub scores: Vec<ModelScore>,
    /// Why the selected model won, for audit display
    pub reasoning: String,
    /// Remaining eligible models, best first
    pub fallbacks: Vec<String>,
}

impl RoutingDecision {
    /// Selected model followed by fallbacks
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.selected_model.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Routing failures; all of them are configuration problems
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The tier allows no model that exists in the catalog
    #[error("no eligible models for tier '{tier}'")]
    NoEligibleModels {
        /// The tier being routed
        tier: Tier,
    },
}

impl RoutingError {
    /// Whether this is an operator-side configuration error
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NoEligibleModels { .. })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Tier policy + scorer → ranked decision
pub struct Router {
    catalog: Arc<ModelCatalog>,
    tiers: Arc<TierPolicy>,
    scorer: HybridScorer,
    metrics: Option<Arc<dyn MetricsSource>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("models", &self.catalog.len())
            .field("has_metrics_source", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Router without live metrics (every model neutral)
    #[must_use]
    pub fn new(catalog: Arc<ModelCatalog>, tiers: Arc<TierPolicy>) -> Self {
        Self {
            catalog,
            tiers,
            scorer: HybridScorer::new(),
            metrics: None,
        }
    }

    /// Read live metrics from `source` on every [`Router::route`]
    #[must_use]
    pub fn with_metrics_source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(source);
        self
    }

    /// The catalog being routed over
    #[must_use]
    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Route with the current metrics snapshot
    pub fn route(&self, ctx: &RoutingContext) -> Result<RoutingDecision, RoutingError> {
        let snapshot = self
            .metrics
            .as_ref()
            .map(|source| source.snapshot())
            .unwrap_or_default();
        self.route_with_snapshot(ctx, &snapshot)
    }

    /// Route against an explicit snapshot; pure and deterministic
    pub fn route_with_snapshot(
        &self,
        ctx: &RoutingContext,
        snapshot: &MetricsSnapshot,
    ) -> Result<RoutingDecision, RoutingError> {
        let signals = PromptSignals::detect(&ctx.prompt);

        let mut ranked: Vec<(usize, ModelScore)> = self
            .tiers
            .allowed_models(ctx.tier)
            .iter()
            .filter_map(|id| {
                let position = self.catalog.position(id)?;
                let model = self.catalog.get(id)?;
                let score =
                    self.scorer
                        .score(model, signals, ctx.estimated_tokens, snapshot.get(id));
                Some((position, score))
            })
            .collect();

        if ranked.is_empty() {
            let err = RoutingError::NoEligibleModels { tier: ctx.tier };
            tracing::error!(
                request_id = %ctx.request_id,
                tier = %ctx.tier,
                error = %err,
                "Routing configuration error"
            );
            return Err(err);
        }

        // Catalog order first, then a stable sort on score
        ranked.sort_by_key(|(position, _)| *position);
        ranked.sort_by(|(_, a), (_, b)| b.total.total_cmp(&a.total));

        let scores: Vec<ModelScore> = ranked.into_iter().map(|(_, score)| score).collect();
        let best = &scores[0];
        let Some(model) = self.catalog.get(&best.model_id) else {
            return Err(RoutingError::NoEligibleModels { tier: ctx.tier });
        };
        let reasoning = self.scorer.reasoning(
            model,
            best,
            signals,
            ctx.estimated_tokens,
            snapshot.get(&best.model_id),
        );

        let decision = RoutingDecision {
            request_id: ctx.request_id.clone(),
            selected_model: best.model_id.clone(),
            provider: model.provider.clone(),
            fallbacks: scores[1..].iter().map(|s| s.model_id.clone()).collect(),
            scores,
            reasoning,
        };

        tracing::debug!(
            request_id = %decision.request_id,
            tier = %ctx.tier,
            selected = %decision.selected_model,
            fallbacks = decision.fallbacks.len(),
            "Routed request"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::catalog::ModelConfig;
    use crate::routing::scorer::LiveMetrics;

    fn router() -> Router {
        Router::new(
            Arc::new(ModelCatalog::default_catalog().unwrap()),
            Arc::new(TierPolicy::defaults()),
        )
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(RoutingContext::new("u", Tier::Free, "12345678").estimated_tokens, 2);
    }

    #[test]
    fn test_decision_lists_every_eligible_model_once() {
        let router = router();
        let ctx = RoutingContext::new("u", Tier::Enterprise, "hello");
        let decision = router.route(&ctx).unwrap();

        assert_eq!(decision.scores.len(), 6);
        assert_eq!(decision.fallbacks.len(), 5);
        assert_eq!(decision.scores[0].model_id, decision.selected_model);
        assert!(!decision.fallbacks.contains(&decision.selected_model));
        assert_eq!(decision.candidates().count(), 6);
        assert!(decision
            .scores
            .windows(2)
            .all(|pair| pair[0].total >= pair[1].total));
    }

    #[test]
    fn test_ties_keep_catalog_order() {
        let catalog = ModelCatalog::new(vec![
            ModelConfig::new("first", "ollama"),
            ModelConfig::new("second", "ollama"),
            ModelConfig::new("third", "ollama"),
        ])
        .unwrap();
        let tiers = TierPolicy::new().with_tier(Tier::Free, ["third", "first", "second"]);
        let router = Router::new(Arc::new(catalog), Arc::new(tiers));

        let decision = router
            .route(&RoutingContext::new("u", Tier::Free, "hi"))
            .unwrap();
        assert_eq!(decision.selected_model, "first");
        assert_eq!(decision.fallbacks, vec!["second", "third"]);
    }

    #[test]
    fn test_unknown_policy_ids_are_skipped() {
        let catalog = ModelCatalog::new(vec![ModelConfig::new("real", "ollama")]).unwrap();
        let tiers = TierPolicy::new().with_tier(Tier::Free, ["ghost", "real"]);
        let router = Router::new(Arc::new(catalog), Arc::new(tiers));

        let decision = router
            .route(&RoutingContext::new("u", Tier::Free, "hi"))
            .unwrap();
        assert_eq!(decision.selected_model, "real");
        assert!(decision.fallbacks.is_empty());
    }

    #[test]
    fn test_no_eligible_models_is_configuration_error() {
        let catalog = ModelCatalog::new(vec![ModelConfig::new("real", "ollama")]).unwrap();
        let router = Router::new(Arc::new(catalog), Arc::new(TierPolicy::new()));

        let err = router
            .route(&RoutingContext::new("u", Tier::Pro, "hi"))
            .unwrap_err();
        assert_eq!(err, RoutingError::NoEligibleModels { tier: Tier::Pro });
        assert!(err.is_configuration());
    }

    #[test]
    fn test_live_metrics_demote_unhealthy_model() {
        let router = router();
        let ctx = RoutingContext::new("u", Tier::Free, "hello").with_request_id("r1");

        let healthy = router.route_with_snapshot(&ctx, &MetricsSnapshot::new()).unwrap();
        let sick = MetricsSnapshot::new().with(
            healthy.selected_model.clone(),
            LiveMetrics {
                uptime_fraction: 0.0,
                latency_ms: 9_000.0,
                queue_depth: 400,
            },
        );
        let demoted = router.route_with_snapshot(&ctx, &sick).unwrap();

        assert_ne!(demoted.selected_model, healthy.selected_model);
        assert_eq!(demoted.fallbacks.last(), Some(&healthy.selected_model));
    }

    #[test]
    fn test_metrics_source_is_consulted() {
        let snapshot = MetricsSnapshot::new().with(
            "llama3.1-8b",
            LiveMetrics {
                uptime_fraction: 0.0,
                latency_ms: 9_000.0,
                queue_depth: 400,
            },
        );
        let router = router().with_metrics_source(Arc::new(snapshot));
        let decision = router
            .route(&RoutingContext::new("u", Tier::Free, "hello"))
            .unwrap();
        let llama = decision
            .scores
            .iter()
            .find(|s| s.model_id == "llama3.1-8b")
            .unwrap();
        assert_eq!(llama.availability, 0.0);
    }
}
