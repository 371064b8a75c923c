//! Hybrid Scorer
//!
//! Scores one model for one request on three axes, each in `[0, 1]`:
//!
//! | Axis         | Weight | Inputs                                        |
//! |--------------|--------|-----------------------------------------------|
//! | quality      | 0.4    | base quality, prompt keywords, typical latency |
//! | cost         | 0.3    | estimated tokens × price per 1k               |
//! | availability | 0.3    | live uptime, latency, queue depth             |
//!
//! Every sub-score and the final score are clamped to `[0, 1]`; NaN inputs
//! clamp to 0. Scoring is pure: the same model, prompt, token estimate and
//! metrics always give the same score.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::catalog::{Capability, ModelConfig};

/// Weight of the quality sub-score
pub const QUALITY_WEIGHT: f64 = 0.4;
/// Weight of the cost sub-score
pub const COST_WEIGHT: f64 = 0.3;
/// Weight of the availability sub-score
pub const AVAILABILITY_WEIGHT: f64 = 0.3;

/// Quality boost for a code model on a code prompt
pub const CODE_BOOST: f64 = 0.10;
/// Quality boost for an analysis model on an analysis prompt
pub const ANALYSIS_BOOST: f64 = 0.05;
/// Quality penalty for slow models
pub const SLOW_MODEL_PENALTY: f64 = 0.10;
/// Typical latency above which a model counts as slow
pub const SLOW_MODEL_LATENCY_MS: u64 = 2_000;

/// Request cost at which the cost sub-score reaches 0
pub const REFERENCE_COST: f64 = 0.01;

/// Availability assumed when no live metrics exist
pub const NEUTRAL_AVAILABILITY: f64 = 0.8;

const CODE_KEYWORDS: &[&str] = &[
    "code",
    "function",
    "debug",
    "implement",
    "refactor",
    "compile",
    "bug",
    "stack trace",
    "script",
    "python",
    "rust",
    "javascript",
    "typescript",
    "sql",
    "regex",
    "algorithm",
    "```",
];

const ANALYSIS_KEYWORDS: &[&str] = &[
    "explain",
    "analyze",
    "analyse",
    "analysis",
    "compare",
    "evaluate",
    "reasoning",
    "pros and cons",
];

/// Clamp to `[0, 1]`, mapping NaN to 0
#[must_use]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Observed health of one model
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    /// Fraction of recent calls that succeeded, in `[0, 1]`
    pub uptime_fraction: f64,
    /// Recent average latency
    pub latency_ms: f64,
    /// Requests waiting on the model
    pub queue_depth: u32,
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self {
            uptime_fraction: 1.0,
            latency_ms: 0.0,
            queue_depth: 0,
        }
    }
}

/// Live metrics for many models at one instant
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    models: HashMap<String, LiveMetrics>,
}

impl MetricsSnapshot {
    /// Empty snapshot (every model neutral)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add metrics for a model
    #[must_use]
    pub fn with(mut self, model_id: impl Into<String>, metrics: LiveMetrics) -> Self {
        self.insert(model_id, metrics);
        self
    }

    /// Add metrics for a model in place
    pub fn insert(&mut self, model_id: impl Into<String>, metrics: LiveMetrics) {
        self.models.insert(model_id.into(), metrics);
    }

    /// Metrics for a model, if any were observed
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<&LiveMetrics> {
        self.models.get(model_id)
    }

    /// Number of models with metrics
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no model has metrics
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Keyword classes found in a prompt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PromptSignals {
    /// A code keyword appears
    pub code: bool,
    /// An analysis / explanation keyword appears
    pub analysis: bool,
}

impl PromptSignals {
    /// Case-insensitive substring scan of the prompt
    #[must_use]
    pub fn detect(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        Self {
            code: CODE_KEYWORDS.iter().any(|kw| lower.contains(kw)),
            analysis: ANALYSIS_KEYWORDS.iter().any(|kw| lower.contains(kw)),
        }
    }
}

// ============================================================================
// Scores
// ============================================================================

/// Sub-scores and final score of one model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    /// Catalog id
    pub model_id: String,
    /// Quality sub-score
    pub quality: f64,
    /// Cost sub-score
    pub cost: f64,
    /// Availability sub-score
    pub availability: f64,
    /// Weighted total
    #[serde(rename = "final")]
    pub total: f64,
}

/// Multi-criteria scorer with fixed weights
#[derive(Clone, Copy, Debug, Default)]
pub struct HybridScorer;

impl HybridScorer {
    /// Create a scorer
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Quality of `model` for a prompt with the given signals
    #[must_use]
    pub fn quality(&self, model: &ModelConfig, signals: PromptSignals) -> f64 {
        let mut quality = model.quality_base;
        if signals.code && model.has(Capability::Code) {
            quality += CODE_BOOST;
        }
        if signals.analysis && model.has(Capability::Analysis) {
            quality += ANALYSIS_BOOST;
        }
        if model.avg_latency_ms > SLOW_MODEL_LATENCY_MS {
            quality -= SLOW_MODEL_PENALTY;
        }
        clamp_unit(quality)
    }

    /// Cheapness of serving `estimated_tokens` on `model`
    #[must_use]
    pub fn cost(&self, model: &ModelConfig, estimated_tokens: u64) -> f64 {
        let cost = model.cost_for(estimated_tokens);
        if cost.is_nan() {
            return 0.0;
        }
        clamp_unit(1.0 - (cost / REFERENCE_COST).min(1.0))
    }

    /// Availability from live metrics, neutral when none exist
    #[must_use]
    pub fn availability(&self, live: Option<&LiveMetrics>) -> f64 {
        let Some(live) = live else {
            return NEUTRAL_AVAILABILITY;
        };
        let uptime = clamp_unit(live.uptime_fraction);
        let mut availability = 1.0 - (1.0 - uptime) * 0.5;

        if live.latency_ms.is_nan() {
            return 0.0;
        }
        if live.latency_ms > 3_000.0 {
            availability -= 0.3;
        } else if live.latency_ms > 1_500.0 {
            availability -= 0.1;
        }
        if live.queue_depth > 100 {
            availability -= 0.2;
        }
        clamp_unit(availability)
    }

    /// All sub-scores and the weighted total
    #[must_use]
    pub fn score(
        &self,
        model: &ModelConfig,
        signals: PromptSignals,
        estimated_tokens: u64,
        live: Option<&LiveMetrics>,
    ) -> ModelScore {
        let quality = self.quality(model, signals);
        let cost = self.cost(model, estimated_tokens);
        let availability = self.availability(live);
        let total = clamp_unit(
            QUALITY_WEIGHT * quality + COST_WEIGHT * cost + AVAILABILITY_WEIGHT * availability,
        );

        ModelScore {
            model_id: model.id.clone(),
            quality,
            cost,
            availability,
            total,
        }
    }

    /// Human-readable explanation of a score, for audit display only
    #[must_use]
    pub fn reasoning(
        &self,
        model: &ModelConfig,
        score: &ModelScore,
        signals: PromptSignals,
        estimated_tokens: u64,
        live: Option<&LiveMetrics>,
    ) -> String {
        let mut clauses = vec![format!(
            "{} scored {:.3} (quality {:.2}, cost {:.2}, availability {:.2})",
            model.id, score.total, score.quality, score.cost, score.availability
        )];

        if signals.code && model.has(Capability::Code) {
            clauses.push("code-specialized model for a code prompt".to_string());
        }
        if signals.analysis && model.has(Capability::Analysis) {
            clauses.push("analysis model for an analytical prompt".to_string());
        }
        if model.avg_latency_ms > SLOW_MODEL_LATENCY_MS {
            clauses.push(format!("slow model ({} ms typical)", model.avg_latency_ms));
        }
        clauses.push(format!(
            "~{estimated_tokens} tokens at {:.5} per 1k",
            model.cost_per_1k_tokens
        ));
        match live {
            Some(live) => clauses.push(format!(
                "live uptime {:.0}%, latency {:.0} ms, queue {}",
                clamp_unit(live.uptime_fraction) * 100.0,
                live.latency_ms,
                live.queue_depth
            )),
            None => clauses.push("no live metrics, neutral availability".to_string()),
        }
        clauses.join("; ")
    }
}
