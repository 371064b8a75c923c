//! Gateway Metrics
//!
//! Lock-free counters and latency histograms for:
//! - Admission outcomes (admitted, denied, disabled, failed open)
//! - Routing decisions and configuration errors
//! - Execution attempts and terminal outcomes
//! - Per-model usage (attempts, successes, tokens, cost)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

// ============================================================================
// Histogram
// ============================================================================

/// Fixed-bucket histogram of millisecond latencies
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bucket bounds (ascending)
    #[must_use]
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to model-call latencies
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
        ])
    }

    /// Record one observation
    pub fn record(&self, value_ms: f64) {
        let value_ms = if value_ms.is_finite() { value_ms.max(0.0) } else { 0.0 };
        if let Some(idx) = self
            .bounds
            .iter()
            .position(|&b| value_ms <= b)
            .or_else(|| self.bounds.len().checked_sub(1))
        {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_ms as u64, Ordering::Relaxed);
        self.max.fetch_max(value_ms as u64, Ordering::Relaxed);
    }

    /// Record a duration
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1_000.0);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        HistogramSnapshot {
            p50_ms: percentile(&self.bounds, &counts, total, 0.5),
            p90_ms: percentile(&self.bounds, &counts, total, 0.9),
            p99_ms: percentile(&self.bounds, &counts, total, 0.99),
            max_ms: self.max.load(Ordering::Relaxed),
            mean_ms: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
            total,
        }
    }
}

/// Upper bound of the bucket holding the `p` quantile
fn percentile(bounds: &[f64], counts: &[u64], total: u64, p: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let target = ((total as f64 * p).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (bound, count) in bounds.iter().zip(counts) {
        cumulative += count;
        if cumulative >= target {
            return *bound;
        }
    }
    bounds.last().copied().unwrap_or(0.0)
}

/// Summary of a histogram
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Observations recorded
    pub total: u64,
    /// Arithmetic mean
    pub mean_ms: f64,
    /// Median bucket bound
    pub p50_ms: f64,
    /// 90th percentile bucket bound
    pub p90_ms: f64,
    /// 99th percentile bucket bound
    pub p99_ms: f64,
    /// Largest observation
    pub max_ms: u64,
}

// ============================================================================
// Counter
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Model Usage
// ============================================================================

/// Usage counters for one model
#[derive(Debug, Default)]
pub struct ModelUsage {
    attempts: Counter,
    successes: Counter,
    tokens: Counter,
    /// Cost in millionths of a currency unit
    cost_micros: Counter,
}

/// Summary of one model's usage
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModelUsageSnapshot {
    /// Attempts sent to the model
    pub attempts: u64,
    /// Attempts that succeeded
    pub successes: u64,
    /// Total tokens served
    pub tokens: u64,
    /// Derived cost
    pub cost: f64,
}

// ============================================================================
// Gateway Metrics
// ============================================================================

/// All gateway counters, shared behind an `Arc`
#[derive(Debug)]
pub struct GatewayMetrics {
    admitted: Counter,
    denied: Counter,
    disabled: Counter,
    unthrottled: Counter,
    routed: Counter,
    routing_errors: Counter,
    attempt_failures: Counter,
    attempt_timeouts: Counter,
    completions: Counter,
    exhausted: Counter,
    attempt_latency: Histogram,
    request_latency: Histogram,
    models: DashMap<String, Arc<ModelUsage>>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    /// Zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            admitted: Counter::default(),
            denied: Counter::default(),
            disabled: Counter::default(),
            unthrottled: Counter::default(),
            routed: Counter::default(),
            routing_errors: Counter::default(),
            attempt_failures: Counter::default(),
            attempt_timeouts: Counter::default(),
            completions: Counter::default(),
            exhausted: Counter::default(),
            attempt_latency: Histogram::latency_default(),
            request_latency: Histogram::latency_default(),
            models: DashMap::new(),
        }
    }

    fn model(&self, model_id: &str) -> Arc<ModelUsage> {
        if let Some(usage) = self.models.get(model_id) {
            return usage.clone();
        }
        self.models
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    /// A request passed its quota check
    pub fn record_admitted(&self) {
        self.admitted.inc();
    }

    /// A request was rejected for an exhausted quota
    pub fn record_denied(&self) {
        self.denied.inc();
    }

    /// A request hit a feature disabled for its tier
    pub fn record_disabled(&self) {
        self.disabled.inc();
    }

    /// A request bypassed quota enforcement (identity or store failure)
    pub fn record_unthrottled(&self) {
        self.unthrottled.inc();
    }

    /// The router produced a decision
    pub fn record_routed(&self) {
        self.routed.inc();
    }

    /// The router hit a configuration error
    pub fn record_routing_error(&self) {
        self.routing_errors.inc();
    }

    /// One backend attempt finished
    pub fn record_attempt(&self, model_id: &str, success: bool, timed_out: bool, latency: Duration) {
        self.attempt_latency.record_duration(latency);
        let usage = self.model(model_id);
        usage.attempts.inc();
        if success {
            usage.successes.inc();
        } else if timed_out {
            self.attempt_timeouts.inc();
        } else {
            self.attempt_failures.inc();
        }
    }

    /// A request was served
    pub fn record_completion(&self, model_id: &str, total_tokens: u64, cost: f64, duration: Duration) {
        self.completions.inc();
        self.request_latency.record_duration(duration);
        let usage = self.model(model_id);
        usage.tokens.add(total_tokens);
        if cost.is_finite() && cost > 0.0 {
            usage.cost_micros.add((cost * 1_000_000.0).round() as u64);
        }
    }

    /// Every candidate failed
    pub fn record_exhausted(&self) {
        self.exhausted.inc();
    }

    /// Point-in-time copy of everything
    #[must_use]
    pub fn snapshot(&self) -> MetricsReport {
        let models = self
            .models
            .iter()
            .map(|entry| {
                let usage = entry.value();
                (
                    entry.key().clone(),
                    ModelUsageSnapshot {
                        attempts: usage.attempts.get(),
                        successes: usage.successes.get(),
                        tokens: usage.tokens.get(),
                        cost: usage.cost_micros.get() as f64 / 1_000_000.0,
                    },
                )
            })
            .collect();

        MetricsReport {
            admitted: self.admitted.get(),
            denied: self.denied.get(),
            disabled: self.disabled.get(),
            unthrottled: self.unthrottled.get(),
            routed: self.routed.get(),
            routing_errors: self.routing_errors.get(),
            attempt_failures: self.attempt_failures.get(),
            attempt_timeouts: self.attempt_timeouts.get(),
            completions: self.completions.get(),
            exhausted: self.exhausted.get(),
            attempt_latency: self.attempt_latency.snapshot(),
            request_latency: self.request_latency.snapshot(),
            models,
        }
    }
}

/// Serializable view of [`GatewayMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    /// Requests admitted
    pub admitted: u64,
    /// Requests rejected with 429
    pub denied: u64,
    /// Requests rejected because the feature is disabled for the tier
    pub disabled: u64,
    /// Requests let through without enforcement
    pub unthrottled: u64,
    /// Routing decisions made
    pub routed: u64,
    /// Routing configuration errors
    pub routing_errors: u64,
    /// Failed attempts (not counting timeouts)
    pub attempt_failures: u64,
    /// Timed-out attempts
    pub attempt_timeouts: u64,
    /// Requests served
    pub completions: u64,
    /// Requests that exhausted every candidate
    pub exhausted: u64,
    /// Per-attempt latency
    pub attempt_latency: HistogramSnapshot,
    /// End-to-end execution latency
    pub request_latency: HistogramSnapshot,
    /// Usage by model id
    pub models: BTreeMap<String, ModelUsageSnapshot>,
}
