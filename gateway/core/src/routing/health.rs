//! Model Health Tracking
//!
//! Turns attempt records into the live metrics the scorer consumes:
//! - Success rate as an exponential moving average (→ `uptime_fraction`)
//! - Latency as an exponential moving average
//! - Queue depth, set by whoever owns the queue
//!
//! A model with no recorded attempts is left out of the snapshot, so the
//! scorer treats it as neutral rather than perfectly healthy.
//!
//! # Thread Safety
//!
//! Per-model state lives in a `DashMap`; recording and snapshotting never
//! take a global lock.

use async_trait::async_trait;
use dashmap::DashMap;

use super::fallback::{AttemptRecord, AttemptSink, SinkError};
use super::scorer::{LiveMetrics, MetricsSnapshot};

/// Default smoothing factor; higher values weight recent attempts more
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Source of live per-model metrics for routing
pub trait MetricsSource: Send + Sync {
    /// Current metrics of every observed model
    fn snapshot(&self) -> MetricsSnapshot;
}

impl MetricsSource for MetricsSnapshot {
    fn snapshot(&self) -> MetricsSnapshot {
        self.clone()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ModelHealth {
    samples: u64,
    success_ema: f64,
    latency_ema_ms: f64,
    queue_depth: u32,
}

impl ModelHealth {
    fn observe(&mut self, success: bool, latency_ms: f64, alpha: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        if self.samples == 0 {
            self.success_ema = outcome;
            self.latency_ema_ms = latency_ms;
        } else {
            self.success_ema = alpha * outcome + (1.0 - alpha) * self.success_ema;
            self.latency_ema_ms = alpha * latency_ms + (1.0 - alpha) * self.latency_ema_ms;
        }
        self.samples += 1;
    }
}

/// In-process health tracker, fed by attempt records
#[derive(Debug)]
pub struct HealthTracker {
    models: DashMap<String, ModelHealth>,
    alpha: f64,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Tracker with the default smoothing factor
    #[must_use]
    pub fn new() -> Self {
        Self::with_alpha(DEFAULT_EMA_ALPHA)
    }

    /// Tracker with a custom smoothing factor in `(0, 1]`
    #[must_use]
    pub fn with_alpha(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_EMA_ALPHA
        };
        Self {
            models: DashMap::new(),
            alpha,
        }
    }

    /// Record one attempt outcome
    pub fn observe(&self, model_id: &str, success: bool, latency_ms: u64) {
        self.models
            .entry(model_id.to_string())
            .or_default()
            .observe(success, latency_ms as f64, self.alpha);
    }

    /// Set the number of requests waiting on a model
    pub fn set_queue_depth(&self, model_id: &str, depth: u32) {
        self.models
            .entry(model_id.to_string())
            .or_default()
            .queue_depth = depth;
    }

    /// Live metrics for one model, if it has been observed
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<LiveMetrics> {
        self.models
            .get(model_id)
            .filter(|health| health.samples > 0)
            .map(|health| to_live(&health))
    }

    /// Forget everything about a model
    pub fn reset(&self, model_id: &str) {
        self.models.remove(model_id);
    }
}

fn to_live(health: &ModelHealth) -> LiveMetrics {
    LiveMetrics {
        uptime_fraction: health.success_ema,
        latency_ms: health.latency_ema_ms,
        queue_depth: health.queue_depth,
    }
}

impl MetricsSource for HealthTracker {
    fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new();
        for entry in &self.models {
            if entry.samples > 0 {
                snapshot.insert(entry.key().clone(), to_live(entry.value()));
            }
        }
        snapshot
    }
}

#[async_trait]
impl AttemptSink for HealthTracker {
    fn name(&self) -> &str {
        "health"
    }

    async fn record(&self, record: &AttemptRecord) -> Result<(), SinkError> {
        // A caller hanging up says nothing about the model
        if record.cancelled {
            return Ok(());
        }
        self.observe(&record.model_id, record.success, record.latency_ms);
        Ok(())
    }
}
