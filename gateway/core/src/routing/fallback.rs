//! Fallback Execution
//!
//! Drives a [`RoutingDecision`] against the backend boundary: the selected
//! model first, then fallbacks in ranked order, each under its own timeout.
//!
//! # Attempt Chain
//!
//! ```text
//! selected ──fail/timeout──► fallback 1 ──fail/timeout──► fallback 2 ──► Exhausted
//!    │                            │                            │
//!    └── success ─────────────────┴── success ─────────────────┴──► ExecutionOutcome
//! ```
//!
//! - At most `min(1 + fallbacks, max_attempts, 3)` attempts
//! - No backoff: the next candidate starts as soon as the previous one fails
//! - A timed-out attempt has its cancellation token fired and its future dropped
//! - Every attempt is reported to the attempt sinks; sink failures are logged only
//! - A cancelled caller token stops the chain

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{InvocationError, InvocationRequest, ModelInvoker};
use crate::metrics::GatewayMetrics;

use super::catalog::ModelCatalog;
use super::router::RoutingDecision;

/// Upper bound on attempts per request, whatever the configuration says
pub const HARD_ATTEMPT_CAP: u32 = 3;

/// Default per-attempt timeout
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-facing message for a request nobody could serve
pub const UNAVAILABLE_MESSAGE: &str =
    "The service is temporarily unavailable. Please try again shortly.";

// ============================================================================
// Configuration
// ============================================================================

/// Executor tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Absolute time limit of one attempt
    pub attempt_timeout: Duration,
    /// Attempts per request, capped at [`HARD_ATTEMPT_CAP`]
    pub max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_attempts: HARD_ATTEMPT_CAP,
        }
    }
}

impl ExecutorConfig {
    /// Attempts allowed for a decision with `fallbacks` fallbacks
    #[must_use]
    pub fn attempts_for(&self, fallbacks: usize) -> usize {
        let configured = self.max_attempts.clamp(1, HARD_ATTEMPT_CAP) as usize;
        (1 + fallbacks).min(configured)
    }
}

// ============================================================================
// Attempt Records
// ============================================================================

/// One attempt against one model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Correlation id
    pub request_id: String,
    /// Model tried
    pub model_id: String,
    /// 0 for the selected model, then 1, 2...
    pub attempt_index: u32,
    /// Whether the model answered
    pub success: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent on the attempt
    pub latency_ms: u64,
    /// The caller gave up before the model answered
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// Failure of an attempt sink
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("attempt sink failed: {0}")]
pub struct SinkError(pub String);

/// Receiver of attempt records (audit log, health tracker, billing...)
#[async_trait]
pub trait AttemptSink: Send + Sync {
    /// Sink name for logs
    fn name(&self) -> &str;

    /// Deliver one record
    async fn record(&self, record: &AttemptRecord) -> Result<(), SinkError>;
}

/// Sink that writes attempts to the tracing log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAttemptSink;

#[async_trait]
impl AttemptSink for TracingAttemptSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn record(&self, record: &AttemptRecord) -> Result<(), SinkError> {
        if record.success {
            tracing::info!(
                request_id = %record.request_id,
                model = %record.model_id,
                attempt = record.attempt_index,
                latency_ms = record.latency_ms,
                "Model attempt succeeded"
            );
        } else {
            tracing::warn!(
                request_id = %record.request_id,
                model = %record.model_id,
                attempt = record.attempt_index,
                latency_ms = record.latency_ms,
                error = record.error.as_deref().unwrap_or("unknown"),
                "Model attempt failed"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why one attempt failed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttemptError {
    /// The attempt exceeded its time limit
    #[error("timed out after {after_ms} ms")]
    Timeout {
        /// The limit that was hit
        after_ms: u64,
    },

    /// The backend returned an error
    #[error("backend failure: {0}")]
    Backend(InvocationError),

    /// The decision named a model the catalog does not know
    #[error("model '{0}' is not in the catalog")]
    UnknownModel(String),
}

/// Terminal execution failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Every allowed attempt failed
    #[error("all {attempts} attempts failed for request {request_id}; last error: {last_error}")]
    Exhausted {
        /// Correlation id
        request_id: String,
        /// Attempts made
        attempts: usize,
        /// Error of the final attempt
        last_error: AttemptError,
    },

    /// The caller cancelled the request
    #[error("request {request_id} cancelled by caller")]
    Cancelled {
        /// Correlation id
        request_id: String,
    },
}

impl ExecutionError {
    /// HTTP status to expose
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Exhausted { .. } => 503,
            // Client closed request
            Self::Cancelled { .. } => 499,
        }
    }

    /// Sanitized message to expose; never includes backend details
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => UNAVAILABLE_MESSAGE,
            Self::Cancelled { .. } => "The request was cancelled.",
        }
    }
}

// ============================================================================
// Requests and Outcomes
// ============================================================================

/// What to execute, independent of which model serves it
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Correlation id
    pub request_id: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
    /// The user's message
    pub user_prompt: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Cap on generated tokens
    pub max_tokens: Option<u32>,
    /// Caller-level cancellation
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    /// Request with default sampling and a fresh cancellation token
    pub fn new(request_id: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
            temperature: 0.7,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Cap generated tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Tie the request to a caller's cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A served request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    /// Correlation id
    pub request_id: String,
    /// Generated text
    pub content: String,
    /// Prompt tokens reported by the provider
    pub prompt_tokens: u64,
    /// Generated tokens
    pub completion_tokens: u64,
    /// Prompt plus completion tokens
    pub total_tokens: u64,
    /// Price of the tokens on the serving model
    pub cost: f64,
    /// Wall-clock time across all attempts
    pub duration_ms: u64,
    /// Model that actually answered
    pub served_by: String,
    /// Its provider
    pub provider: String,
    /// Model the router picked first
    pub selected_model: String,
    /// Every attempt, in order
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionOutcome {
    /// Whether a fallback answered instead of the selected model
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.served_by != self.selected_model
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Ordered-chain executor over a model invoker
pub struct FallbackExecutor {
    invoker: Arc<dyn ModelInvoker>,
    catalog: Arc<ModelCatalog>,
    config: ExecutorConfig,
    sinks: Vec<Arc<dyn AttemptSink>>,
    metrics: Arc<GatewayMetrics>,
}

impl std::fmt::Debug for FallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackExecutor")
            .field("invoker", &self.invoker.name())
            .field("config", &self.config)
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl FallbackExecutor {
    /// Executor with default configuration and no sinks
    #[must_use]
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        catalog: Arc<ModelCatalog>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            invoker,
            catalog,
            config: ExecutorConfig::default(),
            sinks: Vec::new(),
            metrics,
        }
    }

    /// Use a specific configuration
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an attempt sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the decision's candidates until one answers
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let started = Instant::now();
        let max_attempts = self.config.attempts_for(decision.fallbacks.len());
        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(max_attempts);
        let mut last_error: Option<AttemptError> = None;

        for (index, model_id) in decision.candidates().take(max_attempts).enumerate() {
            if request.cancel.is_cancelled() {
                return Err(self.cancelled(request));
            }

            let attempt_started = Instant::now();
            let result = self.attempt(model_id, request).await;
            let latency = attempt_started.elapsed();

            let result = match result {
                Some(result) => result,
                None => {
                    self.report(AttemptRecord {
                        request_id: request.request_id.clone(),
                        model_id: model_id.to_string(),
                        attempt_index: index as u32,
                        success: false,
                        error: Some("cancelled by caller".to_string()),
                        latency_ms: latency.as_millis() as u64,
                        cancelled: true,
                    })
                    .await;
                    return Err(self.cancelled(request));
                }
            };

            let record = AttemptRecord {
                request_id: request.request_id.clone(),
                model_id: model_id.to_string(),
                attempt_index: index as u32,
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                latency_ms: latency.as_millis() as u64,
                cancelled: false,
            };
            self.metrics.record_attempt(
                model_id,
                record.success,
                matches!(result, Err(AttemptError::Timeout { .. })),
                latency,
            );
            self.report(record.clone()).await;
            attempts.push(record);

            match result {
                Ok(response) => {
                    let (provider, cost) = self
                        .catalog
                        .get(model_id)
                        .map(|m| (m.provider.clone(), m.cost_for(response.total_tokens())))
                        .unwrap_or_default();
                    let duration = started.elapsed();
                    let total_tokens = response.total_tokens();
                    self.metrics
                        .record_completion(model_id, total_tokens, cost, duration);

                    if index > 0 {
                        tracing::info!(
                            request_id = %request.request_id,
                            selected = %decision.selected_model,
                            served_by = %model_id,
                            attempt = index,
                            "Request served by fallback model"
                        );
                    }

                    return Ok(ExecutionOutcome {
                        request_id: request.request_id.clone(),
                        content: response.content,
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                        total_tokens,
                        cost,
                        duration_ms: duration.as_millis() as u64,
                        served_by: model_id.to_string(),
                        provider,
                        selected_model: decision.selected_model.clone(),
                        attempts,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        model = %model_id,
                        attempt = index,
                        error = %err,
                        "Attempt failed, advancing to next candidate"
                    );
                    last_error = Some(err);
                }
            }
        }

        self.metrics.record_exhausted();
        let err = ExecutionError::Exhausted {
            request_id: request.request_id.clone(),
            attempts: attempts.len(),
            last_error: last_error.unwrap_or(AttemptError::UnknownModel(
                decision.selected_model.clone(),
            )),
        };
        tracing::error!(
            request_id = %request.request_id,
            error = %err,
            "All model attempts failed"
        );
        Err(err)
    }

    /// One attempt; `None` when the caller cancelled mid-attempt
    async fn attempt(
        &self,
        model_id: &str,
        request: &ExecutionRequest,
    ) -> Option<Result<crate::backend::InvocationResponse, AttemptError>> {
        let Some(model) = self.catalog.get(model_id) else {
            return Some(Err(AttemptError::UnknownModel(model_id.to_string())));
        };

        let mut invocation =
            InvocationRequest::new(&model.id, &model.provider, request.user_prompt.clone())
                .with_upstream_model(model.upstream_name())
                .with_temperature(request.temperature);
        invocation.system_prompt = request.system_prompt.clone();
        invocation.max_tokens = request.max_tokens;

        let attempt_cancel = request.cancel.child_token();
        let timeout = self.config.attempt_timeout;

        tokio::select! {
            biased;
            () = request.cancel.cancelled() => {
                attempt_cancel.cancel();
                None
            }
            result = tokio::time::timeout(timeout, self.invoker.invoke(&invocation, attempt_cancel.clone())) => {
                match result {
                    Ok(Ok(response)) => Some(Ok(response)),
                    Ok(Err(InvocationError::Cancelled)) if request.cancel.is_cancelled() => None,
                    Ok(Err(err)) => Some(Err(AttemptError::Backend(err))),
                    Err(_elapsed) => {
                        attempt_cancel.cancel();
                        Some(Err(AttemptError::Timeout {
                            after_ms: timeout.as_millis() as u64,
                        }))
                    }
                }
            }
        }
    }

    async fn report(&self, record: AttemptRecord) {
        for sink in &self.sinks {
            if let Err(err) = sink.record(&record).await {
                tracing::warn!(
                    sink = sink.name(),
                    request_id = %record.request_id,
                    error = %err,
                    "Attempt sink failed, continuing"
                );
            }
        }
    }

    fn cancelled(&self, request: &ExecutionRequest) -> ExecutionError {
        tracing::info!(request_id = %request.request_id, "Request cancelled by caller");
        ExecutionError::Cancelled {
            request_id: request.request_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_bound() {
        let config = ExecutorConfig::default();
        assert_eq!(config.attempts_for(0), 1);
        assert_eq!(config.attempts_for(1), 2);
        assert_eq!(config.attempts_for(7), 3);

        let one = ExecutorConfig {
            max_attempts: 1,
            ..ExecutorConfig::default()
        };
        assert_eq!(one.attempts_for(5), 1);

        let greedy = ExecutorConfig {
            max_attempts: 10,
            ..ExecutorConfig::default()
        };
        assert_eq!(greedy.attempts_for(5), HARD_ATTEMPT_CAP as usize);

        let zero = ExecutorConfig {
            max_attempts: 0,
            ..ExecutorConfig::default()
        };
        assert_eq!(zero.attempts_for(5), 1);
    }

    #[test]
    fn test_exhausted_is_sanitized_503() {
        let err = ExecutionError::Exhausted {
            request_id: "r1".to_string(),
            attempts: 3,
            last_error: AttemptError::Backend(InvocationError::Upstream {
                status: 500,
                body: "secret stack trace".to_string(),
            }),
        };
        assert_eq!(err.status_code(), 503);
        assert!(!err.public_message().contains("secret"));
        // Full detail stays available for logs
        assert!(err.to_string().contains("secret stack trace"));
    }

    #[test]
    fn test_attempt_record_serialization_skips_empty_error() {
        let record = AttemptRecord {
            request_id: "r1".to_string(),
            model_id: "m".to_string(),
            attempt_index: 0,
            success: true,
            error: None,
            latency_ms: 12,
            cancelled: false,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("cancelled").is_none());
        assert_eq!(json["attempt_index"], 0);
    }
}
