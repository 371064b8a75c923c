//! Gateway - The Composition Root
//!
//! Wires admission, routing and execution into one request path:
//!
//! ```text
//! ChatRequest
//!     │
//!     ▼
//! AdmissionMiddleware ── denied ──► AdmissionResponse::Rejected (429)
//!     │ admitted / unthrottled
//!     ▼
//! Router ── no eligible models ──► GatewayError::Configuration (500)
//!     │ RoutingDecision
//!     ▼
//! FallbackExecutor ── exhausted ──► GatewayError::Unavailable (503)
//!     │
//!     ▼
//! ChatCompletion + quota metadata
//! ```
//!
//! Every collaborator is constructed explicitly by [`GatewayBuilder`]; nothing
//! is looked up from global state.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::admission::{
    AdmissionMiddleware, AdmissionResponse, Identity, IdentityResolver, InboundRequest,
    TrustedFieldResolver,
};
use crate::backend::ModelInvoker;
use crate::config::{ConfigError, GatewayConfig, QuotaSettings};
use crate::metrics::{GatewayMetrics, MetricsReport};
use crate::quota::{
    Clock, EndpointKind, QuotaStore, RateLimitPolicy, StorageBackendKind, TokenBucket,
};
use crate::routing::{
    AttemptSink, ExecutionError, ExecutionOutcome, ExecutionRequest, ExecutorConfig,
    FallbackExecutor, HealthTracker, MetricsSnapshot, MetricsSource, ModelCatalog, ModelConfig,
    Router, RoutingContext, RoutingDecision, RoutingError, TierPolicy, TracingAttemptSink,
    HARD_ATTEMPT_CAP,
};
use crate::tier::Tier;

/// User id used for routing when the caller could not be identified
pub const ANONYMOUS_USER: &str = "anonymous";

// =============================================================================
// Requests and Responses
// =============================================================================

/// A chat request entering the gateway
#[derive(Clone, Debug)]
pub struct ChatRequest {
    /// Identity and endpoint fields for admission
    pub inbound: InboundRequest,
    /// The user's message
    pub prompt: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Cap on generated tokens
    pub max_tokens: Option<u32>,
    /// Fired when the caller goes away
    pub cancel: CancellationToken,
}

impl ChatRequest {
    /// Request with default sampling
    pub fn new(inbound: InboundRequest, prompt: impl Into<String>) -> Self {
        Self {
            inbound,
            prompt: prompt.into(),
            system_prompt: None,
            temperature: None,
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
        self.temperature = Some(temperature);
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

/// A served chat request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatCompletion {
    /// How the request was routed
    pub decision: RoutingDecision,
    /// What the serving model returned
    pub outcome: ExecutionOutcome,
}

/// Gateway failures after admission
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Tier or catalog misconfiguration
    #[error("gateway misconfigured: {0}")]
    Configuration(#[from] RoutingError),

    /// No candidate model could serve the request
    #[error("{0}")]
    Unavailable(ExecutionError),

    /// The caller went away before the request finished
    #[error("request {request_id} cancelled")]
    Cancelled {
        /// Correlation id
        request_id: String,
    },
}

impl From<ExecutionError> for GatewayError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Cancelled { request_id } => Self::Cancelled { request_id },
            other @ ExecutionError::Exhausted { .. } => Self::Unavailable(other),
        }
    }
}

impl GatewayError {
    /// HTTP status to expose
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 500,
            Self::Unavailable(err) => err.status_code(),
            Self::Cancelled { .. } => 499,
        }
    }

    /// Sanitized message to expose
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "The service is not configured to serve this request.",
            Self::Unavailable(err) => err.public_message(),
            Self::Cancelled { .. } => "The request was cancelled.",
        }
    }
}

/// Point-in-time view of the gateway for operators
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GatewayStats {
    /// Where quota state is kept right now
    pub storage_backend: StorageBackendKind,
    /// Counters and latency histograms
    pub metrics: MetricsReport,
    /// Live health of every observed model
    pub health: MetricsSnapshot,
}

// =============================================================================
// Gateway
// =============================================================================

/// Admission → routing → execution for multi-tenant chat traffic
pub struct Gateway {
    admission: AdmissionMiddleware,
    router: Router,
    executor: FallbackExecutor,
    health: Arc<HealthTracker>,
    metrics: Arc<GatewayMetrics>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("admission", &self.admission)
            .field("router", &self.router)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start building a gateway
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Admit, route and execute one chat request
    ///
    /// The outer [`AdmissionResponse`] carries the quota outcome; the inner
    /// `Result` is the outcome of serving the request once admitted.
    ///
    /// The request is always charged to the chat quota, whatever endpoint
    /// the inbound request names.
    pub async fn handle_chat(
        &self,
        request: ChatRequest,
    ) -> AdmissionResponse<Result<ChatCompletion, GatewayError>> {
        let chat = EndpointKind::chat();
        let mut inbound = request.inbound.clone();
        if let Some(named) = inbound.endpoint.as_ref().filter(|named| **named != chat) {
            tracing::debug!(
                request_id = %inbound.request_id,
                endpoint = %named,
                "Chat request named another endpoint, charging the chat quota"
            );
        }
        inbound.endpoint = Some(chat);

        self.admission
            .handle(&inbound, |identity| self.serve(identity, &request))
            .await
    }

    async fn serve(
        &self,
        identity: Option<Identity>,
        request: &ChatRequest,
    ) -> Result<ChatCompletion, GatewayError> {
        let (user_id, tier) = identity.map_or_else(
            || (ANONYMOUS_USER.to_string(), Tier::most_restrictive()),
            |identity| (identity.user_id, identity.tier),
        );
        let ctx = RoutingContext::new(user_id, tier, request.prompt.clone())
            .with_request_id(request.inbound.request_id.clone());
        let decision = self.route(&ctx)?;

        let mut execution =
            ExecutionRequest::new(ctx.request_id.clone(), request.prompt.clone())
                .with_cancellation(request.cancel.clone());
        execution.system_prompt = request.system_prompt.clone();
        execution.max_tokens = request.max_tokens;
        if let Some(temperature) = request.temperature {
            execution = execution.with_temperature(temperature);
        }

        let outcome = self.executor.execute(&decision, &execution).await?;
        Ok(ChatCompletion { decision, outcome })
    }

    /// Route without executing or consuming quota
    pub fn route(&self, ctx: &RoutingContext) -> Result<RoutingDecision, GatewayError> {
        match self.router.route(ctx) {
            Ok(decision) => {
                self.metrics.record_routed();
                Ok(decision)
            }
            Err(err) => {
                self.metrics.record_routing_error();
                Err(err.into())
            }
        }
    }

    /// Operator view of counters, health and store state
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            storage_backend: self.admission.bucket().storage_backend_kind(),
            metrics: self.metrics.snapshot(),
            health: self.health.snapshot(),
        }
    }

    /// The admission layer
    #[must_use]
    pub fn admission(&self) -> &AdmissionMiddleware {
        &self.admission
    }

    /// The health tracker fed by every attempt
    #[must_use]
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Shared counters
    #[must_use]
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// The model catalog being routed over
    #[must_use]
    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        self.router.catalog()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Explicit wiring for a [`Gateway`]
pub struct GatewayBuilder {
    store: Option<Arc<dyn QuotaStore>>,
    clock: Option<Arc<dyn Clock>>,
    quota: QuotaSettings,
    policy: RateLimitPolicy,
    models: Vec<ModelConfig>,
    tiers: TierPolicy,
    executor: ExecutorConfig,
    invoker: Option<Arc<dyn ModelInvoker>>,
    resolver: Arc<dyn IdentityResolver>,
    sinks: Vec<Arc<dyn AttemptSink>>,
    metrics_source: Option<Arc<dyn MetricsSource>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    /// Builder with the built-in catalog, tiers and rate limits
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            quota: QuotaSettings::default(),
            policy: RateLimitPolicy::defaults(),
            models: ModelCatalog::default_models(),
            tiers: TierPolicy::defaults(),
            executor: ExecutorConfig::default(),
            invoker: None,
            resolver: Arc::new(TrustedFieldResolver),
            sinks: Vec::new(),
            metrics_source: None,
        }
    }

    /// Take catalog, tiers, limits, executor and quota tuning from a loaded config
    #[must_use]
    pub fn with_config(mut self, config: &GatewayConfig) -> Self {
        self.quota = config.quota;
        self.policy = config.rate_limits.clone();
        self.models = config.models.clone();
        self.tiers = config.tiers.clone();
        self.executor = config.executor;
        self
    }

    /// Keep quota state in a shared store (in-process when unset)
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific clock for quota timestamps
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Quota store tuning
    #[must_use]
    pub fn with_quota_settings(mut self, quota: QuotaSettings) -> Self {
        self.quota = quota;
        self
    }

    /// Rate limit table
    #[must_use]
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Model catalog, in declaration order
    #[must_use]
    pub fn with_models(mut self, models: Vec<ModelConfig>) -> Self {
        self.models = models;
        self
    }

    /// Tier → allowed models
    #[must_use]
    pub fn with_tiers(mut self, tiers: TierPolicy) -> Self {
        self.tiers = tiers;
        self
    }

    /// Executor tuning
    #[must_use]
    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Backend boundary; required
    #[must_use]
    pub fn with_invoker(mut self, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// How callers are identified
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Extra attempt sink, after the built-in tracing and health sinks
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Route on these metrics instead of the built-in health tracker
    #[must_use]
    pub fn with_metrics_source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.metrics_source = Some(source);
        self
    }

    /// Validate the wiring and assemble the gateway
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when no invoker was given or
    /// when the catalog, tiers, rate limits or executor settings are invalid.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        let invoker = self.invoker.ok_or_else(|| {
            ConfigError::ValidationError("gateway has no model invoker".to_string())
        })?;
        if !(1..=HARD_ATTEMPT_CAP).contains(&self.executor.max_attempts) {
            return Err(ConfigError::ValidationError(format!(
                "executor.max_attempts must be between 1 and {HARD_ATTEMPT_CAP} (got {})",
                self.executor.max_attempts
            )));
        }
        if self.executor.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "executor.attempt_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.policy.validate()?;
        let catalog = Arc::new(ModelCatalog::new(self.models)?);
        self.tiers.validate(&catalog)?;

        let metrics = Arc::new(GatewayMetrics::new());
        let health = Arc::new(HealthTracker::new());

        let mut bucket = match self.store {
            Some(store) => TokenBucket::new(store),
            None => TokenBucket::local(),
        }
        .with_reprobe_after(self.quota.reprobe_after)
        .with_max_cas_attempts(self.quota.max_cas_attempts);
        if let Some(clock) = self.clock {
            bucket = bucket.with_clock(clock);
        }

        let admission = AdmissionMiddleware::new(
            Arc::new(bucket),
            Arc::new(self.policy),
            self.resolver,
            metrics.clone(),
        );

        let metrics_source = self
            .metrics_source
            .unwrap_or_else(|| health.clone() as Arc<dyn MetricsSource>);
        let router = Router::new(catalog.clone(), Arc::new(self.tiers))
            .with_metrics_source(metrics_source);

        let mut executor = FallbackExecutor::new(invoker, catalog, metrics.clone())
            .with_config(self.executor)
            .with_sink(Arc::new(TracingAttemptSink))
            .with_sink(health.clone());
        for sink in self.sinks {
            executor = executor.with_sink(sink);
        }

        let gateway = Gateway {
            admission,
            router,
            executor,
            health,
            metrics,
        };
        tracing::info!(
            models = gateway.catalog().len(),
            storage_backend = ?gateway.admission.bucket().storage_backend_kind(),
            "Gateway assembled"
        );
        Ok(gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InvocationError, InvocationRequest, InvocationResponse};
    use async_trait::async_trait;

    struct Fixed;

    #[async_trait]
    impl ModelInvoker for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn invoke(
            &self,
            request: &InvocationRequest,
            _cancel: CancellationToken,
        ) -> Result<InvocationResponse, InvocationError> {
            Ok(InvocationResponse {
                content: format!("answer from {}", request.model_id),
                prompt_tokens: 10,
                completion_tokens: 20,
            })
        }
    }

    #[test]
    fn test_build_requires_invoker() {
        let err = Gateway::builder().build().unwrap_err();
        assert!(err.to_string().contains("invoker"), "{err}");
    }

    #[test]
    fn test_build_rejects_attempts_above_cap() {
        let err = Gateway::builder()
            .with_invoker(Arc::new(Fixed))
            .with_executor_config(ExecutorConfig {
                max_attempts: 4,
                ..ExecutorConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_attempts"), "{err}");
    }

    #[tokio::test]
    async fn test_unidentified_caller_routes_on_most_restrictive_tier() {
        let gateway = Gateway::builder()
            .with_invoker(Arc::new(Fixed))
            .build()
            .unwrap();

        let response = gateway
            .handle_chat(ChatRequest::new(
                InboundRequest::new(EndpointKind::chat()),
                "hello",
            ))
            .await;

        let AdmissionResponse::Unthrottled { body, .. } = response else {
            panic!("expected unthrottled response");
        };
        let completion = body.unwrap();
        let free = TierPolicy::defaults();
        assert!(free.permits(Tier::Free, &completion.outcome.served_by));
    }

    #[test]
    fn test_gateway_error_mapping() {
        let exhausted = ExecutionError::Exhausted {
            request_id: "r".to_string(),
            attempts: 3,
            last_error: crate::routing::AttemptError::Timeout { after_ms: 10 },
        };
        let err = GatewayError::from(exhausted);
        assert_eq!(err.status_code(), 503);
        assert!(!err.public_message().contains("Timeout"));

        let err = GatewayError::from(ExecutionError::Cancelled {
            request_id: "r".to_string(),
        });
        assert_eq!(err, GatewayError::Cancelled { request_id: "r".to_string() });

        let err = GatewayError::from(RoutingError::NoEligibleModels { tier: Tier::Pro });
        assert_eq!(err.status_code(), 500);
    }
}
