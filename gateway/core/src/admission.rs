//! Admission Control
//!
//! Wraps an inbound handler with identity resolution and a token-bucket
//! check. The order is fixed:
//!
//! 1. Resolve identity and tier. If that fails the request passes through
//!    unthrottled; authentication failures are reported elsewhere.
//! 2. Consume one token from `rl:{endpoint}:{tier}:{user}`.
//! 3. Denied: short-circuit with a 429 and never call the handler.
//! 4. Allowed: call the handler and attach quota metadata.
//!
//! Errors from the quota subsystem itself fail open.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::metrics::GatewayMetrics;
use crate::quota::{
    ConsumeOutcome, EndpointKind, RateLimitKey, RateLimitPolicy, TokenBucket, Verdict,
};
use crate::tier::Tier;

/// Response header carrying the bucket capacity
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Response header carrying whole tokens left
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Response header carrying the refill time in epoch seconds
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Response header carrying the retry hint in seconds
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Error code of every quota denial
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

// =============================================================================
// Identity
// =============================================================================

/// An inbound request as far as admission is concerned
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundRequest {
    /// Correlation id
    pub request_id: String,
    /// Endpoint class being called
    pub endpoint: Option<EndpointKind>,
    /// Caller-asserted user id
    pub user_id: Option<String>,
    /// Caller-asserted tier name
    pub tier: Option<String>,
}

impl InboundRequest {
    /// Request for an endpoint with a fresh request id
    #[must_use]
    pub fn new(endpoint: EndpointKind) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    /// Attach the caller's user id
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the caller's tier name
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Use a specific request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Endpoint kind, defaulting to chat
    #[must_use]
    pub fn endpoint(&self) -> EndpointKind {
        self.endpoint.clone().unwrap_or_else(EndpointKind::chat)
    }
}

/// Who is calling and on which plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Stable user identifier
    pub user_id: String,
    /// Resolved subscription tier
    pub tier: Tier,
}

/// Identity resolution failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No credentials on the request
    #[error("request carries no identity")]
    Missing,

    /// Credentials present but not accepted
    #[error("identity rejected: {0}")]
    Rejected(String),

    /// The identity provider could not be consulted
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Maps an inbound request to an identity and tier
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller of `request`
    async fn resolve(&self, request: &InboundRequest) -> Result<Identity, IdentityError>;
}

/// Trusts the user and tier fields already on the request
///
/// For deployments behind an authenticating proxy. Unknown tier names fall
/// back to the most restrictive tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustedFieldResolver;

#[async_trait]
impl IdentityResolver for TrustedFieldResolver {
    async fn resolve(&self, request: &InboundRequest) -> Result<Identity, IdentityError> {
        let user_id = request
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(IdentityError::Missing)?;
        let tier = request
            .tier
            .as_deref()
            .map_or_else(Tier::most_restrictive, Tier::resolve);

        Ok(Identity {
            user_id: user_id.to_string(),
            tier,
        })
    }
}

// =============================================================================
// Quota Metadata
// =============================================================================

/// Quota state attached to an admitted response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaMetadata {
    /// Bucket capacity
    pub limit: u64,
    /// Whole tokens left
    pub remaining: u64,
    /// Epoch milliseconds at which the bucket is full again
    pub reset_at_ms: i64,
}

impl QuotaMetadata {
    /// Standard rate-limit response headers
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, reset_epoch_secs(self.reset_at_ms).to_string()),
        ]
    }
}

impl From<&ConsumeOutcome> for QuotaMetadata {
    fn from(outcome: &ConsumeOutcome) -> Self {
        Self {
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at_ms: outcome.reset_at_ms,
        }
    }
}

fn reset_epoch_secs(reset_at_ms: i64) -> i64 {
    reset_at_ms.div_euclid(1_000) + i64::from(reset_at_ms.rem_euclid(1_000) > 0)
}

/// Why a request was denied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The bucket is empty for now
    Exhausted,
    /// The feature is switched off for this tier
    Disabled,
}

/// A 429 rejection
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    /// Always [`RATE_LIMIT_EXCEEDED`]
    pub code: &'static str,
    /// Always 429
    pub status_code: u16,
    /// Why the bucket denied
    pub reason: DenialReason,
    /// Bucket capacity
    pub limit: u64,
    /// Always 0
    pub remaining: u64,
    /// Epoch milliseconds at which the bucket is full again
    pub reset_at_ms: i64,
    /// Seconds to wait; absent when waiting will not help
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Caller-facing message
    pub message: String,
}

impl QuotaDenial {
    fn from_outcome(outcome: &ConsumeOutcome, endpoint: &EndpointKind) -> Self {
        let (reason, message) = match outcome.verdict {
            Verdict::Disabled => (
                DenialReason::Disabled,
                format!("The {endpoint} feature is not available on your plan"),
            ),
            _ => (
                DenialReason::Exhausted,
                format!("Rate limit exceeded for {endpoint}, please retry later"),
            ),
        };
        Self {
            code: RATE_LIMIT_EXCEEDED,
            status_code: 429,
            reason,
            limit: outcome.limit,
            remaining: 0,
            reset_at_ms: outcome.reset_at_ms,
            retry_after_secs: outcome.retry_after_secs(),
            message,
        }
    }

    /// Rate-limit headers plus `Retry-After` when waiting helps
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = QuotaMetadata {
            limit: self.limit,
            remaining: 0,
            reset_at_ms: self.reset_at_ms,
        }
        .headers();
        if let Some(secs) = self.retry_after_secs {
            headers.push((HEADER_RETRY_AFTER, secs.to_string()));
        }
        headers
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Why enforcement was skipped
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BypassReason {
    /// Identity could not be resolved
    IdentityUnresolved(String),
    /// The quota subsystem failed
    QuotaUnavailable(String),
}

/// Outcome of the quota check alone
#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionDecision {
    /// Quota debited
    Admit {
        /// Resolved caller
        identity: Identity,
        /// Quota after the debit
        quota: QuotaMetadata,
    },
    /// Quota exhausted or disabled
    Deny(QuotaDenial),
    /// Enforcement skipped
    Bypass {
        /// Caller, if it could be resolved
        identity: Option<Identity>,
        /// Why enforcement was skipped
        reason: BypassReason,
    },
}

/// Result of running a handler behind admission control
#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionResponse<T> {
    /// Handler ran within quota
    Admitted {
        /// Handler output
        body: T,
        /// Quota metadata for the response headers
        quota: QuotaMetadata,
    },
    /// Handler was not called
    Rejected(QuotaDenial),
    /// Handler ran without enforcement
    Unthrottled {
        /// Handler output
        body: T,
        /// Why enforcement was skipped
        reason: BypassReason,
    },
}

impl<T> AdmissionResponse<T> {
    /// Handler output, if the handler ran
    #[must_use]
    pub fn body(&self) -> Option<&T> {
        match self {
            Self::Admitted { body, .. } | Self::Unthrottled { body, .. } => Some(body),
            Self::Rejected(_) => None,
        }
    }

    /// The denial, if the request was rejected
    #[must_use]
    pub fn denial(&self) -> Option<&QuotaDenial> {
        match self {
            Self::Rejected(denial) => Some(denial),
            _ => None,
        }
    }

    /// Headers to attach to the outgoing response
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Admitted { quota, .. } => quota.headers(),
            Self::Rejected(denial) => denial.headers(),
            Self::Unthrottled { .. } => Vec::new(),
        }
    }
}

/// Identity resolution plus token-bucket enforcement
pub struct AdmissionMiddleware {
    bucket: Arc<TokenBucket>,
    policy: Arc<RateLimitPolicy>,
    resolver: Arc<dyn IdentityResolver>,
    metrics: Arc<GatewayMetrics>,
}

impl std::fmt::Debug for AdmissionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionMiddleware")
            .field("bucket", &self.bucket)
            .field("policy_entries", &self.policy.len())
            .finish_non_exhaustive()
    }
}

impl AdmissionMiddleware {
    /// Compose the middleware from its collaborators
    #[must_use]
    pub fn new(
        bucket: Arc<TokenBucket>,
        policy: Arc<RateLimitPolicy>,
        resolver: Arc<dyn IdentityResolver>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            bucket,
            policy,
            resolver,
            metrics,
        }
    }

    /// The underlying bucket
    #[must_use]
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Resolve the caller and debit one token
    pub async fn check(&self, request: &InboundRequest) -> AdmissionDecision {
        let identity = match self.resolver.resolve(request).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    error = %err,
                    "Identity unresolved, skipping quota enforcement"
                );
                self.metrics.record_unthrottled();
                return AdmissionDecision::Bypass {
                    identity: None,
                    reason: BypassReason::IdentityUnresolved(err.to_string()),
                };
            }
        };

        let endpoint = request.endpoint();
        let key = RateLimitKey::new(&endpoint, &identity.user_id, identity.tier);
        let config = self.policy.lookup(&endpoint, identity.tier);

        let outcome = match self.bucket.consume(key.as_str(), config, 1.0).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    request_id = %request.request_id,
                    key = %key,
                    error = %err,
                    "Quota check failed, admitting request unthrottled"
                );
                self.metrics.record_unthrottled();
                return AdmissionDecision::Bypass {
                    identity: Some(identity),
                    reason: BypassReason::QuotaUnavailable(err.to_string()),
                };
            }
        };

        match outcome.verdict {
            Verdict::Allowed => {
                self.metrics.record_admitted();
                AdmissionDecision::Admit {
                    identity,
                    quota: QuotaMetadata::from(&outcome),
                }
            }
            Verdict::Exhausted { retry_after_secs } => {
                tracing::info!(
                    request_id = %request.request_id,
                    key = %key,
                    retry_after_secs,
                    "Quota exhausted"
                );
                self.metrics.record_denied();
                AdmissionDecision::Deny(QuotaDenial::from_outcome(&outcome, &endpoint))
            }
            Verdict::Disabled => {
                tracing::info!(
                    request_id = %request.request_id,
                    endpoint = %endpoint,
                    tier = %identity.tier,
                    "Endpoint disabled for tier"
                );
                self.metrics.record_disabled();
                AdmissionDecision::Deny(QuotaDenial::from_outcome(&outcome, &endpoint))
            }
        }
    }

    /// Run `inner` behind the quota check
    ///
    /// `inner` receives the resolved identity, if any, and is never called
    /// for a denied request.
    pub async fn handle<T, F, Fut>(&self, request: &InboundRequest, inner: F) -> AdmissionResponse<T>
    where
        F: FnOnce(Option<Identity>) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.check(request).await {
            AdmissionDecision::Admit { identity, quota } => AdmissionResponse::Admitted {
                body: inner(Some(identity)).await,
                quota,
            },
            AdmissionDecision::Deny(denial) => AdmissionResponse::Rejected(denial),
            AdmissionDecision::Bypass { identity, reason } => AdmissionResponse::Unthrottled {
                body: inner(identity).await,
                reason,
            },
        }
    }
}
