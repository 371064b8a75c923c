//! Gateway Core - Admission Control and Model Routing for Multi-Tenant LLM Traffic
//!
//! This crate sits between tenants and a pool of model providers. For every
//! request it decides whether the tenant may proceed, which model should
//! serve it, and what to do when that model fails.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Gateway                               │
//! │                                                                  │
//! │  ┌────────────────────┐   ┌──────────────┐   ┌─────────────────┐ │
//! │  │ AdmissionMiddleware│──►│    Router    │──►│FallbackExecutor │ │
//! │  │  (TokenBucket +    │   │ (TierPolicy +│   │ (timeouts,      │ │
//! │  │   RateLimitPolicy) │   │ HybridScorer)│   │  attempt sinks) │ │
//! │  └─────────┬──────────┘   └──────▲───────┘   └────────┬────────┘ │
//! │            │                     │ live metrics       │          │
//! │            ▼                     │                    ▼          │
//! │      QuotaStore            HealthTracker ◄──── ModelInvoker      │
//! │   (remote or local)                           (Ollama, OpenAI)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{
//!     admission::InboundRequest,
//!     backend::{OllamaInvoker, ProviderRegistry},
//!     config::load_config,
//!     gateway::{ChatRequest, Gateway},
//!     quota::EndpointKind,
//! };
//!
//! let config = load_config()?;
//! let ollama = OllamaInvoker::new("localhost", 11434, Duration::from_secs(120))?;
//! let gateway = Gateway::builder()
//!     .with_config(&config)
//!     .with_invoker(Arc::new(ProviderRegistry::new().with("ollama", Arc::new(ollama))))
//!     .build()?;
//!
//! let inbound = InboundRequest::new(EndpointKind::chat())
//!     .with_user("user-42")
//!     .with_tier("pro");
//! let response = gateway.handle_chat(ChatRequest::new(inbound, "Explain borrowing")).await;
//! ```
//!
//! # Module Overview
//!
//! - [`tier`]: Subscription tiers and fail-safe tier resolution
//! - [`quota`]: Token bucket, rate limit policy and the quota store boundary
//! - [`admission`]: Identity resolution plus quota enforcement around a handler
//! - [`routing`]: Model catalog, tier policy, scoring, routing and fallback
//! - [`backend`]: Model invocation over provider HTTP APIs
//! - [`metrics`]: Counters and latency histograms
//! - [`config`]: TOML / environment configuration loading
//! - [`gateway`]: The composition root

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod admission;
pub mod backend;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod quota;
pub mod routing;
pub mod tier;

pub use admission::{
    AdmissionDecision, AdmissionMiddleware, AdmissionResponse, InboundRequest, QuotaDenial,
    QuotaMetadata,
};
pub use config::{load_config, load_config_from_path, ConfigError, GatewayConfig};
pub use gateway::{ChatCompletion, ChatRequest, Gateway, GatewayBuilder, GatewayError};
pub use quota::{EndpointKind, RateLimitPolicy, TokenBucket, TokenBucketConfig};
pub use routing::{
    FallbackExecutor, HybridScorer, ModelCatalog, Router, RoutingContext, RoutingDecision,
    TierPolicy,
};
pub use tier::Tier;
