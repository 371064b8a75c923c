//! Model Routing
//!
//! Picks which backend model serves a request and drives the attempt chain.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +--------------+
//! |   ModelCatalog   |     |  TierPolicy  |  <-- immutable, built at startup
//! +--------+---------+     +------+-------+
//!          |                      |
//!          +----------+-----------+
//!                     v
//!            +------------------+      +---------------+
//!            |      Router      | <--- | HealthTracker |  <-- live metrics
//!            |  (HybridScorer)  |      +-------^-------+
//!            +--------+---------+              |
//!                     | RoutingDecision        | AttemptRecord
//!                     v                        |
//!            +------------------+              |
//!            | FallbackExecutor | -------------+
//!            +--------+---------+
//!                     |
//!                     v
//!               ModelInvoker
//! ```
//!
//! # Design Principles
//!
//! 1. **Fail safe on tiers**: unknown tiers get the most restrictive model set
//! 2. **Deterministic ranking**: same inputs, same decision
//! 3. **Bounded fallback**: at most three attempts, no backoff
//! 4. **Sanitized failure**: callers only ever see a generic 503

pub mod catalog;
pub mod fallback;
pub mod health;
pub mod router;
pub mod scorer;
pub mod tier_policy;

pub use catalog::{Capability, ModelCatalog, ModelConfig};
pub use fallback::{
    AttemptError, AttemptRecord, AttemptSink, ExecutionError, ExecutionOutcome,
    ExecutionRequest, ExecutorConfig, FallbackExecutor, SinkError, TracingAttemptSink,
    DEFAULT_ATTEMPT_TIMEOUT, HARD_ATTEMPT_CAP,
};
pub use health::{HealthTracker, MetricsSource};
pub use router::{estimate_tokens, Router, RoutingContext, RoutingDecision, RoutingError};
pub use scorer::{HybridScorer, LiveMetrics, MetricsSnapshot, ModelScore, PromptSignals};
pub use tier_policy::TierPolicy;
