//! Quota Enforcement
//!
//! Tiered token-bucket rate limiting over a pluggable key-value store.
//!
//! - [`bucket`]: the token bucket itself, with degraded-mode fallback
//! - [`store`]: the store boundary and the in-process [`LocalStore`]
//! - [`policy`]: (endpoint, tier) → bucket parameters
//! - [`clock`]: injectable epoch clock

pub mod bucket;
pub mod clock;
pub mod policy;
pub mod store;

pub use bucket::{
    BucketState, ConsumeOutcome, StorageBackendKind, TokenBucket, TokenBucketConfig, Verdict,
    DEFAULT_MAX_CAS_ATTEMPTS, DEFAULT_REPROBE_AFTER,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use policy::{EndpointKind, RateLimitKey, RateLimitPolicy};
pub use store::{LocalStore, QuotaStore, StoreError, StoreKind};
