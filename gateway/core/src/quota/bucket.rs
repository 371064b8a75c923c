//! Token Bucket Rate Limiter
//!
//! Per-key token buckets whose state lives in a [`QuotaStore`], so every
//! gateway instance sharing the store enforces one quota.
//!
//! # Refill
//!
//! Refill is floored to whole intervals. `last_refill_ms` advances by exactly
//! `elapsed_intervals * refill_interval_ms`, never to "now", so partial
//! progress towards the next interval is carried forward.
//!
//! # Atomicity
//!
//! Within one process, consumes on the same key are serialized by a per-key
//! async mutex. Across processes the write is a compare-and-set against the
//! value that was read, retried a bounded number of times.
//!
//! # Degraded mode
//!
//! If the remote store reports [`StoreError::Unavailable`], the bucket switches
//! to its in-process [`LocalStore`], logs a warning and tries the remote store
//! again after a cool-down. Quotas are then enforced per instance only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use super::store::{LocalStore, QuotaStore, StoreError, StoreKind};
use crate::config::ConfigError;

/// Default cool-down before a degraded bucket re-probes the remote store
pub const DEFAULT_REPROBE_AFTER: Duration = Duration::from_secs(30);

/// Default number of compare-and-set attempts per consume
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 8;

/// Minimum lifetime of a stored bucket state
const MIN_STATE_TTL: Duration = Duration::from_secs(60);

/// Float noise tolerance for whole-second rounding
const CEIL_EPSILON: f64 = 1e-9;

// =============================================================================
// Configuration
// =============================================================================

/// Parameters of one bucket
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Capacity; 0 disables the bucket
    pub max_tokens: f64,
    /// Sustained refill rate; 0 disables the bucket
    pub refill_rate_per_second: f64,
    /// Refill granularity in milliseconds
    pub refill_interval_ms: u64,
}

impl TokenBucketConfig {
    /// Create a bucket configuration
    #[must_use]
    pub const fn new(max_tokens: f64, refill_rate_per_second: f64, refill_interval_ms: u64) -> Self {
        Self {
            max_tokens,
            refill_rate_per_second,
            refill_interval_ms,
        }
    }

    /// `requests` per `window`, refilled every second
    #[must_use]
    pub fn per_window(requests: u32, window: Duration) -> Self {
        let secs = window.as_secs_f64();
        let rate = if secs > 0.0 {
            f64::from(requests) / secs
        } else {
            0.0
        };
        Self::new(f64::from(requests), rate, 1_000)
    }

    /// A bucket that always denies
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0.0, 0.0, 1_000)
    }

    /// Whether this configuration hard-disables the feature
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.max_tokens <= 0.0 || self.refill_rate_per_second <= 0.0
    }

    /// Tokens added per whole refill interval
    #[must_use]
    pub fn refill_per_interval(&self) -> f64 {
        self.refill_rate_per_second * self.refill_interval_ms as f64 / 1_000.0
    }

    /// Reject negative, non-finite or zero-interval parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_tokens.is_finite() || self.max_tokens < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "max_tokens must be a finite, non-negative number (got {})",
                self.max_tokens
            )));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "refill_rate_per_second must be a finite, non-negative number (got {})",
                self.refill_rate_per_second
            )));
        }
        if self.refill_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "refill_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// How long an untouched state is worth keeping
    ///
    /// Twice the time to refill from empty, never less than a minute. After
    /// that an absent state (a full bucket) is indistinguishable from it.
    fn state_ttl(&self) -> Duration {
        let to_full = if self.refill_rate_per_second > 0.0 {
            self.max_tokens / self.refill_rate_per_second
        } else {
            0.0
        };
        let interval = Duration::from_millis(self.refill_interval_ms);
        Duration::try_from_secs_f64(to_full * 2.0)
            .unwrap_or(MIN_STATE_TTL)
            .max(interval * 2)
            .max(MIN_STATE_TTL)
    }
}

// =============================================================================
// State
// =============================================================================

/// Persisted state of one bucket
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available
    pub tokens: f64,
    /// Epoch milliseconds up to which refill has been credited
    pub last_refill_ms: i64,
}

impl BucketState {
    /// A full bucket, as seen on first use of a key
    #[must_use]
    pub fn full(config: &TokenBucketConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.max_tokens,
            last_refill_ms: now_ms,
        }
    }

    fn decode(key: &str, raw: &str) -> Result<Self, StoreError> {
        let state: Self = serde_json::from_str(raw).map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if !state.tokens.is_finite() || state.tokens < 0.0 {
            return Err(StoreError::Corrupted {
                key: key.to_string(),
                reason: format!("invalid token count {}", state.tokens),
            });
        }
        Ok(state)
    }

    fn encode(&self, key: &str) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Credit whole elapsed intervals, capped at capacity
    fn refill(&mut self, config: &TokenBucketConfig, now_ms: i64) {
        // Capacity may have shrunk since the state was written
        self.tokens = self.tokens.min(config.max_tokens);

        let interval = config.refill_interval_ms as i64;
        if now_ms <= self.last_refill_ms || interval <= 0 {
            return;
        }
        let elapsed_intervals = (now_ms - self.last_refill_ms) / interval;
        if elapsed_intervals > 0 {
            let credit = elapsed_intervals as f64 * config.refill_per_interval();
            self.tokens = (self.tokens + credit).min(config.max_tokens);
            self.last_refill_ms += elapsed_intervals * interval;
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of a consume attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Tokens were debited
    Allowed,
    /// Not enough tokens right now
    Exhausted {
        /// Whole seconds until enough tokens will have refilled
        retry_after_secs: u64,
    },
    /// The bucket is configured to always deny
    Disabled,
}

/// Quota information returned by every consume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    /// Bucket capacity
    pub limit: u64,
    /// Whole tokens left after this call
    pub remaining: u64,
    /// Epoch milliseconds at which the bucket will be full again
    pub reset_at_ms: i64,
    /// Allowed, exhausted or disabled
    pub verdict: Verdict,
}

impl ConsumeOutcome {
    fn disabled(now_ms: i64) -> Self {
        Self {
            limit: 0,
            remaining: 0,
            reset_at_ms: now_ms,
            verdict: Verdict::Disabled,
        }
    }

    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allowed)
    }

    /// Retry hint for an exhausted bucket
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.verdict {
            Verdict::Exhausted { retry_after_secs } => Some(retry_after_secs),
            _ => None,
        }
    }
}

/// Whole seconds, rounded up, ignoring float noise just above an integer
fn ceil_secs(secs: f64) -> u64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs - CEIL_EPSILON).ceil().max(0.0) as u64
}

/// Apply refill and a debit of `cost` to `state`
///
/// Returns the outcome and, when allowed, the state to persist.
fn settle(
    mut state: BucketState,
    config: &TokenBucketConfig,
    cost: f64,
    now_ms: i64,
) -> (ConsumeOutcome, Option<BucketState>) {
    state.refill(config, now_ms);
    let rate = config.refill_rate_per_second;
    let limit = config.max_tokens.floor() as u64;

    if state.tokens + CEIL_EPSILON >= cost {
        state.tokens = (state.tokens - cost).max(0.0);
        let outcome = ConsumeOutcome {
            limit,
            remaining: state.tokens.floor() as u64,
            reset_at_ms: now_ms + ceil_secs((config.max_tokens - state.tokens) / rate) as i64 * 1_000,
            verdict: Verdict::Allowed,
        };
        return (outcome, Some(state));
    }

    let outcome = ConsumeOutcome {
        limit,
        remaining: 0,
        reset_at_ms: now_ms + ceil_secs((config.max_tokens - state.tokens) / rate) as i64 * 1_000,
        verdict: Verdict::Exhausted {
            retry_after_secs: ceil_secs((cost - state.tokens) / rate).max(1),
        },
    };
    (outcome, None)
}

// =============================================================================
// Token Bucket
// =============================================================================

/// Where bucket state is currently kept
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// The shared remote store
    Remote,
    /// An in-process store by configuration
    Local,
    /// The in-process store because the remote one is unreachable
    DegradedLocal,
}

/// Rate limiter over a shared store
pub struct TokenBucket {
    primary: Arc<dyn QuotaStore>,
    fallback: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    degraded_since: Mutex<Option<Instant>>,
    reprobe_after: Duration,
    max_cas_attempts: u32,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("backend", &self.storage_backend_kind())
            .field("reprobe_after", &self.reprobe_after)
            .field("max_cas_attempts", &self.max_cas_attempts)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// Bucket over the given primary store, with an in-process fallback
    #[must_use]
    pub fn new(primary: Arc<dyn QuotaStore>) -> Self {
        Self {
            primary,
            fallback: Arc::new(LocalStore::new()),
            clock: Arc::new(SystemClock),
            key_locks: DashMap::new(),
            degraded_since: Mutex::new(None),
            reprobe_after: DEFAULT_REPROBE_AFTER,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    /// Bucket that keeps all state in this process
    #[must_use]
    pub fn local() -> Self {
        let store = Arc::new(LocalStore::new());
        let mut bucket = Self::new(store.clone());
        bucket.fallback = store;
        bucket
    }

    /// Use a different clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set how long to stay degraded before re-probing the remote store
    #[must_use]
    pub fn with_reprobe_after(mut self, reprobe_after: Duration) -> Self {
        self.reprobe_after = reprobe_after;
        self
    }

    /// Set the compare-and-set retry bound (at least 1)
    #[must_use]
    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Where state is being kept right now
    #[must_use]
    pub fn storage_backend_kind(&self) -> StorageBackendKind {
        match self.primary.kind() {
            StoreKind::Local => StorageBackendKind::Local,
            StoreKind::Remote if self.is_degraded() => StorageBackendKind::DegradedLocal,
            StoreKind::Remote => StorageBackendKind::Remote,
        }
    }

    /// Whether the remote store has been abandoned for now
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded_since.lock().is_some()
    }

    /// Try to take `cost` tokens from the bucket at `key`
    ///
    /// `cost` must be positive and finite. Store errors other than
    /// unavailability are returned to the caller.
    pub async fn consume(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: f64,
    ) -> Result<ConsumeOutcome, StoreError> {
        if !cost.is_finite() || cost <= 0.0 {
            return Err(StoreError::InvalidCost { cost });
        }
        if config.is_disabled() {
            return Ok(ConsumeOutcome::disabled(self.clock.now_ms()));
        }

        let lock = self
            .key_locks
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.consume_serialized(key, config, cost).await
        };
        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Clear the state at `key`, leaving a full bucket behind
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.fallback.delete(key).await?;
        if self.primary.kind() == StoreKind::Remote {
            match self.primary.delete(key).await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => self.mark_degraded(&err),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn consume_serialized(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: f64,
    ) -> Result<ConsumeOutcome, StoreError> {
        if self.primary.kind() == StoreKind::Local || !self.should_use_remote() {
            return self.consume_in(self.fallback.as_ref(), key, config, cost).await;
        }

        match self.consume_in(self.primary.as_ref(), key, config, cost).await {
            Err(err) if err.is_unavailable() => {
                self.mark_degraded(&err);
                self.consume_in(self.fallback.as_ref(), key, config, cost)
                    .await
            }
            result => {
                if result.is_ok() {
                    self.mark_recovered();
                }
                result
            }
        }
    }

    async fn consume_in(
        &self,
        store: &dyn QuotaStore,
        key: &str,
        config: &TokenBucketConfig,
        cost: f64,
    ) -> Result<ConsumeOutcome, StoreError> {
        for attempt in 1..=self.max_cas_attempts {
            let now_ms = self.clock.now_ms();
            let current = store.get(key).await?;
            // Unreadable state is replaced through the same conditional write
            let state = match current.as_deref().map(|raw| BucketState::decode(key, raw)) {
                Some(Ok(state)) => state,
                Some(Err(err)) => {
                    tracing::warn!(key, error = %err, "Discarding unreadable bucket state");
                    BucketState::full(config, now_ms)
                }
                None => BucketState::full(config, now_ms),
            };

            let (outcome, next) = settle(state, config, cost, now_ms);
            let Some(next) = next else {
                return Ok(outcome);
            };

            let encoded = next.encode(key)?;
            if store
                .compare_and_set(key, current.as_deref(), &encoded, config.state_ttl())
                .await?
            {
                return Ok(outcome);
            }
            tracing::debug!(key, attempt, "Bucket state changed concurrently, retrying");
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    fn should_use_remote(&self) -> bool {
        match *self.degraded_since.lock() {
            None => true,
            Some(since) => since.elapsed() >= self.reprobe_after,
        }
    }

    fn mark_degraded(&self, err: &StoreError) {
        let mut degraded = self.degraded_since.lock();
        let first = degraded.is_none();
        *degraded = Some(Instant::now());
        if first {
            tracing::warn!(
                error = %err,
                reprobe_after_secs = self.reprobe_after.as_secs(),
                "Quota store unavailable, enforcing quotas per instance"
            );
        }
    }

    fn mark_recovered(&self) {
        if self.degraded_since.lock().take().is_some() {
            tracing::info!("Quota store reachable again, resuming shared quotas");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::clock::ManualClock;

    const START_MS: i64 = 1_700_000_000_000;

    fn manual_bucket() -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let bucket = TokenBucket::local().with_clock(clock.clone());
        (bucket, clock)
    }

    // =========================================================================
    // Config Tests
    // =========================================================================

    #[test]
    fn test_per_window() {
        let config = TokenBucketConfig::per_window(60, Duration::from_secs(60));
        assert_eq!(config.max_tokens, 60.0);
        assert!((config.refill_rate_per_second - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.refill_interval_ms, 1_000);
        assert!(!config.is_disabled());
    }

    #[test]
    fn test_disabled_configs() {
        assert!(TokenBucketConfig::disabled().is_disabled());
        assert!(TokenBucketConfig::new(10.0, 0.0, 1_000).is_disabled());
        assert!(TokenBucketConfig::new(0.0, 5.0, 1_000).is_disabled());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TokenBucketConfig::new(-1.0, 1.0, 1_000).validate().is_err());
        assert!(TokenBucketConfig::new(f64::NAN, 1.0, 1_000).validate().is_err());
        assert!(TokenBucketConfig::new(1.0, f64::INFINITY, 1_000).validate().is_err());
        assert!(TokenBucketConfig::new(1.0, 1.0, 0).validate().is_err());
        assert!(TokenBucketConfig::disabled().validate().is_ok());
    }

    #[test]
    fn test_state_ttl_floor() {
        let config = TokenBucketConfig::per_window(10, Duration::from_secs(1));
        assert_eq!(config.state_ttl(), MIN_STATE_TTL);

        let hourly = TokenBucketConfig::per_window(5, Duration::from_secs(3_600));
        let ttl = hourly.state_ttl();
        assert!(ttl >= Duration::from_secs(7_199) && ttl <= Duration::from_secs(7_201));
    }

    #[test]
    fn test_ceil_secs_ignores_float_noise() {
        assert_eq!(ceil_secs(1.0 / (20.0 / 60.0)), 3);
        assert_eq!(ceil_secs(2.01), 3);
        assert_eq!(ceil_secs(0.0), 0);
        assert_eq!(ceil_secs(f64::NAN), 0);
    }

    // =========================================================================
    // Refill Tests
    // =========================================================================

    #[test]
    fn test_refill_is_floored_to_whole_intervals() {
        let config = TokenBucketConfig::new(10.0, 1.0, 1_000);
        let mut state = BucketState {
            tokens: 0.0,
            last_refill_ms: START_MS,
        };

        state.refill(&config, START_MS + 2_500);
        assert_eq!(state.tokens, 2.0);
        // Half an interval is carried forward, not lost
        assert_eq!(state.last_refill_ms, START_MS + 2_000);

        state.refill(&config, START_MS + 3_000);
        assert_eq!(state.tokens, 3.0);
        assert_eq!(state.last_refill_ms, START_MS + 3_000);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let config = TokenBucketConfig::new(5.0, 1.0, 1_000);
        let mut state = BucketState {
            tokens: 4.0,
            last_refill_ms: START_MS,
        };
        state.refill(&config, START_MS + 60_000);
        assert_eq!(state.tokens, 5.0);
    }

    #[test]
    fn test_refill_ignores_clock_going_backwards() {
        let config = TokenBucketConfig::new(5.0, 1.0, 1_000);
        let mut state = BucketState {
            tokens: 1.0,
            last_refill_ms: START_MS,
        };
        state.refill(&config, START_MS - 10_000);
        assert_eq!(state.tokens, 1.0);
        assert_eq!(state.last_refill_ms, START_MS);
    }

    // =========================================================================
    // Consume Tests
    // =========================================================================

    #[tokio::test]
    async fn test_new_key_starts_full() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(5.0, 1.0, 1_000);

        let outcome = bucket.consume("rl:chat:free:u1", &config, 1.0).await.unwrap();
        assert!(outcome.is_allowed());
        assert_eq!(outcome.limit, 5);
        assert_eq!(outcome.remaining, 4);
        assert_eq!(outcome.reset_at_ms, START_MS + 1_000);
    }

    #[tokio::test]
    async fn test_twenty_first_consume_is_denied_with_three_second_retry() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(20.0, 20.0 / 60.0, 1_000);

        for i in 0..20 {
            let outcome = bucket.consume("k", &config, 1.0).await.unwrap();
            assert!(outcome.is_allowed(), "consume {} should pass", i + 1);
        }

        let denied = bucket.consume("k", &config, 1.0).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs(), Some(3));
    }

    #[tokio::test]
    async fn test_refill_after_waiting() {
        let (bucket, clock) = manual_bucket();
        let config = TokenBucketConfig::new(2.0, 1.0, 1_000);

        bucket.consume("k", &config, 2.0).await.unwrap();
        assert!(!bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());

        clock.advance(999);
        assert!(!bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());

        clock.advance(1);
        assert!(bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_always_denies() {
        let (bucket, _clock) = manual_bucket();

        let outcome = bucket
            .consume("k", &TokenBucketConfig::disabled(), 1.0)
            .await
            .unwrap();
        assert_eq!(outcome.verdict, Verdict::Disabled);
        assert_eq!(outcome.limit, 0);
        assert_eq!(outcome.retry_after_secs(), None);

        // Zero rate with capacity is disabled too, not a one-shot allowance
        let zero_rate = TokenBucketConfig::new(10.0, 0.0, 1_000);
        let outcome = bucket.consume("k", &zero_rate, 1.0).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Disabled);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(1.0, 1.0, 1_000);

        assert!(bucket.consume("a", &config, 1.0).await.unwrap().is_allowed());
        assert!(bucket.consume("b", &config, 1.0).await.unwrap().is_allowed());
        assert!(!bucket.consume("a", &config, 1.0).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_reset_refills() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(1.0, 1.0, 60_000);

        bucket.consume("k", &config, 1.0).await.unwrap();
        assert!(!bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());

        bucket.reset("k").await.unwrap();
        assert!(bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_rejects_invalid_cost() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(5.0, 1.0, 1_000);

        for cost in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = bucket.consume("k", &config, cost).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidCost { .. }), "{cost}: {err}");
        }
        // Nothing was charged
        let outcome = bucket.consume("k", &config, 1.0).await.unwrap();
        assert_eq!(outcome.remaining, 4);
    }

    #[tokio::test]
    async fn test_unreadable_state_is_replaced_with_full_bucket() {
        let store = Arc::new(LocalStore::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let bucket = TokenBucket::new(store.clone()).with_clock(clock);
        let config = TokenBucketConfig::new(2.0, 1.0, 60_000);

        store
            .set_with_ttl("k", r#"{"tokens":-3.0,"last_refill_ms":0}"#, MIN_STATE_TTL)
            .await
            .unwrap();

        assert_eq!(bucket.consume("k", &config, 1.0).await.unwrap().remaining, 1);
        assert!(bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());
        assert!(!bucket.consume("k", &config, 1.0).await.unwrap().is_allowed());

        let raw = store.get("k").await.unwrap().unwrap();
        assert!(BucketState::decode("k", &raw).is_ok());
    }

    #[tokio::test]
    async fn test_key_locks_are_released() {
        let (bucket, _clock) = manual_bucket();
        let config = TokenBucketConfig::new(5.0, 1.0, 1_000);

        bucket.consume("k", &config, 1.0).await.unwrap();
        assert!(bucket.key_locks.is_empty());
    }

    #[test]
    fn test_local_bucket_reports_local() {
        let bucket = TokenBucket::local();
        assert_eq!(bucket.storage_backend_kind(), StorageBackendKind::Local);
        assert!(!bucket.is_degraded());
    }
}
