//! Quota Store Boundary
//!
//! Bucket state lives in a key-value store shared by every request-handling
//! unit. The concrete remote client (Redis, Memcached, a database table...)
//! is supplied by the embedding application through [`QuotaStore`]; this
//! module ships the in-process [`LocalStore`] used standalone and as the
//! degraded-mode fallback.
//!
//! # Atomicity
//!
//! [`QuotaStore::compare_and_set`] is the only write the token bucket relies
//! on for correctness. Implementations must apply it atomically: the value is
//! written only if the stored value still equals `expected` (`None` meaning
//! "absent or expired").

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Which kind of store an implementation is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Shared across gateway instances
    Remote,
    /// Private to this process
    Local,
}

/// Errors from a quota store or a bucket operation on it
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("quota store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded
    #[error("corrupted bucket state at {key}: {reason}")]
    Corrupted {
        /// The key holding the bad value
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Conditional writes kept losing to concurrent writers
    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention {
        /// The contended key
        key: String,
        /// Number of compare-and-set attempts made
        attempts: u32,
    },

    /// A consume asked for a zero, negative or non-finite number of tokens
    #[error("token cost must be positive and finite, got {cost}")]
    InvalidCost {
        /// The rejected cost
        cost: f64,
    },
}

impl StoreError {
    /// Whether the error means the store itself is unreachable
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Shared key-value capability used for bucket state
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Whether this store is shared across instances
    fn kind(&self) -> StoreKind;

    /// Read a value; expired entries read as absent
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a value with a time-to-live
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a value (absent keys are not an error)
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically write `value` only if the current value equals `expected`
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

// =============================================================================
// Local Store
// =============================================================================

#[derive(Clone, Debug)]
struct LocalEntry {
    value: String,
    expires_at: Instant,
}

impl LocalEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Writes between opportunistic sweeps of expired entries
pub const DEFAULT_PURGE_INTERVAL: u64 = 1_024;

/// In-process quota store
///
/// Each key's shard is write-locked for the duration of a conditional
/// update, which makes `compare_and_set` atomic across threads.
///
/// Keys that are written once and never read again would otherwise stay
/// resident, so every `purge_interval` writes the store sweeps out expired
/// entries.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::with_purge_interval(DEFAULT_PURGE_INTERVAL)
    }
}

impl LocalStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that sweeps expired entries every `interval` writes
    #[must_use]
    pub fn with_purge_interval(interval: u64) -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            purge_interval: interval.max(1),
        }
    }

    /// Number of stored entries, including any not yet purged after expiry
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Count a write and sweep when the interval comes round
    ///
    /// Must not be called while holding an entry guard.
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = self.entries.len(), "Purged expired quota entries");
            }
        }
    }
}

#[async_trait]
impl QuotaStore for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone());

        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), LocalEntry::new(value, ttl));
        self.after_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let matches = {
                    let entry = occupied.get();
                    let current = if entry.is_expired(now) {
                        None
                    } else {
                        Some(entry.value.as_str())
                    };
                    current == expected
                };
                if matches {
                    occupied.insert(LocalEntry::new(value, ttl));
                }
                matches
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(LocalEntry::new(value, ttl));
                }
                expected.is_none()
            }
        };
        // The shard guard is released here; the sweep locks every shard
        if written {
            self.after_write();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = LocalStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set_with_ttl("k", "v1", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set_on_absent_key() {
        let store = LocalStore::new();

        assert!(!store.compare_and_set("k", Some("x"), "v", TTL).await.unwrap());
        assert!(store.compare_and_set("k", None, "v", TTL).await.unwrap());
        // A second "create if absent" must lose
        assert!(!store.compare_and_set("k", None, "w", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_current_value() {
        let store = LocalStore::new();
        store.set_with_ttl("k", "v1", TTL).await.unwrap();

        assert!(!store.compare_and_set("k", Some("stale"), "v2", TTL).await.unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let store = LocalStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        // An expired value counts as absent for conditional writes too
        store
            .set_with_ttl("j", "old", Duration::from_millis(0))
            .await
            .unwrap();
        assert!(store.compare_and_set("j", None, "new", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = LocalStore::new();
        store
            .set_with_ttl("gone", "v", Duration::from_millis(0))
            .await
            .unwrap();
        store.set_with_ttl("kept", "v", TTL).await.unwrap();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_reclaim_expired_keys_never_read_again() {
        let store = LocalStore::with_purge_interval(16);
        store.set_with_ttl("kept", "v", TTL).await.unwrap();

        // One-off callers: each key is written once and never looked up
        for i in 0..1_000 {
            let key = format!("rl:chat:free:caller-{i}");
            assert!(store
                .compare_and_set(&key, None, "v", Duration::ZERO)
                .await
                .unwrap());
        }

        // At most one interval's worth of stragglers remains
        assert!(store.len() <= 17, "store kept {} entries", store.len());
        assert_eq!(store.get("kept").await.unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(!StoreError::Contention {
            key: "k".into(),
            attempts: 3
        }
        .is_unavailable());
    }
}
