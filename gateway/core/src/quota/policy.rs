//! Rate Limit Policy
//!
//! Static lookup from (endpoint kind, tier) to bucket parameters, with one
//! generic fallback for endpoints that have no entry of their own.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bucket::TokenBucketConfig;
use crate::config::ConfigError;
use crate::tier::Tier;

// ============================================================================
// Endpoint Kinds
// ============================================================================

/// Class of inbound endpoint a quota applies to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKind(String);

impl EndpointKind {
    /// Any endpoint kind, normalized to lowercase
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    /// Chat completions
    #[must_use]
    pub fn chat() -> Self {
        Self::new("chat")
    }

    /// Document uploads and processing
    #[must_use]
    pub fn documents() -> Self {
        Self::new("documents")
    }

    /// Voice sessions
    #[must_use]
    pub fn voice() -> Self {
        Self::new("voice")
    }

    /// Search queries
    #[must_use]
    pub fn search() -> Self {
        Self::new("search")
    }

    /// The normalized name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Address of one bucket: `rl:{endpoint}:{tier}:{identifier}`
///
/// `%` and `:` inside the endpoint and identifier are percent-encoded, so
/// distinct (endpoint, tier, identifier) triples never share a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

/// Percent-encode the key separator and the escape character
fn escape_key_part(part: &str) -> std::borrow::Cow<'_, str> {
    if part.contains([':', '%']) {
        part.replace('%', "%25").replace(':', "%3A").into()
    } else {
        part.into()
    }
}

impl RateLimitKey {
    /// Build the key for a caller on an endpoint
    #[must_use]
    pub fn new(endpoint: &EndpointKind, identifier: &str, tier: Tier) -> Self {
        Self(format!(
            "rl:{}:{tier}:{}",
            escape_key_part(endpoint.as_str()),
            escape_key_part(identifier)
        ))
    }

    /// The key as stored
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Policy Table
// ============================================================================

/// (endpoint, tier) → bucket parameters
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitPolicy {
    table: HashMap<(EndpointKind, Tier), TokenBucketConfig>,
    fallback: TokenBucketConfig,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::defaults()
    }
}

impl RateLimitPolicy {
    /// Empty table with only a fallback
    #[must_use]
    pub fn new(fallback: TokenBucketConfig) -> Self {
        Self {
            table: HashMap::new(),
            fallback,
        }
    }

    /// Add or replace one entry
    #[must_use]
    pub fn with_limit(mut self, endpoint: EndpointKind, tier: Tier, config: TokenBucketConfig) -> Self {
        self.set_limit(endpoint, tier, config);
        self
    }

    /// Add or replace one entry in place
    pub fn set_limit(&mut self, endpoint: EndpointKind, tier: Tier, config: TokenBucketConfig) {
        self.table.insert((endpoint, tier), config);
    }

    /// Replace the fallback parameters
    pub fn set_fallback(&mut self, fallback: TokenBucketConfig) {
        self.fallback = fallback;
    }

    /// Built-in production table
    #[must_use]
    pub fn defaults() -> Self {
        let minute = Duration::from_secs(60);
        let hour = Duration::from_secs(3_600);
        let per = TokenBucketConfig::per_window;

        let rows: [(EndpointKind, [TokenBucketConfig; 4]); 4] = [
            (
                EndpointKind::chat(),
                [per(20, minute), per(60, minute), per(200, minute), per(1_000, minute)],
            ),
            (
                EndpointKind::documents(),
                [per(5, hour), per(50, hour), per(200, hour), per(1_000, hour)],
            ),
            (
                EndpointKind::voice(),
                [
                    TokenBucketConfig::disabled(),
                    per(10, minute),
                    per(60, minute),
                    per(300, minute),
                ],
            ),
            (
                EndpointKind::search(),
                [per(30, minute), per(120, minute), per(600, minute), per(3_000, minute)],
            ),
        ];

        let mut policy = Self::new(per(100, minute));
        for (endpoint, configs) in rows {
            for (tier, config) in Tier::ALL.into_iter().zip(configs) {
                policy.set_limit(endpoint.clone(), tier, config);
            }
        }
        policy
    }

    /// Parameters for a caller on an endpoint
    #[must_use]
    pub fn lookup(&self, endpoint: &EndpointKind, tier: Tier) -> &TokenBucketConfig {
        self.table
            .get(&(endpoint.clone(), tier))
            .unwrap_or(&self.fallback)
    }

    /// Generic parameters for unlisted endpoints
    #[must_use]
    pub fn fallback(&self) -> &TokenBucketConfig {
        &self.fallback
    }

    /// Number of explicit entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether only the fallback is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Validate every entry and the fallback
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fallback.validate().map_err(|e| {
            ConfigError::ValidationError(format!("rate_limits.fallback: {e}"))
        })?;
        for ((endpoint, tier), config) in &self.table {
            config.validate().map_err(|e| {
                ConfigError::ValidationError(format!("rate_limits.{endpoint}.{tier}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = RateLimitKey::new(&EndpointKind::chat(), "user-42", Tier::Pro);
        assert_eq!(key.as_str(), "rl:chat:pro:user-42");
    }

    #[test]
    fn test_key_parts_cannot_collide() {
        let short_endpoint = RateLimitKey::new(&EndpointKind::new("a"), "x:free:y", Tier::Free);
        let long_endpoint = RateLimitKey::new(&EndpointKind::new("a:free:x"), "y", Tier::Free);
        assert_ne!(short_endpoint, long_endpoint);
        assert_eq!(short_endpoint.as_str(), "rl:a:free:x%3Afree%3Ay");
        assert_eq!(long_endpoint.as_str(), "rl:a%3Afree%3Ax:free:y");

        // The escape character itself is escaped
        assert_ne!(
            RateLimitKey::new(&EndpointKind::chat(), "u%3A1", Tier::Free),
            RateLimitKey::new(&EndpointKind::chat(), "u:1", Tier::Free)
        );
    }

    #[test]
    fn test_endpoint_kind_normalized() {
        assert_eq!(EndpointKind::new(" Chat "), EndpointKind::chat());
    }

    #[test]
    fn test_defaults_lookup() {
        let policy = RateLimitPolicy::defaults();
        assert_eq!(policy.len(), 16);

        let chat_free = policy.lookup(&EndpointKind::chat(), Tier::Free);
        assert_eq!(chat_free.max_tokens, 20.0);

        let docs_pro = policy.lookup(&EndpointKind::documents(), Tier::Pro);
        assert_eq!(docs_pro.max_tokens, 200.0);

        assert!(policy.lookup(&EndpointKind::voice(), Tier::Free).is_disabled());
        assert!(!policy.lookup(&EndpointKind::voice(), Tier::Basic).is_disabled());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_unlisted_endpoint_uses_fallback() {
        let policy = RateLimitPolicy::defaults();
        let config = policy.lookup(&EndpointKind::new("export"), Tier::Enterprise);
        assert_eq!(config, policy.fallback());
        assert_eq!(config.max_tokens, 100.0);
    }

    #[test]
    fn test_validate_names_bad_entry() {
        let policy = RateLimitPolicy::defaults().with_limit(
            EndpointKind::search(),
            Tier::Basic,
            TokenBucketConfig::new(10.0, -1.0, 1_000),
        );
        let err = policy.validate().unwrap_err().to_string();
        assert!(err.contains("rate_limits.search.basic"), "{err}");
    }
}
