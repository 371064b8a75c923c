//! Subscription Tiers
//!
//! A tier bounds both feature access (which models may serve a tenant) and
//! quotas (which bucket parameters apply). Tiers are totally ordered from the
//! most restrictive (`Free`) to the least (`Enterprise`).
//!
//! Tier strings arrive from an external identity collaborator and are not
//! trusted: anything unrecognized resolves to the most restrictive tier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Subscription class of a tenant
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free plan, most restrictive
    #[default]
    Free,
    /// Entry-level paid plan
    Basic,
    /// Professional plan
    Pro,
    /// Enterprise plan, least restrictive
    Enterprise,
}

impl Tier {
    /// All known tiers, most restrictive first
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];

    /// The tier used whenever a tier string cannot be recognized
    #[must_use]
    pub const fn most_restrictive() -> Self {
        Self::Free
    }

    /// Canonical lowercase name, used in rate-limit keys and config files
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Resolve an untrusted tier string, falling back to the most restrictive tier
    #[must_use]
    pub fn resolve(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(tier = raw, "Unrecognized tier, applying most restrictive tier");
            Self::most_restrictive()
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known tier name
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" | "starter" => Ok(Self::Basic),
            "pro" | "professional" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}
