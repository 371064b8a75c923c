//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/model-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! The result is validated before it is returned; an invalid configuration
//! never reaches the gateway.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! socket_path = "/run/user/1000/model-gateway/gateway.sock"
//!
//! [executor]
//! attempt_timeout_ms = 30000
//! max_attempts = 3
//!
//! [quota]
//! reprobe_after_secs = 30
//! max_cas_attempts = 8
//!
//! [rate_limits.fallback]
//! requests = 100
//! window_secs = 60
//!
//! [rate_limits.endpoints.chat.free]
//! requests = 20
//! window_secs = 60
//!
//! [rate_limits.endpoints.voice.free]
//! disabled = true
//!
//! [tiers]
//! free = ["llama3.1-8b"]
//!
//! [[models]]
//! id = "llama3.1-8b"
//! provider = "ollama"
//! upstream_name = "llama3.1:8b"
//! quality_base = 0.68
//! cost_per_1k_tokens = 0.0
//! avg_latency_ms = 1200
//! capabilities = ["chat"]
//! max_context_tokens = 8192
//!
//! [providers.ollama]
//! kind = "ollama"
//! host = "localhost"
//! port = 11434
//!
//! [providers.openai]
//! kind = "openai_compatible"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT, DEFAULT_OPENAI_BASE_URL};
use crate::quota::{
    EndpointKind, RateLimitPolicy, TokenBucketConfig, DEFAULT_MAX_CAS_ATTEMPTS,
    DEFAULT_REPROBE_AFTER,
};
use crate::routing::{ExecutorConfig, ModelCatalog, ModelConfig, TierPolicy, HARD_ATTEMPT_CAP};
use crate::tier::Tier;

/// Default per-call HTTP timeout for provider clients
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Unix socket path the daemon listens on
    pub socket_path: Option<String>,
}

/// Executor section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorToml {
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: Option<u64>,

    /// Maximum attempts per request (1 to 3)
    pub max_attempts: Option<u32>,
}

/// Quota store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaToml {
    /// Seconds before a degraded bucket re-probes the remote store
    pub reprobe_after_secs: Option<u64>,

    /// Compare-and-set attempts per consume
    pub max_cas_attempts: Option<u32>,
}

/// One bucket in the TOML configuration
///
/// Either `requests` per `window_secs`, explicit `max_tokens` and
/// `refill_rate_per_second`, or `disabled = true`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketToml {
    /// Hard-disable the endpoint for this tier
    pub disabled: Option<bool>,

    /// Requests allowed per window
    pub requests: Option<u32>,

    /// Window length in seconds (default 60)
    pub window_secs: Option<u64>,

    /// Bucket capacity
    pub max_tokens: Option<f64>,

    /// Sustained refill rate
    pub refill_rate_per_second: Option<f64>,

    /// Refill granularity in milliseconds (default 1000)
    pub refill_interval_ms: Option<u64>,
}

impl BucketToml {
    fn to_config(&self, name: &str) -> Result<TokenBucketConfig, ConfigError> {
        if self.disabled == Some(true) {
            return Ok(TokenBucketConfig::disabled());
        }

        let mut config = match (self.requests, self.max_tokens, self.refill_rate_per_second) {
            (Some(requests), None, None) => TokenBucketConfig::per_window(
                requests,
                Duration::from_secs(self.window_secs.unwrap_or(60)),
            ),
            (None, Some(max_tokens), Some(rate)) => TokenBucketConfig::new(max_tokens, rate, 1_000),
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: set either `requests` (with optional `window_secs`) or both \
                     `max_tokens` and `refill_rate_per_second`"
                )))
            }
        };
        if self.window_secs == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "{name}: window_secs must be greater than zero"
            )));
        }
        if let Some(interval) = self.refill_interval_ms {
            config.refill_interval_ms = interval;
        }
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("{name}: {e}")))?;
        Ok(config)
    }
}

/// Rate limit section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsToml {
    /// Parameters for endpoints without an entry
    pub fallback: Option<BucketToml>,

    /// endpoint → tier → parameters
    pub endpoints: BTreeMap<String, BTreeMap<String, BucketToml>>,
}

/// Kind of provider client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Ollama `/api/chat`
    Ollama,
    /// OpenAI-style `/chat/completions`
    OpenaiCompatible,
}

/// One provider in the TOML configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderToml {
    /// Client kind
    pub kind: ProviderKind,

    /// Ollama host
    #[serde(default)]
    pub host: Option<String>,

    /// Ollama port
    #[serde(default)]
    pub port: Option<u16>,

    /// API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-call HTTP timeout in milliseconds
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Server section
    pub server: ServerToml,

    /// Executor section
    pub executor: ExecutorToml,

    /// Quota store section
    pub quota: QuotaToml,

    /// Rate limits
    pub rate_limits: RateLimitsToml,

    /// Tier name → allowed model ids
    pub tiers: BTreeMap<String, Vec<String>>,

    /// Model catalog; replaces the built-in catalog when present
    pub models: Option<Vec<ModelConfig>>,

    /// Provider name → client settings
    pub providers: BTreeMap<String, ProviderToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Quota store tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaSettings {
    /// Cool-down before re-probing an unavailable remote store
    pub reprobe_after: Duration,
    /// Compare-and-set attempts per consume
    pub max_cas_attempts: u32,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            reprobe_after: DEFAULT_REPROBE_AFTER,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }
}

/// Resolved client settings for one provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderSettings {
    /// Ollama server
    Ollama {
        /// Host name
        host: String,
        /// Port
        port: u16,
        /// Per-call HTTP timeout
        request_timeout: Duration,
    },
    /// OpenAI-compatible API
    OpenaiCompatible {
        /// API base URL
        base_url: String,
        /// Environment variable holding the API key
        api_key_env: Option<String>,
        /// Per-call HTTP timeout
        request_timeout: Duration,
    },
}

impl ProviderSettings {
    fn from_toml(name: &str, toml: &ProviderToml) -> Self {
        let request_timeout = toml
            .request_timeout_ms
            .map_or(DEFAULT_PROVIDER_TIMEOUT, Duration::from_millis);
        match toml.kind {
            ProviderKind::Ollama => Self::Ollama {
                host: toml
                    .host
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string()),
                port: toml.port.unwrap_or(DEFAULT_OLLAMA_PORT),
                request_timeout,
            },
            ProviderKind::OpenaiCompatible => Self::OpenaiCompatible {
                base_url: toml
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                api_key_env: toml
                    .api_key_env
                    .clone()
                    .or_else(|| Some(format!("{}_API_KEY", name.to_ascii_uppercase()))),
                request_timeout,
            },
        }
    }
}

fn default_providers() -> BTreeMap<String, ProviderSettings> {
    BTreeMap::from([
        (
            "ollama".to_string(),
            ProviderSettings::Ollama {
                host: DEFAULT_OLLAMA_HOST.to_string(),
                port: DEFAULT_OLLAMA_PORT,
                request_timeout: DEFAULT_PROVIDER_TIMEOUT,
            },
        ),
        (
            "openai".to_string(),
            ProviderSettings::OpenaiCompatible {
                base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                request_timeout: DEFAULT_PROVIDER_TIMEOUT,
            },
        ),
        (
            "anthropic".to_string(),
            ProviderSettings::OpenaiCompatible {
                base_url: "https://api.anthropic.com/v1".to_string(),
                api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                request_timeout: DEFAULT_PROVIDER_TIMEOUT,
            },
        ),
    ])
}

/// Centralized configuration for the gateway
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Unix socket the daemon listens on (daemon picks a default if unset)
    pub socket_path: Option<PathBuf>,

    /// Fallback executor tuning
    pub executor: ExecutorConfig,

    /// Quota store tuning
    pub quota: QuotaSettings,

    /// Rate limit table
    pub rate_limits: RateLimitPolicy,

    /// Model catalog entries, in declaration order
    pub models: Vec<ModelConfig>,

    /// Tier → allowed models
    pub tiers: TierPolicy,

    /// Provider name → client settings
    pub providers: BTreeMap<String, ProviderSettings>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            executor: ExecutorConfig::default(),
            quota: QuotaSettings::default(),
            rate_limits: RateLimitPolicy::defaults(),
            models: ModelCatalog::default_models(),
            tiers: TierPolicy::defaults(),
            providers: default_providers(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Build the model catalog
    pub fn catalog(&self) -> Result<ModelCatalog, ConfigError> {
        ModelCatalog::new(self.models.clone())
    }

    /// Check every section; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "executor.attempt_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !(1..=HARD_ATTEMPT_CAP).contains(&self.executor.max_attempts) {
            return Err(ConfigError::ValidationError(format!(
                "executor.max_attempts must be between 1 and {HARD_ATTEMPT_CAP} (got {})",
                self.executor.max_attempts
            )));
        }
        if self.quota.max_cas_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "quota.max_cas_attempts must be greater than zero".to_string(),
            ));
        }

        self.rate_limits.validate()?;
        let catalog = self.catalog()?;
        self.tiers.validate(&catalog)?;

        for provider in catalog.providers() {
            if !self.providers.contains_key(provider) {
                tracing::warn!(
                    provider,
                    "Catalog references a provider with no client settings; its models will always fail"
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/model-gateway/gateway.toml` or
/// `~/.config/model-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("model-gateway").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration is invalid. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) -> Result<(), ConfigError> {
    if let Some(ref path) = toml.server.socket_path {
        config.socket_path = Some(PathBuf::from(path));
    }

    if let Some(ms) = toml.executor.attempt_timeout_ms {
        config.executor.attempt_timeout = Duration::from_millis(ms);
    }
    if let Some(attempts) = toml.executor.max_attempts {
        config.executor.max_attempts = attempts;
    }

    if let Some(secs) = toml.quota.reprobe_after_secs {
        config.quota.reprobe_after = Duration::from_secs(secs);
    }
    if let Some(attempts) = toml.quota.max_cas_attempts {
        config.quota.max_cas_attempts = attempts;
    }

    if let Some(ref fallback) = toml.rate_limits.fallback {
        config
            .rate_limits
            .set_fallback(fallback.to_config("rate_limits.fallback")?);
    }
    for (endpoint, tiers) in &toml.rate_limits.endpoints {
        for (tier_name, bucket) in tiers {
            let name = format!("rate_limits.endpoints.{endpoint}.{tier_name}");
            let tier: Tier = tier_name
                .parse()
                .map_err(|e| ConfigError::ValidationError(format!("{name}: {e}")))?;
            config
                .rate_limits
                .set_limit(EndpointKind::new(endpoint), tier, bucket.to_config(&name)?);
        }
    }

    if let Some(ref models) = toml.models {
        config.models = models.clone();
    }
    for (tier_name, models) in &toml.tiers {
        let tier: Tier = tier_name
            .parse()
            .map_err(|e| ConfigError::ValidationError(format!("tiers.{tier_name}: {e}")))?;
        config.tiers.set_tier(tier, models.iter().cloned());
    }

    for (name, provider) in &toml.providers {
        config
            .providers
            .insert(name.clone(), ProviderSettings::from_toml(name, provider));
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = raw, "Ignoring unparseable environment override");
    }
    parsed
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut GatewayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env("GATEWAY_SOCKET") {
        config.socket_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }

    // Executor settings from environment
    if let Some(ms) = env("GATEWAY_ATTEMPT_TIMEOUT_MS").and_then(|v| parse_env::<u64>("GATEWAY_ATTEMPT_TIMEOUT_MS", &v)) {
        config.executor.attempt_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env("GATEWAY_MAX_ATTEMPTS").and_then(|v| parse_env::<u32>("GATEWAY_MAX_ATTEMPTS", &v)) {
        config.executor.max_attempts = n;
        config.source = ConfigSource::Env;
    }

    // Quota settings from environment
    if let Some(secs) = env("GATEWAY_QUOTA_REPROBE_SECS").and_then(|v| parse_env::<u64>("GATEWAY_QUOTA_REPROBE_SECS", &v)) {
        config.quota.reprobe_after = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Ollama endpoint from environment
    let host = env("GATEWAY_OLLAMA_HOST");
    let port = env("GATEWAY_OLLAMA_PORT").and_then(|v| parse_env::<u16>("GATEWAY_OLLAMA_PORT", &v));
    if host.is_some() || port.is_some() {
        let entry = config
            .providers
            .entry("ollama".to_string())
            .or_insert_with(|| ProviderSettings::Ollama {
                host: DEFAULT_OLLAMA_HOST.to_string(),
                port: DEFAULT_OLLAMA_PORT,
                request_timeout: DEFAULT_PROVIDER_TIMEOUT,
            });
        if let ProviderSettings::Ollama {
            host: current_host,
            port: current_port,
            ..
        } = entry
        {
            if let Some(host) = host {
                *current_host = host;
            }
            if let Some(port) = port {
                *current_port = port;
            }
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
/// Call [`GatewayConfig::validate`] again afterwards.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,

    /// Attempt timeout override (milliseconds)
    pub attempt_timeout_ms: Option<u64>,

    /// Max attempts override
    pub max_attempts: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set attempt timeout override
    #[must_use]
    pub fn with_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = Some(ms);
        self
    }

    /// Set max attempts override
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.socket_path.is_some()
            || self.attempt_timeout_ms.is_some()
            || self.max_attempts.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = Some(path.clone());
        }
        if let Some(ms) = self.attempt_timeout_ms {
            config.executor.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.max_attempts {
            config.executor.max_attempts = attempts;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
