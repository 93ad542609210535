//! Aggregate configuration for the resilience layer.
//!
//! [`ResilienceConfig`] gathers the per-key rate limits and the per-service
//! circuit breaker, bulkhead and retry settings, plus the settings of the
//! shared components. It is read from JSON; durations are integer
//! milliseconds (`*_ms`) and cache TTLs integer seconds (`*_secs`).

pub mod duration_format;

use crate::cache::CacheConfig;
use crate::errors::ConfigurationError;
use crate::resilience::{
    BulkheadConfig, BulkheadRegistryConfig, CircuitBreakerConfig, RateLimitPolicy,
    RateLimiterConfig, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a JSON configuration file
pub const CONFIG_FILE_ENV: &str = "RESILIENCE_CONFIG_FILE";
/// Environment override for [`CacheConfig::max_bytes`]
pub const CACHE_MAX_BYTES_ENV: &str = "RESILIENCE_CACHE_MAX_BYTES";
/// Environment override for [`CacheConfig::default_ttl`], in seconds
pub const CACHE_DEFAULT_TTL_ENV: &str = "RESILIENCE_CACHE_DEFAULT_TTL_SECS";
/// Environment override for [`CacheConfig::sweep_interval`], in seconds
pub const CACHE_SWEEP_INTERVAL_ENV: &str = "RESILIENCE_CACHE_SWEEP_INTERVAL_SECS";

/// Serializable form of a [`RateLimitPolicy`] keyed by a prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Window size in milliseconds
    pub window_ms: u64,
    /// Maximum requests per window
    pub max_requests: u32,
    /// Namespace prepended to identifiers, as `prefix:identifier`
    pub key_prefix: String,
    /// User-facing rejection message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitSettings {
    /// Build the policy these settings describe
    pub fn to_policy(&self) -> Result<RateLimitPolicy, ConfigurationError> {
        let mut builder = RateLimitPolicy::builder()
            .window(Duration::from_millis(self.window_ms))
            .max_requests(self.max_requests)
            .key_prefix(self.key_prefix.as_str());
        if let Some(message) = &self.message {
            builder = builder.message(message.as_str());
        }
        builder.build()
    }

    fn from_policy(prefix: &str, policy: &RateLimitPolicy) -> Self {
        Self {
            window_ms: u64::try_from(policy.window().as_millis()).unwrap_or(u64::MAX),
            max_requests: policy.max_requests(),
            key_prefix: prefix.to_string(),
            message: Some(policy.message().to_string()),
        }
    }
}

/// Configuration for every resilience component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Rate limit policies by name
    pub rate_limits: HashMap<String, RateLimitSettings>,
    /// Circuit breaker settings by service
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    /// Bulkhead settings by service
    pub bulkheads: HashMap<String, BulkheadConfig>,
    /// Retry policies by service
    pub retry: HashMap<String, RetryPolicy>,
    /// Circuit breaker settings for services without an entry
    pub default_circuit_breaker: CircuitBreakerConfig,
    /// Bulkhead settings for services without an entry
    pub default_bulkhead: BulkheadConfig,
    /// Retry policy for services without an entry
    pub default_retry: RetryPolicy,
    /// Memory cache
    pub cache: CacheConfig,
    /// Rate limiter maintenance
    pub rate_limiter: RateLimiterConfig,
    /// Bulkhead registry maintenance
    pub bulkhead_registry: BulkheadRegistryConfig,
}

impl ResilienceConfig {
    /// Create an empty configuration where every service uses the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rate limit policy under `name`
    pub fn with_rate_limit(mut self, name: impl Into<String>, settings: RateLimitSettings) -> Self {
        self.rate_limits.insert(name.into(), settings);
        self
    }

    /// Register circuit breaker settings for `service`
    pub fn with_circuit_breaker(
        mut self,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.circuit_breakers.insert(service.into(), config);
        self
    }

    /// Register bulkhead settings for `service`
    pub fn with_bulkhead(mut self, service: impl Into<String>, config: BulkheadConfig) -> Self {
        self.bulkheads.insert(service.into(), config);
        self
    }

    /// Register a retry policy for `service`
    pub fn with_retry(mut self, service: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry.insert(service.into(), policy);
        self
    }

    /// Set the bulkhead settings used for unlisted services
    pub fn with_default_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.default_bulkhead = config;
        self
    }

    /// Set the cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Configuration with the built-in presets for the usual dependencies.
    ///
    /// Rate limits `ip`, `user`, `phone` and `external_api`; bulkheads and
    /// retry policies for `database`, `document_service` and `messaging`,
    /// plus a `text_generation` bulkhead.
    pub fn reference() -> Self {
        let rate_limits = [
            ("ip", "ip", RateLimitPolicy::per_ip()),
            ("user", "user", RateLimitPolicy::per_user()),
            ("phone", "phone", RateLimitPolicy::per_phone()),
            ("external_api", "api", RateLimitPolicy::external_api()),
        ]
        .into_iter()
        .map(|(name, prefix, policy)| {
            (name.to_string(), RateLimitSettings::from_policy(prefix, &policy))
        })
        .collect();

        let bulkheads = [
            ("database", BulkheadConfig::database()),
            ("document_service", BulkheadConfig::document_service()),
            ("messaging", BulkheadConfig::messaging()),
            ("text_generation", BulkheadConfig::text_generation()),
        ]
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect();

        let retry = [
            ("database", RetryPolicy::database()),
            ("document_service", RetryPolicy::document_service()),
            ("messaging", RetryPolicy::messaging()),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();

        Self {
            rate_limits,
            bulkheads,
            retry,
            ..Self::default()
        }
    }

    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded resilience configuration file");
        Self::from_json(&json)
    }

    /// Load configuration from environment variables.
    ///
    /// Starts from the file named by `RESILIENCE_CONFIG_FILE` when set, or
    /// from the defaults, then applies the cache overrides.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Some(bytes) = env_number::<usize>(CACHE_MAX_BYTES_ENV)? {
            config.cache.max_bytes = bytes;
        }
        if let Some(secs) = env_number::<u64>(CACHE_DEFAULT_TTL_ENV)? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number::<u64>(CACHE_SWEEP_INTERVAL_ENV)? {
            config.cache.sweep_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, settings) in &self.rate_limits {
            settings
                .to_policy()
                .map_err(|e| ConfigurationError::invalid(format!("rate limit {}: {}", name, e)))?;
        }
        for (service, config) in &self.circuit_breakers {
            config.validate().map_err(|e| {
                ConfigurationError::invalid(format!("circuit breaker {}: {}", service, e))
            })?;
        }
        for (service, config) in &self.bulkheads {
            config
                .validate()
                .map_err(|e| ConfigurationError::invalid(format!("bulkhead {}: {}", service, e)))?;
        }
        for (service, policy) in &self.retry {
            policy
                .validate()
                .map_err(|e| ConfigurationError::invalid(format!("retry {}: {}", service, e)))?;
        }
        self.default_circuit_breaker.validate()?;
        self.default_bulkhead.validate()?;
        self.default_retry.validate()?;
        self.cache.validate()?;
        self.rate_limiter.validate()?;
        self.bulkhead_registry.validate()
    }

    /// Rate limit policy registered under `name`
    pub fn rate_limit_policy(
        &self,
        name: &str,
    ) -> Result<Option<RateLimitPolicy>, ConfigurationError> {
        self.rate_limits
            .get(name)
            .map(RateLimitSettings::to_policy)
            .transpose()
    }

    /// Circuit breaker settings for `service`
    pub fn circuit_breaker_for(&self, service: &str) -> CircuitBreakerConfig {
        self.circuit_breakers
            .get(service)
            .unwrap_or(&self.default_circuit_breaker)
            .clone()
    }

    /// Bulkhead settings for `service`
    pub fn bulkhead_for(&self, service: &str) -> BulkheadConfig {
        self.bulkheads
            .get(service)
            .unwrap_or(&self.default_bulkhead)
            .clone()
    }

    /// Retry policy for `service`
    pub fn retry_for(&self, service: &str) -> RetryPolicy {
        self.retry.get(service).unwrap_or(&self.default_retry).clone()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigurationError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ConfigurationError::EnvVar(format!("{} is not a valid number: {}", name, raw))
            }),
        Err(_) => Ok(None),
    }
}
