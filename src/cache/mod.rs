//! In-process cache with TTL expiry and a byte ceiling, plus an optional
//! distributed second tier.

mod memory;
mod tiered;

pub use memory::{CacheStats, MemoryCache};
pub use tiered::{DistributedCache, InMemoryDistributedCache, TieredCache};

use crate::errors::{CacheError, ConfigurationError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ceiling on the summed size of all entries
    pub max_bytes: usize,
    /// Optional ceiling on the number of entries
    pub max_entries: Option<usize>,
    /// TTL applied when `set` is given none
    #[serde(rename = "default_ttl_secs", with = "crate::config::duration_format::secs")]
    pub default_ttl: Duration,
    /// How often expired entries are swept
    #[serde(rename = "sweep_interval_secs", with = "crate::config::duration_format::secs")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            max_entries: Some(1000),
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the byte ceiling
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    /// Set or clear the entry ceiling
    pub fn max_entries(mut self, entries: Option<usize>) -> Self {
        self.max_entries = entries;
        self
    }

    /// Set the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_bytes == 0 {
            return Err(ConfigurationError::invalid("cache max_bytes must be positive"));
        }
        if self.max_entries == Some(0) {
            return Err(ConfigurationError::invalid(
                "cache max_entries must be positive when set",
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigurationError::invalid("cache default_ttl must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "cache sweep_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Compile a glob where `*` matches any run of characters
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let translated = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", translated)).map_err(|source| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
