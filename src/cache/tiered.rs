use super::MemoryCache;
use crate::errors::CacheError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A shared cache reachable from several processes.
///
/// Values cross this boundary as JSON strings.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value for `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a value, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// Process-local [`DistributedCache`] for tests and local development
#[derive(Debug, Default)]
pub struct InMemoryDistributedCache {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryDistributedCache {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|(_, expires_at)| expires_at.map_or(true, |at| now < at))
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries.write().insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

/// Memory cache backed by an optional distributed tier.
///
/// Reads fall through to the distributed tier on a local miss and back-fill
/// the local tier on a hit there. Writes and deletes go to both tiers.
/// Distributed-tier failures are logged and otherwise ignored.
pub struct TieredCache<V> {
    local: Arc<MemoryCache<V>>,
    remote: Option<Arc<dyn DistributedCache>>,
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Wrap a local cache
    pub fn new(local: Arc<MemoryCache<V>>) -> Self {
        Self { local, remote: None }
    }

    /// Add a distributed tier
    pub fn with_distributed(mut self, remote: Arc<dyn DistributedCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// The local tier
    pub fn local(&self) -> &Arc<MemoryCache<V>> {
        &self.local
    }

    /// Read from the local tier, then the distributed one
    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }
        let remote = self.remote.as_ref()?;

        let encoded = match remote.get(key).await {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return None,
            Err(error) => {
                warn!(key, error = %error, "Distributed cache read failed");
                return None;
            }
        };

        let value: V = match serde_json::from_str(&encoded) {
            Ok(value) => value,
            Err(error) => {
                warn!(key, error = %error, "Distributed cache value could not be decoded");
                return None;
            }
        };

        if let Err(error) = self.local.set(key, value.clone(), None) {
            debug!(key, error = %error, "Could not back-fill local cache");
        } else {
            debug!(key, "Local cache back-filled from distributed tier");
        }
        Some(value)
    }

    /// Write to both tiers
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.local.config().default_ttl);
        let encoded = match &self.remote {
            Some(_) => Some(serde_json::to_string(&value).map_err(|source| {
                CacheError::Serialization {
                    key: key.to_string(),
                    source,
                }
            })?),
            None => None,
        };

        self.local.set(key, value, Some(ttl))?;

        if let (Some(remote), Some(encoded)) = (&self.remote, encoded) {
            if let Err(error) = remote.set(key, encoded, ttl).await {
                warn!(key, error = %error, "Distributed cache write failed");
            }
        }
        Ok(())
    }

    /// Delete from both tiers
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.local.delete(key);
        if let Some(remote) = &self.remote {
            match remote.delete(key).await {
                Ok(existed) => removed |= existed,
                Err(error) => warn!(key, error = %error, "Distributed cache delete failed"),
            }
        }
        removed
    }

    /// Invalidate matching keys in the local tier.
    ///
    /// The distributed tier has no pattern operation; its entries expire by
    /// TTL.
    pub fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        self.local.invalidate(pattern)
    }
}

impl<V> std::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.local)
            .field("distributed", &self.remote.is_some())
            .finish()
    }
}
