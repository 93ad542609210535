use super::{glob_to_regex, CacheConfig};
use crate::errors::{CacheError, ConfigurationError};
use crate::events::{EventBus, ResilienceEvent};
use crate::resilience::sweep::{spawn_sweep, SweepHandles};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    /// `None` when the TTL reaches past the clock's range
    expires_at: Option<Instant>,
    access_count: u64,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    most_recent: Option<String>,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        if self.most_recent.as_deref() == Some(key) {
            self.most_recent = None;
        }
        Some(entry)
    }

    /// Evict until `bytes` are free and `entries` slots are open. Least
    /// accessed entries go first, oldest first among equals, and the most
    /// recently read entry goes last.
    fn evict(&mut self, bytes: usize, entries: usize) -> (usize, usize) {
        let mut candidates: Vec<(bool, u64, Instant, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let is_most_recent = self.most_recent.as_deref() == Some(key.as_str());
                (is_most_recent, entry.access_count, entry.created_at, key.clone())
            })
            .collect();
        candidates.sort();

        let mut evicted = 0;
        let mut freed = 0;
        for (_, _, _, key) in candidates {
            if freed >= bytes && evicted >= entries {
                break;
            }
            if let Some(entry) = self.remove(&key) {
                freed += entry.size_bytes;
                evicted += 1;
                debug!(key = %key, size_bytes = entry.size_bytes, "Cache eviction");
            }
        }
        self.evictions += evicted as u64;
        (evicted, freed)
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Live entries, expired ones not yet removed included
    pub entries: usize,
    /// Summed size of all entries
    pub total_bytes: usize,
    /// Reads that found a live entry
    pub hits: u64,
    /// Reads that found nothing or an expired entry
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Hits as a percentage of all reads
    pub hit_rate: f64,
}

/// Single-tier in-process cache.
///
/// Entry size is the length of the value's JSON encoding, doubled to
/// approximate in-memory string storage. The summed size never exceeds
/// [`CacheConfig::max_bytes`].
pub struct MemoryCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    events: Option<Arc<EventBus>>,
    sweeps: SweepHandles,
}

impl<V> MemoryCache<V>
where
    V: Serialize + Clone,
{
    /// Create a cache
    pub fn new(config: CacheConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                most_recent: None,
            }),
            events: None,
            sweeps: SweepHandles::default(),
        })
    }

    /// Publish evictions and expiry sweeps on an event bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a live entry
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(expired) = state.entries.get(key).map(|entry| entry.is_expired(now)) else {
            state.misses += 1;
            debug!(key, "Cache miss");
            return None;
        };

        if expired {
            state.remove(key);
            state.misses += 1;
            state.expirations += 1;
            debug!(key, "Cache entry expired on read");
            return None;
        }

        state.hits += 1;
        state.most_recent = Some(key.to_string());
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        debug!(key, access_count = entry.access_count, "Cache hit");
        Some(entry.value.clone())
    }

    /// Store a value, evicting others if the ceiling would be exceeded
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let size_bytes = serialized_size(key, &value)?;
        if size_bytes > self.config.max_bytes {
            return Err(CacheError::ValueTooLarge {
                key: key.to_string(),
                size: size_bytes,
                capacity: self.config.max_bytes,
            });
        }

        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let (evicted, freed) = {
            let mut state = self.state.lock();
            state.remove(key);

            let bytes_needed =
                (state.total_bytes + size_bytes).saturating_sub(self.config.max_bytes);
            let entries_needed = self
                .config
                .max_entries
                .map(|max| (state.entries.len() + 1).saturating_sub(max))
                .unwrap_or(0);
            let evicted = if bytes_needed > 0 || entries_needed > 0 {
                state.evict(bytes_needed, entries_needed)
            } else {
                (0, 0)
            };

            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    created_at: now,
                    expires_at: now.checked_add(ttl),
                    access_count: 0,
                    size_bytes,
                },
            );
            state.total_bytes += size_bytes;
            evicted
        };

        debug!(key, size_bytes, ttl_secs = ttl.as_secs(), "Cache set");
        if evicted > 0 {
            debug!(count = evicted, freed_bytes = freed, "Cache evicted entries");
            self.emit(ResilienceEvent::CacheEvicted {
                count: evicted,
                freed_bytes: freed,
            });
        }
        Ok(())
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry whose key matches a glob where `*` matches any run
    /// of characters
    pub fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        debug!(pattern, removed = keys.len(), "Cache invalidated");
        Ok(keys.len())
    }

    /// Whether a live entry exists, without counting as an access
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry and reset statistics
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.total_bytes = 0;
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.expirations = 0;
        state.most_recent = None;
        debug!(removed, "Cache cleared");
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let reads = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_rate: if reads == 0 {
                0.0
            } else {
                state.hits as f64 / reads as f64 * 100.0
            },
        }
    }

    /// Remove every expired entry
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.remove(key);
            }
            state.expirations += expired.len() as u64;
            expired.len()
        };

        if removed > 0 {
            debug!(removed, "Cache cleanup removed expired entries");
            self.emit(ResilienceEvent::CacheExpired { count: removed });
        }
        removed
    }

    fn emit(&self, event: ResilienceEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Serialize + Clone + Send + 'static,
{
    /// Start the periodic expiry sweep. Requires a Tokio runtime.
    pub fn start_sweep(self: &Arc<Self>) {
        let handle = spawn_sweep(
            self,
            self.config.sweep_interval,
            "cache_expiry",
            |cache: &MemoryCache<V>| {
                cache.sweep_expired();
            },
        );
        self.sweeps.push(handle);
    }

    /// Stop the expiry sweep
    pub fn shutdown(&self) {
        self.sweeps.abort_all();
    }
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCache")
            .field("config", &self.config)
            .field("entries", &state.entries.len())
            .field("total_bytes", &state.total_bytes)
            .finish()
    }
}

fn serialized_size<V: Serialize>(key: &str, value: &V) -> Result<usize, CacheError> {
    let encoded = serde_json::to_string(value).map_err(|source| CacheError::Serialization {
        key: key.to_string(),
        source,
    })?;
    Ok(encoded.len() * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelListener;
    use pretty_assertions::assert_eq;

    /// `"xxxxxxxx"` encodes to 10 JSON bytes, so 20 accounted bytes
    const ENTRY_BYTES: usize = 20;

    fn value() -> String {
        "x".repeat(8)
    }

    fn cache(max_entries: Option<usize>) -> MemoryCache<String> {
        MemoryCache::new(
            CacheConfig::new()
                .max_bytes(ENTRY_BYTES * 3)
                .max_entries(max_entries),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_round_trip() {
        let cache = cache(None);
        cache.set("k", value(), Some(Duration::from_secs(1))).unwrap();
        assert_eq!(cache.get("k"), Some(value()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let cache =
            MemoryCache::new(CacheConfig::new().default_ttl(Duration::from_secs(10))).unwrap();
        cache.set("k", 1u32, None).unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.contains("k"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let cache = MemoryCache::new(CacheConfig::default()).unwrap();
        cache.set("k", 1u32, Some(Duration::MAX)).unwrap();

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(cache.contains("k"));
        assert_eq!(cache.get("k"), Some(1));
        assert_eq!(cache.sweep_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_spares_most_recently_read() {
        let cache = cache(None);
        cache.set("a", value(), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("b", value(), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("c", value(), None).unwrap();

        cache.get("b");
        cache.get("b");
        cache.get("a");

        cache.set("d", value(), None).unwrap();

        assert!(!cache.contains("c"));
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
        let stats = cache.stats();
        assert!(stats.total_bytes <= ENTRY_BYTES * 3);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_oldest_among_unread() {
        let cache = cache(None);
        for key in ["a", "b", "c"] {
            cache.set(key, value(), None).unwrap();
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        cache.set("d", value(), None).unwrap();

        assert!(!cache.contains("a"));
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries_ceiling() {
        let cache = MemoryCache::new(CacheConfig::new().max_entries(Some(2))).unwrap();
        cache.set("a", 1u8, None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("b", 2u8, None).unwrap();
        cache.set("c", 3u8, None).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_overwrite_replaces_size() {
        let cache = cache(None);
        cache.set("k", value(), None).unwrap();
        cache.set("k", "y".repeat(18), None).unwrap();

        assert_eq!(cache.stats().total_bytes, 40);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_value_larger_than_capacity_rejected() {
        let cache = cache(None);
        cache.set("small", value(), None).unwrap();

        let result = cache.set("huge", "z".repeat(1_000), None);

        assert!(matches!(result, Err(CacheError::ValueTooLarge { .. })));
        assert!(cache.contains("small"));
    }

    #[test]
    fn test_invalidate_glob() {
        let cache = MemoryCache::new(CacheConfig::default()).unwrap();
        cache.set("user:1", 1, None).unwrap();
        cache.set("user:2", 2, None).unwrap();
        cache.set("session:1", 3, None).unwrap();

        assert_eq!(cache.invalidate("user:*").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate("nothing*").unwrap(), 0);
    }

    #[test]
    fn test_delete() {
        let cache = MemoryCache::new(CacheConfig::default()).unwrap();
        cache.set("k", 1, None).unwrap();

        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = MemoryCache::new(CacheConfig::default()).unwrap();
        cache.set("k", 1, None).unwrap();
        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 75.0);

        cache.clear();
        assert_eq!(cache.stats().hits, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_unread_expired_entries() {
        let events = Arc::new(EventBus::new());
        let (listener, mut rx) = ChannelListener::new();
        events.subscribe(Arc::new(listener));
        let cache = MemoryCache::new(CacheConfig::default())
            .unwrap()
            .with_events(events);
        cache.set("short", 1, Some(Duration::from_secs(1))).unwrap();
        cache.set("long", 2, Some(Duration::from_secs(60))).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), ResilienceEvent::CacheExpired { count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let cache = Arc::new(
            MemoryCache::new(CacheConfig::new().sweep_interval(Duration::from_secs(1))).unwrap(),
        );
        cache.start_sweep();
        cache.set("k", 1, Some(Duration::from_millis(500))).unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
        cache.shutdown();
    }
}
