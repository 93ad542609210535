//! Cache behavior across expiry, eviction and tiering.

use crate::cache::{
    CacheConfig, DistributedCache, InMemoryDistributedCache, MemoryCache, TieredCache,
};
use crate::errors::CacheError;
use crate::events::{ChannelListener, EventBus, ResilienceEvent};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// `"xxxxxxxx"` is 10 bytes of JSON, accounted as 20
const ENTRY_BYTES: usize = 20;

fn payload() -> String {
    "x".repeat(8)
}

#[tokio::test(start_paused = true)]
async fn test_ttl_round_trip_releases_accounting() {
    let cache = MemoryCache::new(CacheConfig::new()).unwrap();
    cache.set("session:1", payload(), Some(Duration::from_secs(1))).unwrap();
    assert_eq!(cache.get("session:1"), Some(payload()));
    assert_eq!(cache.stats().total_bytes, ENTRY_BYTES);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get("session:1"), None);
    assert_eq!(cache.stats().total_bytes, 0);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pressure_never_evicts_latest_read() {
    let ceiling = ENTRY_BYTES * 5;
    let cache = MemoryCache::new(
        CacheConfig::new()
            .max_bytes(ceiling)
            .max_entries(None),
    )
    .unwrap();

    cache.set("k0", payload(), None).unwrap();
    for i in 1..20 {
        let previous = format!("k{}", i - 1);
        assert_eq!(cache.get(&previous), Some(payload()));
        tokio::time::advance(Duration::from_millis(1)).await;

        cache.set(&format!("k{}", i), payload(), None).unwrap();

        assert!(cache.contains(&previous), "evicted most recent read {previous}");
        assert!(cache.stats().total_bytes <= ceiling);
    }

    let stats = cache.stats();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.evictions, 15);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_prefers_rarely_read_entries() {
    let cache = MemoryCache::new(CacheConfig::new().max_bytes(ENTRY_BYTES * 3)).unwrap();
    for key in ["hot", "warm", "cold"] {
        cache.set(key, payload(), None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    for _ in 0..3 {
        cache.get("hot");
    }
    cache.get("warm");
    cache.get("hot");

    cache.set("new", payload(), None).unwrap();

    assert!(!cache.contains("cold"));
    assert!(cache.contains("hot"));
    assert!(cache.contains("warm"));
}

#[tokio::test(start_paused = true)]
async fn test_events_report_eviction_and_expiry() {
    let bus = Arc::new(EventBus::new());
    let (listener, mut events) = ChannelListener::new();
    bus.subscribe(Arc::new(listener));
    let cache = MemoryCache::new(CacheConfig::new().max_bytes(ENTRY_BYTES))
        .unwrap()
        .with_events(bus);

    cache.set("a", payload(), Some(Duration::from_secs(5))).unwrap();
    cache.set("b", payload(), Some(Duration::from_secs(5))).unwrap();
    assert_eq!(
        events.try_recv().ok(),
        Some(ResilienceEvent::CacheEvicted {
            count: 1,
            freed_bytes: ENTRY_BYTES,
        })
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.sweep_expired(), 1);
    assert_eq!(
        events.try_recv().ok(),
        Some(ResilienceEvent::CacheExpired { count: 1 })
    );
}

#[test]
fn test_invalidate_then_miss() {
    let cache = MemoryCache::new(CacheConfig::new()).unwrap();
    for key in ["user:1:profile", "user:2:profile", "user:1:settings", "doc:1"] {
        cache.set(key, 1u32, None).unwrap();
    }

    assert_eq!(cache.invalidate("user:*:profile").unwrap(), 2);
    assert_eq!(cache.get("user:1:profile"), None);
    assert_eq!(cache.get("user:1:settings"), Some(1));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_oversized_value_leaves_cache_intact() {
    let cache = MemoryCache::new(CacheConfig::new().max_bytes(ENTRY_BYTES)).unwrap();
    cache.set("small", payload(), None).unwrap();

    let err = cache.set("big", "y".repeat(64), None).unwrap_err();
    assert!(matches!(err, CacheError::ValueTooLarge { capacity, .. } if capacity == ENTRY_BYTES));
    assert!(cache.contains("small"));
}

#[tokio::test]
async fn test_tiered_read_through_between_instances() {
    let shared = Arc::new(InMemoryDistributedCache::new());
    let writer = TieredCache::new(Arc::new(MemoryCache::new(CacheConfig::new()).unwrap()))
        .with_distributed(shared.clone());
    let reader = TieredCache::new(Arc::new(MemoryCache::new(CacheConfig::new()).unwrap()))
        .with_distributed(shared.clone());

    writer
        .set("conversation:9", vec!["hi".to_string()], Some(Duration::from_secs(60)))
        .await
        .unwrap();

    assert!(!reader.local().contains("conversation:9"));
    assert_eq!(reader.get("conversation:9").await, Some(vec!["hi".to_string()]));
    assert!(reader.local().contains("conversation:9"));

    assert!(writer.delete("conversation:9").await);
    assert_eq!(shared.get("conversation:9").await.unwrap(), None);
    // The reader's local copy lives until its own TTL or invalidation
    assert_eq!(reader.invalidate("conversation:*").unwrap(), 1);
    assert_eq!(reader.get("conversation:9").await, None);
}
