//! Metrics collection for protected calls.

use crate::events::{EventListener, ResilienceEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for request outcomes and response times.
///
/// Called synchronously on the request path, so implementations must not
/// block.
pub trait MetricsSink: Send + Sync {
    /// Record how long a call to `label` took
    fn record_response_time(&self, ms: u64, label: &str);

    /// Record whether a request succeeded
    fn record_request(&self, success: bool);
}

/// In-process metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// Latency histograms by label
    latencies: RwLock<HashMap<String, LatencyHistogram>>,
    /// Successful requests
    successes: AtomicU64,
    /// Failed or rejected requests
    failures: AtomicU64,
    /// Rate limit denials
    rate_limit_hits: AtomicU64,
    /// Circuit breaker openings
    circuit_breaker_trips: AtomicU64,
    /// Bulkhead rejections
    bulkhead_rejections: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            latencies: RwLock::new(HashMap::new()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            bulkhead_rejections: AtomicU64::new(0),
        }
    }

    /// Get total request count
    pub fn request_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed) + self.failures.load(Ordering::Relaxed)
    }

    /// Get failed request count
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        let total = self.request_count();
        if total == 0 {
            0.0
        } else {
            self.failure_count() as f64 / total as f64
        }
    }

    /// Get latency stats for a label
    pub fn latency_stats(&self, label: &str) -> Option<LatencyStats> {
        self.latencies.read().get(label).map(|h| h.stats())
    }

    /// Get rate limit hit count
    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    /// Get circuit breaker trip count
    pub fn circuit_breaker_trips(&self) -> u64 {
        self.circuit_breaker_trips.load(Ordering::Relaxed)
    }

    /// Get bulkhead rejection count
    pub fn bulkhead_rejections(&self) -> u64 {
        self.bulkhead_rejections.load(Ordering::Relaxed)
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self
            .latencies
            .read()
            .iter()
            .map(|(label, histogram)| (label.clone(), histogram.stats()))
            .collect();

        MetricsSnapshot {
            latencies,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.latencies.write().clear();
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rate_limit_hits.store(0, Ordering::Relaxed);
        self.circuit_breaker_trips.store(0, Ordering::Relaxed);
        self.bulkhead_rejections.store(0, Ordering::Relaxed);
    }
}

impl MetricsSink for MetricsCollector {
    fn record_response_time(&self, ms: u64, label: &str) {
        if let Some(histogram) = self.latencies.read().get(label) {
            histogram.record(ms);
            return;
        }
        self.latencies
            .write()
            .entry(label.to_string())
            .or_insert_with(LatencyHistogram::new)
            .record(ms);
    }

    fn record_request(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EventListener for MetricsCollector {
    fn on_event(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::RateLimitExceeded { .. } => {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::CircuitOpened { .. } | ResilienceEvent::CircuitReopened { .. } => {
                self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::BulkheadRejected { .. } => {
                self.bulkhead_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Latency histogram using buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Count of samples
    count: AtomicU64,
    /// Sum of all samples
    sum: AtomicU64,
    /// Minimum value
    min: AtomicU64,
    /// Maximum value
    max: AtomicU64,
    /// Bucket counts (0-10ms, 10-50ms, 50-100ms, 100-500ms, 500ms+)
    buckets: [AtomicU64; 5],
}

impl LatencyHistogram {
    /// Create a new histogram
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record a latency value
    pub fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.min.fetch_min(ms, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        let bucket_idx = match ms {
            0..=10 => 0,
            11..=50 => 1,
            51..=100 => 2,
            101..=500 => 3,
            _ => 4,
        };
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        LatencyStats {
            count,
            sum_ms: sum,
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max.load(Ordering::Relaxed),
            avg_ms: if count > 0 { sum / count } else { 0 },
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    /// Sample count
    pub count: u64,
    /// Total sum in milliseconds
    pub sum_ms: u64,
    /// Minimum latency
    pub min_ms: u64,
    /// Maximum latency
    pub max_ms: u64,
    /// Average latency
    pub avg_ms: u64,
    /// Bucket counts [0-10ms, 10-50ms, 50-100ms, 100-500ms, 500ms+]
    pub buckets: [u64; 5],
}

/// Complete metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Latency stats by label
    pub latencies: HashMap<String, LatencyStats>,
    /// Successful requests
    pub successes: u64,
    /// Failed requests
    pub failures: u64,
    /// Rate limit hits
    pub rate_limit_hits: u64,
    /// Circuit breaker trips
    pub circuit_breaker_trips: u64,
    /// Bulkhead rejections
    pub bulkhead_rejections: u64,
}

/// Create a shared metrics collector
pub fn create_metrics_collector() -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_requests() {
        let metrics = MetricsCollector::new();

        metrics.record_request(true);
        metrics.record_request(true);
        metrics.record_request(false);

        assert_eq!(metrics.request_count(), 3);
        assert_eq!(metrics.failure_count(), 1);
        assert!((metrics.failure_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();

        histogram.record(5);
        histogram.record(25);
        histogram.record(150);

        let stats = histogram.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 5);
        assert_eq!(stats.max_ms, 150);
        assert_eq!(stats.buckets, [1, 1, 0, 1, 0]);
    }

    #[test]
    fn test_response_time_by_label() {
        let metrics = MetricsCollector::new();

        metrics.record_response_time(40, "messaging");
        metrics.record_response_time(60, "messaging");
        metrics.record_response_time(900, "llm");

        assert_eq!(metrics.latency_stats("messaging").unwrap().avg_ms, 50);
        assert_eq!(metrics.latency_stats("llm").unwrap().buckets[4], 1);
        assert!(metrics.latency_stats("database").is_none());
    }

    #[test]
    fn test_event_counting() {
        let metrics = MetricsCollector::new();

        metrics.on_event(&ResilienceEvent::RateLimitExceeded {
            key: "ip:1".to_string(),
            requests: 11,
            limit: 10,
        });
        metrics.on_event(&ResilienceEvent::CircuitOpened {
            service: "soap".to_string(),
            failures: 6,
            failure_rate: 60.0,
        });
        metrics.on_event(&ResilienceEvent::CacheExpired { count: 3 });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_limit_hits, 1);
        assert_eq!(snapshot.circuit_breaker_trips, 1);
        assert_eq!(snapshot.bulkhead_rejections, 0);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_request(false);
        metrics.record_response_time(10, "db");

        metrics.reset();

        assert_eq!(metrics.request_count(), 0);
        assert!(metrics.snapshot().latencies.is_empty());
    }
}
