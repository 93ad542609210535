//! Rate limiter using epoch-aligned request windows.
//!
//! Each key owns a window aligned to `floor(now / window) * window`. When a
//! request arrives after the window has elapsed, the window is replaced with
//! an empty one. All requests in the same bucket share one counter, so a
//! caller can burst up to twice the limit across a window boundary. This is
//! a known approximation of a sliding log and is kept deliberately.

use crate::errors::ConfigurationError;
use crate::events::{EventBus, ResilienceEvent};
use crate::observability::{mask_identifier, MetricsSink};
use crate::resilience::sweep::{spawn_sweep, SweepHandles};
use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Maps a raw identifier to a namespaced rate limit key
#[derive(Clone)]
pub struct KeyStrategy(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl KeyStrategy {
    /// Prefix identifiers with `prefix:`
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self(Arc::new(move |identifier| format!("{}:{}", prefix, identifier)))
    }

    /// Use a custom derivation function
    pub fn custom<F>(derive: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(derive))
    }

    /// Derive the key for an identifier
    pub fn derive(&self, identifier: &str) -> String {
        (self.0)(identifier)
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyStrategy(..)")
    }
}

/// A rate limit policy: window size, request ceiling and key namespace
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    window: Duration,
    max_requests: u32,
    key_strategy: KeyStrategy,
    message: String,
}

impl RateLimitPolicy {
    /// Start building a policy
    pub fn builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::default()
    }

    /// Continue building from this policy
    pub fn to_builder(&self) -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder {
            window: Some(self.window),
            max_requests: Some(self.max_requests),
            key_strategy: Some(self.key_strategy.clone()),
            message: Some(self.message.clone()),
        }
    }

    fn preset(prefix: &str, max_requests: u32, message: &str) -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests,
            key_strategy: KeyStrategy::prefixed(prefix),
            message: message.to_string(),
        }
    }

    /// 100 requests per minute per client IP
    pub fn per_ip() -> Self {
        Self::preset("ip", 100, "Too many requests from this IP")
    }

    /// 50 requests per minute per authenticated user
    pub fn per_user() -> Self {
        Self::preset("user", 50, "Too many requests from this user")
    }

    /// 30 messages per minute per phone number
    pub fn per_phone() -> Self {
        Self::preset("phone", 30, "Too many messages from this phone number")
    }

    /// 10 calls per minute per downstream API
    pub fn external_api() -> Self {
        Self::preset("api", 10, "External API rate limit exceeded")
    }

    /// Window size
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum requests per window
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// User-facing rejection message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Namespaced key for an identifier
    pub fn key_for(&self, identifier: &str) -> String {
        self.key_strategy.derive(identifier)
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Builder for [`RateLimitPolicy`]
#[derive(Debug, Default)]
pub struct RateLimitPolicyBuilder {
    window: Option<Duration>,
    max_requests: Option<u32>,
    key_strategy: Option<KeyStrategy>,
    message: Option<String>,
}

impl RateLimitPolicyBuilder {
    /// Set the window size
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Set the maximum requests per window
    pub fn max_requests(mut self, n: u32) -> Self {
        self.max_requests = Some(n);
        self
    }

    /// Namespace keys with `prefix:`
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_strategy = Some(KeyStrategy::prefixed(prefix));
        self
    }

    /// Set the key derivation strategy
    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = Some(strategy);
        self
    }

    /// Set the rejection message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Build the policy
    pub fn build(self) -> Result<RateLimitPolicy, ConfigurationError> {
        let key_strategy = self.key_strategy.ok_or(ConfigurationError::MissingKeyStrategy)?;
        let window = self
            .window
            .ok_or_else(|| ConfigurationError::invalid("rate limit window is required"))?;
        if window.as_millis() == 0 {
            return Err(ConfigurationError::invalid(
                "rate limit window must be at least 1ms",
            ));
        }
        let max_requests = self
            .max_requests
            .ok_or_else(|| ConfigurationError::invalid("rate limit max_requests is required"))?;

        Ok(RateLimitPolicy {
            window,
            max_requests,
            key_strategy,
            message: self
                .message
                .unwrap_or_else(|| "Too many requests, please try again later".to_string()),
        })
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
    /// Requests counted in the current window, this one included
    pub total_in_window: u32,
    /// Configured ceiling
    pub limit: u32,
}

impl RateLimitResult {
    /// Whole seconds until the window resets, rounded up
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_time - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }

    /// `X-RateLimit-*` response headers
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        if let Ok(reset) = HeaderValue::from_str(&self.reset_time.to_rfc3339()) {
            headers.insert("x-ratelimit-reset", reset);
        }
        headers
    }
}

/// Configuration for the rate limiter's maintenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// How often idle windows are swept
    #[serde(rename = "cleanup_interval_ms", with = "crate::config::duration_format::millis")]
    pub cleanup_interval: Duration,
    /// Windows that started longer ago than this are removed
    #[serde(rename = "retention_ms", with = "crate::config::duration_format::millis")]
    pub retention: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the retention threshold
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.cleanup_interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "rate limiter cleanup interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Requests recorded for one key
#[derive(Debug)]
struct RateWindow {
    window_start: i64,
    requests: VecDeque<i64>,
}

impl RateWindow {
    fn new(window_start: i64) -> Self {
        Self {
            window_start,
            requests: VecDeque::new(),
        }
    }
}

/// Snapshot of limiter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Keys with a live window
    pub active_windows: usize,
}

/// Rate limiter shared by every caller in the process
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
    events: Option<Arc<EventBus>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    sweeps: SweepHandles,
}

impl RateLimiter {
    /// Create a new rate limiter with default configuration
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    /// Create a new rate limiter with custom configuration
    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            events: None,
            metrics: None,
            sweeps: SweepHandles::default(),
        }
    }

    /// Publish denials on an event bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Report denials to a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check and count a request against `policy`
    pub fn check_limit(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitResult {
        self.check_limit_at(identifier, policy, Utc::now().timestamp_millis())
    }

    /// Check and count a request at an explicit epoch-millisecond time
    pub fn check_limit_at(
        &self,
        identifier: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> RateLimitResult {
        let key = policy.key_for(identifier);
        let window_ms = policy.window_ms();
        let window_start = now_ms.div_euclid(window_ms) * window_ms;

        let count = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(key.clone())
                .or_insert_with(|| RateWindow::new(window_start));
            if window.window_start < window_start {
                *window = RateWindow::new(window_start);
            }

            window.requests.push_back(now_ms);
            let cutoff = now_ms - window_ms;
            window.requests.retain(|&t| t > cutoff);
            u32::try_from(window.requests.len()).unwrap_or(u32::MAX)
        };

        let limit = policy.max_requests();
        let allowed = count <= limit;
        let reset_ms = window_start.saturating_add(window_ms);
        let reset_time = Utc
            .timestamp_millis_opt(reset_ms)
            .single()
            .unwrap_or_else(Utc::now);

        if !allowed {
            warn!(
                identifier = %mask_identifier(identifier),
                requests = count,
                limit,
                window_ms,
                "Rate limit exceeded"
            );
            if let Some(events) = &self.events {
                events.emit(ResilienceEvent::RateLimitExceeded {
                    key,
                    requests: count,
                    limit,
                });
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_request(false);
            }
        }

        RateLimitResult {
            allowed,
            remaining: limit.saturating_sub(count),
            reset_time,
            total_in_window: count,
            limit,
        }
    }

    /// Forget the window for a namespaced key
    pub fn reset(&self, key: &str) -> bool {
        self.windows.lock().remove(key).is_some()
    }

    /// Forget every window
    pub fn reset_all(&self) {
        self.windows.lock().clear();
        debug!("Rate limits reset");
    }

    /// Remove windows that started before the retention threshold
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now().timestamp_millis())
    }

    /// Remove stale windows relative to an explicit epoch-millisecond time
    pub fn cleanup_at(&self, now_ms: i64) -> usize {
        let retention_ms = i64::try_from(self.config.retention.as_millis()).unwrap_or(i64::MAX);
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| now_ms - window.window_start <= retention_ms);
        let cleaned = before - windows.len();

        if cleaned > 0 {
            debug!(
                cleaned_windows = cleaned,
                active_windows = windows.len(),
                "Rate limiter cleanup completed"
            );
        }
        cleaned
    }

    /// Start the periodic cleanup sweep. Requires a Tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>) {
        let handle = spawn_sweep(
            self,
            self.config.cleanup_interval,
            "rate_limiter_cleanup",
            |limiter: &RateLimiter| {
                limiter.cleanup();
            },
        );
        self.sweeps.push(handle);
    }

    /// Stop background sweeps
    pub fn shutdown(&self) {
        self.sweeps.abort_all();
    }

    /// Current limiter statistics
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_windows: self.windows.lock().len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("active_windows", &self.stats().active_windows)
            .field("sweeps", &self.sweeps)
            .finish()
    }
}
