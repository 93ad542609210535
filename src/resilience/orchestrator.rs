//! Resilience orchestrator composing the components for one protected call.
//!
//! A protected call runs through the rate limiter, then the circuit breaker,
//! then the service's bulkhead, and finally the retry executor. Its outcome
//! is recorded into the circuit breaker and the metrics collector. The
//! cached variant consults a [`MemoryCache`] first and stores the result.

use super::bulkhead::BulkheadRegistry;
use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::{RateLimitPolicy, RateLimiter};
use super::retry::{execute_with_retry_on_error, AlwaysRetry, RetryPredicate};
use crate::cache::MemoryCache;
use crate::config::ResilienceConfig;
use crate::errors::{BulkheadError, ConfigurationError, ProtectedCallError};
use crate::events::EventBus;
use crate::observability::{mask_identifier, MetricsCollector, MetricsSink};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Describes one protected call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRequest {
    service: String,
    rate_limit: Option<RateLimitTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RateLimitTarget {
    policy: String,
    identifier: String,
}

impl ProtectedRequest {
    /// A call to `service`, not rate limited
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            rate_limit: None,
        }
    }

    /// Count the call against the named rate limit policy for `identifier`
    pub fn rate_limited(
        mut self,
        policy: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        self.rate_limit = Some(RateLimitTarget {
            policy: policy.into(),
            identifier: identifier.into(),
        });
        self
    }

    /// Downstream service
    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Orchestrator for combining resilience patterns
pub struct ResilienceOrchestrator {
    config: ResilienceConfig,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    bulkheads: Arc<BulkheadRegistry>,
    rate_limit_policies: HashMap<String, RateLimitPolicy>,
}

impl ResilienceOrchestrator {
    /// Wire every component from `config`.
    ///
    /// All components publish on one event bus, and the metrics collector
    /// listens on it.
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        events.subscribe(metrics.clone());

        let rate_limiter = RateLimiter::with_config(config.rate_limiter.clone())
            .with_events(events.clone())
            .with_metrics(metrics.clone());

        let circuit_breaker = CircuitBreaker::with_config(config.default_circuit_breaker.clone())
            .with_events(events.clone());
        for (service, breaker_config) in &config.circuit_breakers {
            circuit_breaker.configure(service, breaker_config.clone())?;
        }

        let bulkheads = BulkheadRegistry::with_config(config.bulkhead_registry.clone())
            .with_events(events.clone());

        let rate_limit_policies = config
            .rate_limits
            .iter()
            .map(|(name, settings)| settings.to_policy().map(|policy| (name.clone(), policy)))
            .collect::<Result<HashMap<_, _>, ConfigurationError>>()?;

        Ok(Self {
            config: config.clone(),
            events,
            metrics,
            rate_limiter: Arc::new(rate_limiter),
            circuit_breaker: Arc::new(circuit_breaker),
            bulkheads: Arc::new(bulkheads),
            rate_limit_policies,
        })
    }

    /// Wire every component from [`ResilienceConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_config(&ResilienceConfig::from_env()?)
    }

    /// Start the rate limiter cleanup and the bulkhead sweeps.
    ///
    /// Requires a Tokio runtime.
    pub fn start_sweeps(&self) {
        self.rate_limiter.start_cleanup();
        self.bulkheads.start_sweeps();
    }

    /// Stop all background sweeps
    pub fn shutdown(&self) {
        self.rate_limiter.shutdown();
        self.bulkheads.shutdown();
        debug!("Resilience sweeps stopped");
    }

    /// Create a memory cache publishing on the shared event bus.
    ///
    /// The cache's expiry sweep is started with [`MemoryCache::start_sweep`]
    /// and stops when the cache is dropped.
    pub fn create_cache<V>(&self) -> Result<Arc<MemoryCache<V>>, ConfigurationError>
    where
        V: Serialize + Clone,
    {
        let cache = MemoryCache::new(self.config.cache.clone())?.with_events(self.events.clone());
        Ok(Arc::new(cache))
    }

    /// Run `operation` under every protection, retrying any failure
    pub async fn protect<F, Fut, T, E>(
        &self,
        request: &ProtectedRequest,
        operation: F,
    ) -> Result<T, ProtectedCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.protect_with(request, operation, &AlwaysRetry).await
    }

    /// Run `operation` under every protection, retrying only the failures
    /// `predicate` accepts
    #[instrument(skip(self, operation, predicate), fields(service = %request.service()))]
    pub async fn protect_with<F, Fut, T, E, P>(
        &self,
        request: &ProtectedRequest,
        operation: F,
        predicate: &P,
    ) -> Result<T, ProtectedCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: RetryPredicate<E> + ?Sized,
    {
        let service = request.service();

        if let Some(target) = &request.rate_limit {
            let policy = self.rate_limit_policies.get(&target.policy).ok_or_else(|| {
                ProtectedCallError::Configuration(ConfigurationError::invalid(format!(
                    "unknown rate limit policy {}",
                    target.policy
                )))
            })?;
            let result = self.rate_limiter.check_limit(&target.identifier, policy);
            if !result.allowed {
                debug!(
                    identifier = %mask_identifier(&target.identifier),
                    policy = %target.policy,
                    "Protected call rate limited"
                );
                return Err(ProtectedCallError::RateLimited(result));
            }
        }

        let breaker_config = self.config.circuit_breaker_for(service);
        if !self.circuit_breaker.is_available(service, &breaker_config) {
            self.metrics.record_request(false);
            debug!("Protected call rejected by open circuit");
            return Err(ProtectedCallError::CircuitOpen {
                service: service.to_string(),
            });
        }

        let bulkhead = self
            .bulkheads
            .get_or_create(service, self.config.bulkhead_for(service))
            .map_err(ProtectedCallError::Configuration)?;
        let retry_policy = self.config.retry_for(service);
        let retry_policy = &retry_policy;

        let outcome = bulkhead
            .execute(move || async move {
                let result = execute_with_retry_on_error(operation, retry_policy, predicate).await;
                let (attempts, elapsed) = (result.attempts, result.total_time);
                match result.outcome {
                    Ok(value) => Ok((value, attempts, elapsed)),
                    Err(error) => Err((error, attempts, elapsed)),
                }
            })
            .await;

        match outcome {
            Ok((value, attempts, elapsed)) => {
                self.record(service, true, elapsed);
                debug!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Protected call succeeded"
                );
                Ok(value)
            }
            Err(BulkheadError::Operation((error, attempts, elapsed))) => {
                self.record(service, false, elapsed);
                Err(ProtectedCallError::Failed {
                    error,
                    attempts,
                    elapsed,
                })
            }
            Err(BulkheadError::Rejected(rejection)) => {
                self.metrics.record_request(false);
                Err(ProtectedCallError::Bulkhead(rejection))
            }
        }
    }

    /// Serve `key` from `cache`, or run a protected call and cache its value.
    ///
    /// A value the cache refuses to hold is still returned.
    pub async fn protect_cached<F, Fut, T, E>(
        &self,
        request: &ProtectedRequest,
        cache: &MemoryCache<T>,
        key: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> Result<T, ProtectedCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + Clone,
        E: Display,
    {
        if let Some(value) = cache.get(key) {
            return Ok(value);
        }

        let value = self.protect(request, operation).await?;
        if let Err(error) = cache.set(key, value.clone(), ttl) {
            warn!(key, error = %error, "Protected call result not cached");
        }
        Ok(value)
    }

    fn record(&self, service: &str, success: bool, elapsed: Duration) {
        self.circuit_breaker
            .record_outcome(service, success, Some(elapsed));
        self.metrics
            .record_response_time(elapsed.as_millis() as u64, service);
        self.metrics.record_request(success);
    }

    /// Configuration in effect
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shared event bus
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Rate limiter
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Circuit breaker
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Bulkhead registry
    pub fn bulkheads(&self) -> &Arc<BulkheadRegistry> {
        &self.bulkheads
    }
}

impl std::fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut policies: Vec<&str> = self.rate_limit_policies.keys().map(String::as_str).collect();
        policies.sort_unstable();
        f.debug_struct("ResilienceOrchestrator")
            .field("rate_limit_policies", &policies)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("bulkheads", &self.bulkheads)
            .finish()
    }
}
