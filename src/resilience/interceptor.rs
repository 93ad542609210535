//! Boundary interceptors.
//!
//! An interceptor wraps a call at the edge of the application (an inbound
//! request handler or an outbound client) and applies one protection to it.
//! Rejections come back as the outer [`ResilienceError`]; the wrapped call's
//! own result is returned untouched as the inner value.

use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::{mask_identifier, MetricsSink};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::rate_limiter::{RateLimitPolicy, RateLimitResult, RateLimiter};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Records every call's outcome into a circuit breaker
pub struct CircuitBreakerInterceptor {
    breaker: Arc<CircuitBreaker>,
    service: String,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl CircuitBreakerInterceptor {
    /// Create an interceptor for `service`
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            breaker,
            service: service.into(),
            config,
            metrics: None,
        }
    }

    /// Report timings and outcomes to a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `operation`, counting `Ok` as success
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |result: &Result<T, E>| result.is_ok())
            .await
    }

    /// Run `operation`, letting `is_success` decide how the outcome counts.
    ///
    /// Useful when an `Ok` can still signal a failure, such as an HTTP
    /// response with a 5xx status.
    pub async fn call_classified<F, Fut, R, C>(
        &self,
        operation: F,
        is_success: C,
    ) -> ResilienceResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
        C: FnOnce(&R) -> bool,
    {
        if !self.breaker.is_available(&self.service, &self.config) {
            if let Some(metrics) = &self.metrics {
                metrics.record_request(false);
            }
            return Err(ResilienceError::CircuitOpen {
                service: self.service.clone(),
            });
        }

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();
        let success = is_success(&result);

        self.breaker
            .record_outcome(&self.service, success, Some(elapsed));
        if let Some(metrics) = &self.metrics {
            metrics.record_response_time(elapsed.as_millis() as u64, &self.service);
            metrics.record_request(success);
        }
        Ok(result)
    }
}

impl std::fmt::Debug for CircuitBreakerInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerInterceptor")
            .field("service", &self.service)
            .field("config", &self.config)
            .finish()
    }
}

/// Applies one rate limit policy at the boundary
#[derive(Debug)]
pub struct RateLimitInterceptor {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
}

impl RateLimitInterceptor {
    /// Create an interceptor
    pub fn new(limiter: Arc<RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self { limiter, policy }
    }

    /// Policy in effect
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Count a request from `identifier`, rejecting it over the limit.
    ///
    /// The returned result carries the `X-RateLimit-*` headers for the
    /// response.
    pub fn check(&self, identifier: &str) -> ResilienceResult<RateLimitResult> {
        let result = self.limiter.check_limit(identifier, &self.policy);
        if result.allowed {
            return Ok(result);
        }
        let retry_after = Duration::from_secs(result.retry_after_secs(Utc::now()));
        debug!(
            identifier = %mask_identifier(identifier),
            retry_after_secs = retry_after.as_secs(),
            message = self.policy.message(),
            "Request rejected at boundary"
        );
        Err(ResilienceError::RateLimited {
            key: self.policy.key_for(identifier),
            retry_after,
        })
    }

    /// Run `operation` if `identifier` is within its limit
    pub async fn call<F, Fut, R>(
        &self,
        identifier: &str,
        operation: F,
    ) -> ResilienceResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.check(identifier)?;
        Ok(operation().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsCollector;
    use crate::resilience::CircuitState;

    fn tripping_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .failure_threshold_percent(50.0)
            .volume_threshold(2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_interceptor_records_outcomes() {
        let breaker = Arc::new(CircuitBreaker::new());
        let metrics = Arc::new(MetricsCollector::new());
        let interceptor = CircuitBreakerInterceptor::new(breaker.clone(), "soap", tripping_config())
            .with_metrics(metrics.clone());

        let ok = interceptor.call(|| async { Ok::<_, String>(1) }).await.unwrap();
        assert_eq!(ok, Ok(1));
        let failed = interceptor
            .call(|| async { Err::<i32, _>("fault".to_string()) })
            .await
            .unwrap();
        assert!(failed.is_err());

        assert_eq!(breaker.state("soap"), CircuitState::Open);
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.latency_stats("soap").unwrap().count, 2);

        let rejected = interceptor.call(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(metrics.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_counts_server_errors() {
        let breaker = Arc::new(CircuitBreaker::new());
        let interceptor =
            CircuitBreakerInterceptor::new(breaker.clone(), "http", tripping_config());

        for status in [200u16, 502] {
            let response = interceptor
                .call_classified(|| async move { status }, |status| *status < 400)
                .await
                .unwrap();
            assert_eq!(response, status);
        }

        assert_eq!(breaker.state("http"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_rate_limit_interceptor() {
        let policy = RateLimitPolicy::per_ip()
            .to_builder()
            .window(Duration::from_secs(3600))
            .max_requests(1)
            .build()
            .unwrap();
        let interceptor = RateLimitInterceptor::new(Arc::new(RateLimiter::new()), policy);

        let allowed = interceptor.call("10.1.1.1", || async { "ok" }).await.unwrap();
        assert_eq!(allowed, "ok");

        let denied = interceptor.check("10.1.1.1").unwrap_err();
        assert_eq!(denied.http_status(), 429);
        assert!(matches!(
            denied,
            ResilienceError::RateLimited { ref key, .. } if key == "ip:10.1.1.1"
        ));
        assert!(denied.retry_after().unwrap() <= Duration::from_secs(3600));
    }
}
