//! Resilience patterns for calls to external dependencies.
//!
//! Provides rate limiting, circuit breaking, bulkhead isolation and retry,
//! plus boundary interceptors and an orchestrator composing them.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod interceptor;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

pub(crate) mod sweep;

pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadRegistry, BulkheadRegistryConfig,
    BulkheadStatus, SlotGuard,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use interceptor::{CircuitBreakerInterceptor, RateLimitInterceptor};
pub use orchestrator::{ProtectedRequest, ResilienceOrchestrator};
pub use rate_limiter::{
    KeyStrategy, RateLimitPolicy, RateLimitPolicyBuilder, RateLimitResult, RateLimiter,
    RateLimiterConfig, RateLimiterStats,
};
pub use retry::{
    execute_with_retry, execute_with_retry_on_error, AlwaysRetry, IoErrorKinds, RetryExecutor,
    RetryPolicy, RetryPredicate, RetryResult, TransientNetworkErrors,
};
