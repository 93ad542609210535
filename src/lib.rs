//! Resilience Layer
//!
//! Traffic control for calls to slow, rate-limited or occasionally failing
//! external dependencies:
//! - Fixed-window rate limiting keyed by client, user or API
//! - Per-service circuit breakers with lazy recovery probing
//! - Bulkheads capping concurrency with a bounded FIFO queue
//! - Retry with exponential backoff, jitter and per-attempt timeouts
//! - A TTL and size bounded cache with an optional distributed tier
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::{ProtectedRequest, ResilienceConfig, ResilienceOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = ResilienceOrchestrator::from_config(&ResilienceConfig::reference())?;
//!     orchestrator.start_sweeps();
//!
//!     let request = ProtectedRequest::new("database").rate_limited("user", "user-42");
//!     let rows = orchestrator
//!         .protect(&request, || async { Ok::<_, std::io::Error>(vec![1, 2, 3]) })
//!         .await?;
//!
//!     println!("fetched {} rows", rows.len());
//!     orchestrator.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! Each component is usable on its own; the orchestrator only composes
//! them in the usual order.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod errors;

// Components
pub mod cache;
pub mod resilience;

// Observability
pub mod events;
pub mod observability;

// Tests
#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheStats, MemoryCache, TieredCache};
pub use config::{RateLimitSettings, ResilienceConfig};
pub use errors::{
    AttemptError, BulkheadError, BulkheadRejection, CacheError, ConfigurationError,
    ProtectedCallError, ResilienceError, ResilienceResult,
};
pub use events::{EventBus, EventListener, ResilienceEvent};
pub use observability::{LoggingConfig, MetricsCollector, MetricsSink};
pub use resilience::{
    Bulkhead, BulkheadConfig, BulkheadRegistry, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, ProtectedRequest, RateLimitPolicy, RateLimitResult, RateLimiter,
    ResilienceOrchestrator, RetryExecutor, RetryPolicy,
};
