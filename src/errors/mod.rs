//! Error types for the resilience layer.
//!
//! Capacity and availability rejections are ordinary values callers are
//! expected to handle locally. Operation errors are carried generically so
//! the wrapped call's own error type reaches the caller untouched.

use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Root error type for the resilience layer
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Caller exceeded its rate limit
    #[error("Rate limit exceeded for {key}, retry after {retry_after:?}")]
    RateLimited {
        /// Namespaced rate limit key
        key: String,
        /// Time until the current window resets
        retry_after: Duration,
    },

    /// Circuit breaker is open for the service
    #[error("Circuit breaker is open for {service}")]
    CircuitOpen {
        /// Downstream service name
        service: String,
    },

    /// Bulkhead rejected the operation
    #[error("Bulkhead rejection: {0}")]
    Bulkhead(#[from] BulkheadRejection),
}

impl ResilienceError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "RESILIENCE_CONFIG",
            Self::RateLimited { .. } => "RESILIENCE_RATE_LIMIT",
            Self::CircuitOpen { .. } => "RESILIENCE_CIRCUIT_OPEN",
            Self::Bulkhead(BulkheadRejection::QueueFull { .. }) => "RESILIENCE_QUEUE_FULL",
            Self::Bulkhead(BulkheadRejection::QueueTimeout { .. }) => "RESILIENCE_QUEUE_TIMEOUT",
        }
    }

    /// Check if the caller may try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::CircuitOpen { .. } | Self::Bulkhead(_)
        )
    }

    /// Get retry-after duration if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status a boundary handler should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::CircuitOpen { .. } | Self::Bulkhead(_) => 503,
            Self::Configuration(_) => 500,
        }
    }
}

/// Configuration errors, raised at construction time
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A numeric or structural field is out of range
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Rate limit policy built without a key derivation strategy
    #[error("Rate limit policy is missing a key strategy")]
    MissingKeyStrategy,

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(String),

    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigurationError {
    /// Shorthand for an [`ConfigurationError::InvalidConfiguration`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Reasons a bulkhead refused to run an operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BulkheadRejection {
    /// Both the concurrency slots and the queue are full
    #[error("Bulkhead queue full for {service}")]
    QueueFull {
        /// Service name
        service: String,
    },

    /// The operation waited in the queue longer than the configured timeout
    #[error("Bulkhead timeout for {service} after {waited:?}")]
    QueueTimeout {
        /// Service name
        service: String,
        /// Time spent queued
        waited: Duration,
    },
}

impl BulkheadRejection {
    /// Service the rejection applies to
    pub fn service(&self) -> &str {
        match self {
            Self::QueueFull { service } | Self::QueueTimeout { service, .. } => service,
        }
    }

    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::QueueTimeout { .. } => "queue_timeout",
        }
    }
}

/// Error returned by [`crate::resilience::Bulkhead::execute`]
#[derive(Error, Debug)]
pub enum BulkheadError<E> {
    /// The bulkhead refused the operation; it was never started
    #[error(transparent)]
    Rejected(#[from] BulkheadRejection),

    /// The operation ran and failed; the error is passed through verbatim
    #[error("{0}")]
    Operation(E),
}

impl<E> BulkheadError<E> {
    /// Returns the rejection if the operation never ran
    pub fn rejection(&self) -> Option<&BulkheadRejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Operation(_) => None,
        }
    }

    /// Returns the operation error if the operation ran and failed
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Rejected(_) => None,
        }
    }
}

/// Failure of a single attempt made by the retry executor
#[derive(Error, Debug)]
pub enum AttemptError<E> {
    /// The attempt did not finish within the policy timeout
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// The operation returned an error
    #[error("{0}")]
    Operation(E),
}

impl<E> AttemptError<E> {
    /// Whether the attempt was cut short by the timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Borrow the operation error, if any
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Timeout(_) => None,
        }
    }
}

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be serialized for size accounting
    #[error("Failed to serialize value for {key}: {source}")]
    Serialization {
        /// Cache key
        key: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A single value exceeds the configured capacity
    #[error("Value for {key} is {size} bytes, larger than the {capacity} byte capacity")]
    ValueTooLarge {
        /// Cache key
        key: String,
        /// Serialized size
        size: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// Invalidation pattern could not be compiled
    #[error("Invalid invalidation pattern {pattern}: {source}")]
    InvalidPattern {
        /// Glob pattern
        pattern: String,
        /// Underlying error
        #[source]
        source: regex::Error,
    },

    /// Distributed tier failure
    #[error("Distributed cache error: {message}")]
    Distributed {
        /// Error message
        message: String,
    },
}

/// Error returned by [`crate::resilience::ResilienceOrchestrator::protect`]
#[derive(Error, Debug)]
pub enum ProtectedCallError<E> {
    /// Caller exceeded the rate limit; the operation was not attempted
    #[error("Rate limit exceeded, {} requests in window", .0.total_in_window)]
    RateLimited(crate::resilience::RateLimitResult),

    /// Circuit breaker is open; the operation was not attempted
    #[error("Circuit breaker is open for {service}")]
    CircuitOpen {
        /// Service name
        service: String,
    },

    /// Bulkhead rejected the call; the operation was not attempted
    #[error(transparent)]
    Bulkhead(BulkheadRejection),

    /// The service's protection could not be set up
    #[error(transparent)]
    Configuration(ConfigurationError),

    /// The operation failed after all retry attempts
    #[error("Operation failed after {attempts} attempt(s) in {elapsed:?}: {error}")]
    Failed {
        /// Last attempt error
        error: AttemptError<E>,
        /// Attempts made
        attempts: u32,
        /// Total time spent
        elapsed: Duration,
    },
}

impl<E> ProtectedCallError<E> {
    /// Whether the call was refused before the operation was attempted
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// HTTP status a boundary handler should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited(_) => 429,
            Self::CircuitOpen { .. } | Self::Bulkhead(_) => 503,
            Self::Configuration(_) => 500,
            Self::Failed { .. } => 502,
        }
    }
}
