//! Circuit breaker pattern for fault tolerance.
//!
//! One breaker instance tracks every downstream service by name. Availability
//! checks and outcome recording both happen under a single lock, so the
//! OPEN to HALF_OPEN transition and the decision to open are never split
//! across an await point.

use crate::errors::ConfigurationError;
use crate::events::{EventBus, ResilienceEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Maintenance period applied by [`CircuitBreaker::force_open`] callers that
/// have no better estimate
pub const DEFAULT_FORCE_OPEN_DURATION: Duration = Duration::from_secs(5 * 60);

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    #[default]
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, probing whether the service recovered
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate, in percent of all recorded requests, that opens the circuit
    pub failure_threshold_percent: f64,
    /// How long the circuit stays open before probing
    #[serde(rename = "recovery_timeout_ms", with = "crate::config::duration_format::millis")]
    pub recovery_timeout: Duration,
    /// Minimum recorded requests before the failure rate is considered
    pub volume_threshold: u64,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percent: 5.0,
            recovery_timeout: Duration::from_secs(60),
            volume_threshold: 10,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold in percent
    pub fn failure_threshold_percent(mut self, percent: f64) -> Self {
        self.failure_threshold_percent = percent;
        self
    }

    /// Set recovery timeout
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set volume threshold
    pub fn volume_threshold(mut self, n: u64) -> Self {
        self.volume_threshold = n;
        self
    }

    /// Set success threshold
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=100.0).contains(&self.failure_threshold_percent) {
            return Err(ConfigurationError::invalid(format!(
                "failure_threshold_percent must be within 0..=100, got {}",
                self.failure_threshold_percent
            )));
        }
        if self.volume_threshold == 0 {
            return Err(ConfigurationError::invalid(
                "volume_threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigurationError::invalid(
                "success_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Per-service circuit state
#[derive(Debug, Default)]
struct ServiceCircuit {
    state: CircuitState,
    failures: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    /// `None` while open means the recovery timeout outlasts the clock
    next_attempt_time: Option<Instant>,
}

/// Rolling request statistics for one service
#[derive(Debug, Clone, Default)]
struct ServiceStats {
    total_requests: u64,
    failures: u64,
    successes: u64,
    average_response_ms: f64,
    last_request_time: Option<Instant>,
}

impl ServiceStats {
    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.total_requests as f64 * 100.0
        }
    }

    fn record(&mut self, success: bool, response_time: Option<Duration>, now: Instant) {
        self.total_requests += 1;
        self.last_request_time = Some(now);
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if let Some(elapsed) = response_time {
            let ms = elapsed.as_secs_f64() * 1000.0;
            let n = self.total_requests as f64;
            self.average_response_ms = (self.average_response_ms * (n - 1.0) + ms) / n;
        }
    }
}

/// Point-in-time view of one service's circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Decaying failure counter
    pub failures: u32,
    /// Half-open successes so far
    pub success_count: u32,
    /// Requests recorded since the circuit last closed
    pub total_requests: u64,
    /// Successful requests among them
    pub successes: u64,
    /// Failure rate in percent
    pub failure_rate: f64,
    /// Running average response time
    pub average_response_time: Duration,
    /// Most recent recorded request
    pub last_request_time: Option<Instant>,
    /// Most recent failure
    pub last_failure_time: Option<Instant>,
    /// When an open circuit will next allow a trial call
    pub next_attempt_time: Option<Instant>,
}

#[derive(Debug, Default)]
struct Registry {
    circuits: HashMap<String, ServiceCircuit>,
    stats: HashMap<String, ServiceStats>,
    configs: HashMap<String, CircuitBreakerConfig>,
}

/// Circuit breaker keyed by downstream service name
pub struct CircuitBreaker {
    default_config: CircuitBreakerConfig,
    registry: Mutex<Registry>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker whose unconfigured services use `config`
    pub fn with_config(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            registry: Mutex::new(Registry::default()),
            events: None,
        }
    }

    /// Publish state changes on an event bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Remember the configuration for a service
    pub fn configure(
        &self,
        service: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), ConfigurationError> {
        config.validate()?;
        self.registry.lock().configs.insert(service.to_string(), config);
        Ok(())
    }

    /// Whether a call to `service` should be attempted.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to HALF_OPEN
    /// here and lets the call through.
    pub fn is_available(&self, service: &str, config: &CircuitBreakerConfig) -> bool {
        self.is_available_at(service, config, Instant::now())
    }

    /// [`Self::is_available`] at an explicit instant
    pub fn is_available_at(
        &self,
        service: &str,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> bool {
        let (available, half_opened) = {
            let mut registry = self.registry.lock();
            if registry.configs.get(service) != Some(config) {
                registry.configs.insert(service.to_string(), config.clone());
            }
            let circuit = registry.circuits.entry(service.to_string()).or_default();

            match circuit.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, false),
                CircuitState::Open => match circuit.next_attempt_time {
                    Some(next) if now >= next => {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.success_count = 0;
                        (true, true)
                    }
                    _ => (false, false),
                },
            }
        };

        if half_opened {
            info!(service, "Circuit breaker transitioning to HALF_OPEN");
            self.emit(ResilienceEvent::CircuitHalfOpened {
                service: service.to_string(),
            });
        }
        available
    }

    /// Record the outcome of a call to `service`
    pub fn record_outcome(&self, service: &str, success: bool, response_time: Option<Duration>) {
        self.record_outcome_at(service, success, response_time, Instant::now());
    }

    /// [`Self::record_outcome`] at an explicit instant
    pub fn record_outcome_at(
        &self,
        service: &str,
        success: bool,
        response_time: Option<Duration>,
        now: Instant,
    ) {
        let event = {
            let mut registry = self.registry.lock();
            let Registry {
                circuits,
                stats,
                configs,
            } = &mut *registry;

            let config = configs.get(service).unwrap_or(&self.default_config);
            let stats = stats.entry(service.to_string()).or_default();
            stats.record(success, response_time, now);
            let circuit = circuits.entry(service.to_string()).or_default();

            if success {
                Self::on_success(service, circuit, stats, config)
            } else {
                Self::on_failure(service, circuit, stats, config, now)
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn on_success(
        service: &str,
        circuit: &mut ServiceCircuit,
        stats: &mut ServiceStats,
        config: &CircuitBreakerConfig,
    ) -> Option<ResilienceEvent> {
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= config.success_threshold {
                    *circuit = ServiceCircuit::default();
                    *stats = ServiceStats::default();
                    info!(service, "Circuit breaker closed after successful recovery");
                    return Some(ResilienceEvent::CircuitClosed {
                        service: service.to_string(),
                    });
                }
                None
            }
            CircuitState::Closed => {
                circuit.failures = circuit.failures.saturating_sub(1);
                None
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(
        service: &str,
        circuit: &mut ServiceCircuit,
        stats: &ServiceStats,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Option<ResilienceEvent> {
        circuit.failures += 1;
        circuit.last_failure_time = Some(now);

        match circuit.state {
            CircuitState::Closed => {
                let failure_rate = stats.failure_rate();
                let tripped = stats.total_requests >= config.volume_threshold
                    && failure_rate >= config.failure_threshold_percent;
                if !tripped {
                    return None;
                }

                circuit.state = CircuitState::Open;
                circuit.next_attempt_time = now.checked_add(config.recovery_timeout);
                error!(
                    service,
                    failures = circuit.failures,
                    total_requests = stats.total_requests,
                    failure_rate,
                    "Circuit breaker opened due to high failure rate"
                );
                Some(ResilienceEvent::CircuitOpened {
                    service: service.to_string(),
                    failures: circuit.failures,
                    failure_rate,
                })
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.next_attempt_time = now.checked_add(config.recovery_timeout);
                circuit.success_count = 0;
                warn!(
                    service,
                    "Circuit breaker re-opened after failure in HALF_OPEN state"
                );
                Some(ResilienceEvent::CircuitReopened {
                    service: service.to_string(),
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Open the circuit for `duration` regardless of its history
    pub fn force_open(&self, service: &str, duration: Duration) {
        {
            let mut registry = self.registry.lock();
            let circuit = registry.circuits.entry(service.to_string()).or_default();
            circuit.state = CircuitState::Open;
            circuit.success_count = 0;
            circuit.next_attempt_time = Instant::now().checked_add(duration);
        }
        warn!(
            service,
            duration_ms = duration.as_millis() as u64,
            "Circuit breaker manually opened"
        );
    }

    /// Close the circuit and forget its failure history
    pub fn force_close(&self, service: &str) {
        {
            let mut registry = self.registry.lock();
            registry
                .circuits
                .insert(service.to_string(), ServiceCircuit::default());
            registry.stats.remove(service);
        }
        info!(service, "Circuit breaker manually closed");
    }

    /// Remove all state for a service
    pub fn reset(&self, service: &str) {
        let mut registry = self.registry.lock();
        registry.circuits.remove(service);
        registry.stats.remove(service);
    }

    /// Current state of a service's circuit, `Closed` if never seen
    pub fn state(&self, service: &str) -> CircuitState {
        self.registry
            .lock()
            .circuits
            .get(service)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of a service's circuit
    pub fn snapshot(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        let registry = self.registry.lock();
        let circuit = registry.circuits.get(service)?;
        let stats = registry.stats.get(service).cloned().unwrap_or_default();
        Some(Self::build_snapshot(circuit, &stats))
    }

    /// Snapshots of every known service
    pub fn snapshots(&self) -> HashMap<String, CircuitBreakerSnapshot> {
        let registry = self.registry.lock();
        registry
            .circuits
            .iter()
            .map(|(service, circuit)| {
                let stats = registry.stats.get(service).cloned().unwrap_or_default();
                (service.clone(), Self::build_snapshot(circuit, &stats))
            })
            .collect()
    }

    fn build_snapshot(circuit: &ServiceCircuit, stats: &ServiceStats) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: circuit.state,
            failures: circuit.failures,
            success_count: circuit.success_count,
            total_requests: stats.total_requests,
            successes: stats.successes,
            failure_rate: stats.failure_rate(),
            average_response_time: Duration::from_secs_f64(
                stats.average_response_ms.max(0.0) / 1000.0,
            ),
            last_request_time: stats.last_request_time,
            last_failure_time: circuit.last_failure_time,
            next_attempt_time: circuit.next_attempt_time,
        }
    }

    /// Configuration used for a service's outcome recording
    pub fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.registry
            .lock()
            .configs
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn emit(&self, event: ResilienceEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("default_config", &self.default_config)
            .field("services", &self.registry.lock().circuits.len())
            .finish()
    }
}
