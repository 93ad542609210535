//! Bulkhead isolation for downstream services.
//!
//! Each bulkhead caps the operations running against one service. Excess
//! demand waits in a bounded FIFO queue for at most `queue_timeout`; once the
//! queue is full further calls are rejected immediately.
//!
//! A slot is represented by a [`SlotGuard`]. Releasing a slot hands it
//! straight to the oldest live waiter, and the guard travels through that
//! waiter's oneshot channel, so a slot granted to a caller that has since
//! gone away is still released when the channel drops it.

use crate::errors::{BulkheadError, BulkheadRejection, ConfigurationError};
use crate::events::{EventBus, ResilienceEvent};
use crate::resilience::sweep::{spawn_sweep, SweepHandles};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration for one bulkhead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum operations running at once
    pub max_concurrent: usize,
    /// Maximum operations waiting for a slot
    pub max_queue_size: usize,
    /// Longest an operation may wait in the queue
    #[serde(rename = "queue_timeout_ms", with = "crate::config::duration_format::millis")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 50,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrent operations
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Set maximum queue size
    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    /// Set queue timeout
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Managed database: wide, short waits
    pub fn database() -> Self {
        Self::new()
            .max_concurrent(20)
            .max_queue_size(100)
            .queue_timeout(Duration::from_secs(15))
    }

    /// Legacy document service: narrow, patient
    pub fn document_service() -> Self {
        Self::new()
            .max_concurrent(5)
            .max_queue_size(30)
            .queue_timeout(Duration::from_secs(30))
    }

    /// Messaging API
    pub fn messaging() -> Self {
        Self::new()
            .max_concurrent(10)
            .max_queue_size(50)
            .queue_timeout(Duration::from_secs(20))
    }

    /// Text generation API
    pub fn text_generation() -> Self {
        Self::new()
            .max_concurrent(15)
            .max_queue_size(75)
            .queue_timeout(Duration::from_secs(25))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent == 0 {
            return Err(ConfigurationError::invalid(
                "bulkhead max_concurrent must be at least 1",
            ));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigurationError::invalid(
                "bulkhead queue_timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Execution metrics for one bulkhead
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadMetrics {
    /// Operations currently running
    pub active: usize,
    /// Operations currently queued
    pub queued: usize,
    /// Operations that were given a slot
    pub total_executions: u64,
    /// Rejections plus failed operations
    pub failed_executions: u64,
    /// Mean duration of completed operations
    pub average_execution_time: Duration,
    /// When an operation last completed
    pub last_execution: Option<Instant>,
}

/// Capacity view of one bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStatus {
    /// Operations currently running
    pub active: usize,
    /// Operations currently queued
    pub queued: usize,
    /// Configured concurrency
    pub max_concurrent: usize,
    /// Configured queue size
    pub max_queue_size: usize,
}

struct Waiter {
    id: Uuid,
    enqueued_at: Instant,
    grant: oneshot::Sender<SlotGuard>,
}

struct BulkheadState {
    active: usize,
    queue: VecDeque<Waiter>,
    total_executions: u64,
    failed_executions: u64,
    completed_executions: u64,
    total_execution_time: Duration,
    last_execution: Option<Instant>,
    last_activity: Instant,
}

struct BulkheadInner {
    service: String,
    config: BulkheadConfig,
    state: Mutex<BulkheadState>,
    events: Option<Arc<EventBus>>,
}

impl BulkheadInner {
    /// Hand free slots to queued waiters in FIFO order. Waiters whose caller
    /// has gone away are skipped.
    fn dispatch_locked(self: &Arc<Self>, state: &mut BulkheadState) {
        while state.active < self.config.max_concurrent {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            let guard = SlotGuard::new(self.clone());
            match waiter.grant.send(guard) {
                Ok(()) => {
                    state.total_executions += 1;
                    debug!(
                        service = %self.service,
                        item_id = %waiter.id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "Dispatched queued operation"
                    );
                }
                Err(mut guard) => {
                    guard.disarm();
                    state.active -= 1;
                }
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.last_activity = Instant::now();
        self.dispatch_locked(&mut state);
    }

    fn sweep(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.queue.retain(|waiter| !waiter.grant.is_closed());
        self.dispatch_locked(&mut state);
    }

    fn reject(&self, rejection: BulkheadRejection) -> BulkheadRejection {
        warn!(
            service = %self.service,
            reason = rejection.reason(),
            "Bulkhead rejected operation"
        );
        if let Some(events) = &self.events {
            events.emit(ResilienceEvent::BulkheadRejected {
                service: self.service.clone(),
                reason: rejection.reason(),
            });
        }
        rejection
    }
}

/// A held bulkhead slot, released on drop
pub struct SlotGuard {
    inner: Arc<BulkheadInner>,
    armed: bool,
}

impl SlotGuard {
    fn new(inner: Arc<BulkheadInner>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release();
        }
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("service", &self.inner.service)
            .finish()
    }
}

/// Handle to a bulkhead; clones share the same slots and queue
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl Bulkhead {
    /// Create a standalone bulkhead
    pub fn new(
        service: impl Into<String>,
        config: BulkheadConfig,
    ) -> Result<Self, ConfigurationError> {
        Self::build(service.into(), config, None)
    }

    fn build(
        service: String,
        config: BulkheadConfig,
        events: Option<Arc<EventBus>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BulkheadInner {
                service,
                config,
                state: Mutex::new(BulkheadState {
                    active: 0,
                    queue: VecDeque::new(),
                    total_executions: 0,
                    failed_executions: 0,
                    completed_executions: 0,
                    total_execution_time: Duration::ZERO,
                    last_execution: None,
                    last_activity: Instant::now(),
                }),
                events,
            }),
        })
    }

    /// Service this bulkhead protects
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Configuration in effect
    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    /// Run `operation` once a slot is available.
    ///
    /// The operation's own error is passed through as
    /// [`BulkheadError::Operation`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.acquire().await?;
        let started = Instant::now();
        let result = operation().await;
        self.record_completion(started.elapsed(), result.is_ok());
        result.map_err(BulkheadError::Operation)
    }

    /// Wait for a slot without running anything
    pub async fn acquire(&self) -> Result<SlotGuard, BulkheadRejection> {
        let inner = &self.inner;
        let (id, mut grant) = {
            let mut state = inner.state.lock();
            state.last_activity = Instant::now();
            // Waiters whose callers gave up still occupy queue positions
            state.queue.retain(|waiter| !waiter.grant.is_closed());
            inner.dispatch_locked(&mut state);

            if state.active < inner.config.max_concurrent {
                state.active += 1;
                state.total_executions += 1;
                return Ok(SlotGuard::new(inner.clone()));
            }

            if state.queue.len() >= inner.config.max_queue_size {
                state.failed_executions += 1;
                drop(state);
                return Err(inner.reject(BulkheadRejection::QueueFull {
                    service: inner.service.clone(),
                }));
            }

            let (tx, rx) = oneshot::channel();
            let id = Uuid::new_v4();
            state.queue.push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                grant: tx,
            });
            debug!(
                service = %inner.service,
                item_id = %id,
                queued = state.queue.len(),
                "Operation queued"
            );
            (id, rx)
        };

        let enqueued_at = Instant::now();
        match tokio::time::timeout(inner.config.queue_timeout, &mut grant).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(self.timed_out(enqueued_at)),
            Err(_) => {
                let still_queued = {
                    let mut state = inner.state.lock();
                    match state.queue.iter().position(|waiter| waiter.id == id) {
                        Some(pos) => {
                            state.queue.remove(pos);
                            state.failed_executions += 1;
                            true
                        }
                        None => false,
                    }
                };
                if still_queued {
                    return Err(self.timed_out(enqueued_at));
                }
                // Granted between the timer firing and taking the lock.
                grant.try_recv().map_err(|_| self.timed_out(enqueued_at))
            }
        }
    }

    fn timed_out(&self, enqueued_at: Instant) -> BulkheadRejection {
        self.inner.reject(BulkheadRejection::QueueTimeout {
            service: self.inner.service.clone(),
            waited: enqueued_at.elapsed(),
        })
    }

    fn record_completion(&self, elapsed: Duration, success: bool) {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        state.completed_executions += 1;
        state.total_execution_time += elapsed;
        state.last_execution = Some(now);
        state.last_activity = now;
        if !success {
            state.failed_executions += 1;
        }
    }

    /// Current metrics
    pub fn metrics(&self) -> BulkheadMetrics {
        let state = self.inner.state.lock();
        let average_execution_time = if state.completed_executions == 0 {
            Duration::ZERO
        } else {
            let completed = u32::try_from(state.completed_executions).unwrap_or(u32::MAX);
            state.total_execution_time / completed
        };
        BulkheadMetrics {
            active: state.active,
            queued: state.queue.len(),
            total_executions: state.total_executions,
            failed_executions: state.failed_executions,
            average_execution_time,
            last_execution: state.last_execution,
        }
    }

    /// Current capacity usage
    pub fn status(&self) -> BulkheadStatus {
        let state = self.inner.state.lock();
        BulkheadStatus {
            active: state.active,
            queued: state.queue.len(),
            max_concurrent: self.inner.config.max_concurrent,
            max_queue_size: self.inner.config.max_queue_size,
        }
    }

    /// Prune abandoned waiters and dispatch into free slots
    pub fn dispatch_pending(&self) {
        self.inner.sweep();
    }

    fn is_idle_at(&self, now: Instant, idle_after: Duration) -> bool {
        let state = self.inner.state.lock();
        state.active == 0
            && state.queue.is_empty()
            && now.saturating_duration_since(state.last_activity) >= idle_after
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("service", &self.inner.service)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Timing for the registry's background maintenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadRegistryConfig {
    /// How often queued work is dispatched into free slots
    #[serde(rename = "dispatch_interval_ms", with = "crate::config::duration_format::millis")]
    pub dispatch_interval: Duration,
    /// How often idle bulkheads are looked for
    #[serde(rename = "cleanup_interval_ms", with = "crate::config::duration_format::millis")]
    pub cleanup_interval: Duration,
    /// Inactivity after which an empty bulkhead is removed
    #[serde(rename = "idle_timeout_ms", with = "crate::config::duration_format::millis")]
    pub idle_timeout: Duration,
}

impl Default for BulkheadRegistryConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl BulkheadRegistryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.dispatch_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "bulkhead sweep intervals must be positive",
            ));
        }
        Ok(())
    }
}

/// Bulkheads by service name
pub struct BulkheadRegistry {
    config: BulkheadRegistryConfig,
    bulkheads: RwLock<HashMap<String, Bulkhead>>,
    events: Option<Arc<EventBus>>,
    sweeps: SweepHandles,
}

impl BulkheadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_config(BulkheadRegistryConfig::default())
    }

    /// Create an empty registry with custom maintenance timing
    pub fn with_config(config: BulkheadRegistryConfig) -> Self {
        Self {
            config,
            bulkheads: RwLock::new(HashMap::new()),
            events: None,
            sweeps: SweepHandles::default(),
        }
    }

    /// Publish rejections on an event bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Get the bulkhead for `service`, creating it with `config` if absent.
    ///
    /// An existing bulkhead keeps the configuration it was created with.
    pub fn get_or_create(
        &self,
        service: &str,
        config: BulkheadConfig,
    ) -> Result<Bulkhead, ConfigurationError> {
        if let Some(bulkhead) = self.bulkheads.read().get(service) {
            return Ok(bulkhead.clone());
        }

        let mut bulkheads = self.bulkheads.write();
        if let Some(bulkhead) = bulkheads.get(service) {
            return Ok(bulkhead.clone());
        }
        let bulkhead = Bulkhead::build(service.to_string(), config, self.events.clone())?;
        debug!(service, config = ?bulkhead.config(), "Bulkhead created");
        bulkheads.insert(service.to_string(), bulkhead.clone());
        Ok(bulkhead)
    }

    /// Get an existing bulkhead
    pub fn get(&self, service: &str) -> Option<Bulkhead> {
        self.bulkheads.read().get(service).cloned()
    }

    /// Metrics for one service
    pub fn metrics(&self, service: &str) -> Option<BulkheadMetrics> {
        self.get(service).map(|b| b.metrics())
    }

    /// Metrics for every service
    pub fn all_metrics(&self) -> HashMap<String, BulkheadMetrics> {
        self.snapshot()
            .into_iter()
            .map(|(service, bulkhead)| (service, bulkhead.metrics()))
            .collect()
    }

    /// Capacity usage for every service
    pub fn all_status(&self) -> HashMap<String, BulkheadStatus> {
        self.snapshot()
            .into_iter()
            .map(|(service, bulkhead)| (service, bulkhead.status()))
            .collect()
    }

    fn snapshot(&self) -> Vec<(String, Bulkhead)> {
        self.bulkheads
            .read()
            .iter()
            .map(|(service, bulkhead)| (service.clone(), bulkhead.clone()))
            .collect()
    }

    /// Dispatch queued work in every bulkhead
    pub fn dispatch_all(&self) {
        for (_, bulkhead) in self.snapshot() {
            bulkhead.dispatch_pending();
        }
    }

    /// Remove bulkheads idle for longer than the configured timeout
    pub fn cleanup_idle(&self) -> usize {
        self.cleanup_idle_at(Instant::now())
    }

    /// [`Self::cleanup_idle`] at an explicit instant
    pub fn cleanup_idle_at(&self, now: Instant) -> usize {
        let idle_after = self.config.idle_timeout;
        let mut bulkheads = self.bulkheads.write();
        let before = bulkheads.len();
        bulkheads.retain(|service, bulkhead| {
            let idle = bulkhead.is_idle_at(now, idle_after);
            if idle {
                debug!(service = %service, "Removing idle bulkhead");
            }
            !idle
        });
        before - bulkheads.len()
    }

    /// Start the dispatch and idle-cleanup sweeps. Requires a Tokio runtime.
    pub fn start_sweeps(self: &Arc<Self>) {
        self.sweeps.push(spawn_sweep(
            self,
            self.config.dispatch_interval,
            "bulkhead_dispatch",
            |registry: &BulkheadRegistry| registry.dispatch_all(),
        ));
        self.sweeps.push(spawn_sweep(
            self,
            self.config.cleanup_interval,
            "bulkhead_cleanup",
            |registry: &BulkheadRegistry| {
                registry.cleanup_idle();
            },
        ));
    }

    /// Whether background sweeps are running
    pub fn sweeps_running(&self) -> bool {
        self.sweeps.is_running()
    }

    /// Stop background sweeps
    pub fn shutdown(&self) {
        self.sweeps.abort_all();
    }
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BulkheadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadRegistry")
            .field("config", &self.config)
            .field("bulkheads", &self.bulkheads.read().len())
            .field("sweeps", &self.sweeps)
            .finish()
    }
}
