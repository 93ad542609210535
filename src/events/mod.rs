//! State-change notifications for alerting collaborators.
//!
//! Components emit [`ResilienceEvent`]s through a shared [`EventBus`]. Any
//! number of listeners may subscribe; emission is fire-and-forget and a
//! misbehaving listener never affects the component that emitted.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

/// Notification emitted by a resilience component
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A rate limit key was denied
    RateLimitExceeded {
        /// Namespaced key
        key: String,
        /// Requests counted in the window
        requests: u32,
        /// Configured maximum
        limit: u32,
    },
    /// A circuit opened because of its failure rate
    CircuitOpened {
        /// Service name
        service: String,
        /// Decaying failure counter at the moment of opening
        failures: u32,
        /// Failure rate in percent
        failure_rate: f64,
    },
    /// An open circuit let a trial call through
    CircuitHalfOpened {
        /// Service name
        service: String,
    },
    /// A half-open circuit failed a trial call and opened again
    CircuitReopened {
        /// Service name
        service: String,
    },
    /// A circuit recovered and closed
    CircuitClosed {
        /// Service name
        service: String,
    },
    /// A bulkhead refused an operation
    BulkheadRejected {
        /// Service name
        service: String,
        /// `queue_full` or `queue_timeout`
        reason: &'static str,
    },
    /// Entries were evicted to make room
    CacheEvicted {
        /// Number of entries removed
        count: usize,
        /// Bytes released
        freed_bytes: usize,
    },
    /// The expiry sweep removed dead entries
    CacheExpired {
        /// Number of entries removed
        count: usize,
    },
}

impl ResilienceEvent {
    /// Short event name, stable for log and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened",
            Self::CircuitReopened { .. } => "circuit_reopened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::CacheEvicted { .. } => "cache_evicted",
            Self::CacheExpired { .. } => "cache_expired",
        }
    }
}

/// Receives resilience events
///
/// Implementations must return quickly; they run on the emitter's task.
pub trait EventListener: Send + Sync {
    /// Called for every emitted event
    fn on_event(&self, event: &ResilienceEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ResilienceEvent) + Send + Sync,
{
    fn on_event(&self, event: &ResilienceEvent) {
        self(event)
    }
}

/// Fan-out of events to registered listeners
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    /// Create an event bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver an event to every listener
    pub fn emit(&self, event: ResilienceEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if delivered.is_err() {
                error!(event = event.name(), "Event listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<ResilienceEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving half of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResilienceEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &ResilienceEvent) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        bus.emit(ResilienceEvent::CircuitClosed {
            service: "llm".to_string(),
        });
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_closure_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(Arc::new(move |_: &ResilienceEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(ResilienceEvent::CacheExpired { count: 2 });
        bus.emit(ResilienceEvent::CacheExpired { count: 1 });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(Arc::new(|_: &ResilienceEvent| panic!("listener bug")));
        bus.subscribe(Arc::new(move |_: &ResilienceEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(ResilienceEvent::CircuitHalfOpened {
            service: "soap".to_string(),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let bus = EventBus::new();
        let (listener, mut rx) = ChannelListener::new();
        bus.subscribe(Arc::new(listener));

        bus.emit(ResilienceEvent::BulkheadRejected {
            service: "database".to_string(),
            reason: "queue_full",
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "bulkhead_rejected");
    }
}
