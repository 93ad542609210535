//! Periodic background maintenance tasks.
//!
//! A sweep holds only a weak reference to the component it maintains, so it
//! never keeps that component alive and stops on its own once the component
//! is dropped. A panicking tick is logged and the sweep keeps running.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Spawn a sweep that calls `tick` on `owner` every `every`.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn_sweep<T, F>(
    owner: &Arc<T>,
    every: Duration,
    name: &'static str,
    tick: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    let weak = Arc::downgrade(owner);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(owner) = weak.upgrade() else {
                debug!(sweep = name, "Owner dropped, stopping sweep");
                break;
            };
            if catch_unwind(AssertUnwindSafe(|| tick(&owner))).is_err() {
                error!(sweep = name, "Sweep tick panicked");
            }
        }
    })
}

/// Owned set of sweep tasks, aborted on shutdown or drop
#[derive(Default)]
pub(crate) struct SweepHandles {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SweepHandles {
    pub(crate) fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    pub(crate) fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SweepHandles {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl std::fmt::Debug for SweepHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepHandles")
            .field("count", &self.handles.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);

    #[tokio::test(start_paused = true)]
    async fn test_sweep_ticks() {
        let owner = Arc::new(Counter(AtomicU32::new(0)));
        let handle = spawn_sweep(&owner, Duration::from_millis(100), "test", |c: &Counter| {
            c.0.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(owner.0.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_survives_panic() {
        let owner = Arc::new(Counter(AtomicU32::new(0)));
        let handle = spawn_sweep(&owner, Duration::from_millis(10), "test", |c: &Counter| {
            if c.0.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(owner.0.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_when_owner_dropped() {
        let owner = Arc::new(Counter(AtomicU32::new(0)));
        let handle = spawn_sweep(&owner, Duration::from_millis(10), "test", |_: &Counter| {});
        drop(owner);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(handle.is_finished());
    }
}
