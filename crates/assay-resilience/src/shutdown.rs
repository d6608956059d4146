use assay_core::{AssayError, AssayResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

struct Inner {
    draining: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    trigger_tx: watch::Sender<bool>,
}

/// Coordinates graceful shutdown: stop accepting work, then wait for
/// in-flight sessions to settle up to a grace period.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

/// Held for the lifetime of one unit of in-flight work.
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (trigger_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                draining: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                trigger_tx,
            }),
        }
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Number of tracked units of work still running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Register a new unit of work. Fails with `ShuttingDown` once draining.
    pub fn track(&self) -> AssayResult<InFlightGuard> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            inner: self.inner.clone(),
        };
        if self.is_shutting_down() {
            return Err(AssayError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Begin shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "Shutdown triggered");
            self.inner.trigger_tx.send_replace(true);
        }
    }

    /// Resolves once [`ShutdownCoordinator::trigger`] has been called.
    pub async fn triggered(&self) {
        let mut rx = self.inner.trigger_tx.subscribe();
        let _ = rx.wait_for(|draining| *draining).await;
    }

    /// Trigger shutdown and wait for in-flight work to finish.
    /// Returns `false` if the grace period ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.trigger();
        let wait = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(grace, wait).await {
            Ok(()) => {
                info!("All in-flight work drained");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.in_flight(),
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed with work still in flight"
                );
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
