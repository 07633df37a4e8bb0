//! One-shot deferred actions.
//!
//! Used for delayed stream starts, duration-based stops and upload expiry.
//! A timer is never cancelled by the stream it belongs to; its callback must
//! tolerate firing against a job that already ended. Only the scheduler-wide
//! shutdown token drops pending timers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A handle to an armed timer.
#[derive(Debug)]
pub struct TimerHandle {
    /// Human readable timer label.
    pub label: String,
    /// Wall-clock time the callback is due.
    pub fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Whether the callback has run (or the timer was dropped at shutdown).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the timer to fire and its callback to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            debug!(timer = %self.label, error = %e, "Timer task ended abnormally");
        }
    }
}

/// Spawns one-shot timers on the tokio runtime.
#[derive(Clone, Debug)]
pub struct Scheduler {
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `action` once after `delay` without blocking the caller.
    pub fn schedule<F, Fut>(&self, label: impl Into<String>, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let fires_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let shutdown = self.shutdown.clone();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);

        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            trace!(timer = %task_label, delay_secs = delay.as_secs_f64(), "Timer armed");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(timer = %task_label, "Timer dropped at shutdown");
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(delay) => {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    debug!(timer = %task_label, "Timer fired");
                    action().await;
                }
            }
        });

        TimerHandle {
            label,
            fires_at,
            handle,
        }
    }

    /// Number of timers armed but not yet fired.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Drop every pending timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
