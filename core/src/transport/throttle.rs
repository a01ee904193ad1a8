// Throttle — process-wide read/write byte budgets
//
// One `Throttle` is shared by every connection (passed by `Arc`). Each
// socket operation adds its byte count to the matching counter. Once a
// counter passes its per-window ceiling, connections wait in `ready()`
// until the refill task opens the next window. A single operation larger
// than the ceiling still goes through when the window is fresh.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default refill window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ByteCounter {
    /// Bytes allowed per window, 0 = unlimited
    limit: AtomicU64,
    /// Bytes used in the current window
    used: AtomicU64,
    /// Bytes since creation
    total: AtomicU64,
    enforcing: AtomicBool,
    refilled: Notify,
}

impl ByteCounter {
    pub fn new(limit: u64) -> Self {
        let counter = Self::default();
        counter.limit.store(limit, Ordering::Relaxed);
        counter
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Add `bytes` to the current window and the running total.
    pub fn record(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// True while the current window is over budget.
    pub fn exceeded(&self) -> bool {
        let limit = self.limit();
        self.enforcing.load(Ordering::Acquire)
            && limit > 0
            && self.used.load(Ordering::Acquire) >= limit
    }

    /// Wait until the counter is under budget.
    pub async fn ready(&self) {
        loop {
            // Register before checking so a refill in between is not missed
            let refilled = self.refilled.notified();
            if !self.exceeded() {
                return;
            }
            trace!("Throttle budget exhausted, backing off");
            refilled.await;
        }
    }

    fn refill(&self) {
        self.used.store(0, Ordering::Release);
        self.refilled.notify_waiters();
    }

    fn set_enforcing(&self, enforcing: bool) {
        self.enforcing.store(enforcing, Ordering::Release);
        if !enforcing {
            self.refill();
        }
    }
}

/// Read and write budgets with a refill task
#[derive(Debug)]
pub struct Throttle {
    pub read: ByteCounter,
    pub write: ByteCounter,
    window: Duration,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Throttle {
    /// Ceilings in bytes per second, 0 = unlimited.
    pub fn new(read_limit: u64, write_limit: u64) -> Self {
        Self::with_window(read_limit, write_limit, DEFAULT_WINDOW)
    }

    /// Ceilings per `window` instead of per second.
    pub fn with_window(read_limit: u64, write_limit: u64, window: Duration) -> Self {
        Self {
            read: ByteCounter::new(read_limit),
            write: ByteCounter::new(write_limit),
            window,
            refill_task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.refill_task.lock().is_some()
    }

    /// Start enforcing limits and refilling once per window.
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.refill_task.lock();
        if task.is_some() {
            return;
        }

        self.read.set_enforcing(true);
        self.write.set_enforcing(true);

        let throttle = Arc::downgrade(self);
        let window = self.window;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(throttle) = throttle.upgrade() else {
                    break;
                };
                throttle.read.refill();
                throttle.write.refill();
            }
        }));
        debug!(
            "Throttle started (read {} B, write {} B per {:?})",
            self.read.limit(),
            self.write.limit(),
            window
        );
    }

    /// Stop the refill task. Limits are no longer enforced and every
    /// waiting connection is released.
    pub fn stop(&self) {
        if let Some(task) = self.refill_task.lock().take() {
            task.abort();
        }
        self.read.set_enforcing(false);
        self.write.set_enforcing(false);
        debug!("Throttle stopped");
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if let Some(task) = self.refill_task.lock().take() {
            task.abort();
        }
    }
}
