//! # Stop Signalling
//!
//! A cooperative stop signal used three ways: broadcasting server shutdown,
//! waking the GC loop out of its jittered sleep, and cancelling an individual
//! streaming request.
//!
//! The condvar backing gives sub-millisecond wakeup latency: a thread blocked
//! in [`StopSignal::wait_timeout`] wakes as soon as [`StopSignal::trigger`]
//! runs instead of sleeping out the full interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A clonable one-shot stop flag with an interruptible timed wait.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    /// Create a new signal in the not-stopped state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Trip the signal. Wakes all waiters immediately.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Whether the signal has been tripped (non-blocking).
    pub fn is_stopped(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking immediately on [`trigger`].
    /// Returns `true` if the signal was tripped.
    ///
    /// [`trigger`]: StopSignal::trigger
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_stopped()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
