//! Task-scoped cancellation shared by the capture thread and async loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
    signal: watch::Sender<bool>,
}

/// Cancellation flag observable from both blocking threads and async tasks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
                signal,
            }),
        }
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.wake.notify_all();
        }
        self.inner.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block the calling thread for up to `duration`.
    ///
    /// Returns `true` if the token was cancelled before or during the wait.
    pub fn sleep_blocking(&self, duration: Duration) -> bool {
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _) = self
            .inner
            .wake
            .wait_timeout_while(guard, duration, |_| !self.is_cancelled())
            .unwrap_or_else(|e| e.into_inner());
        self.is_cancelled()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.signal.subscribe();
        loop {
            if *rx.borrow_and_update() || self.is_cancelled() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
