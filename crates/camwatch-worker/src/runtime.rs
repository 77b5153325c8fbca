//! Shared, lock-light runtime state of one task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use camwatch_models::{Counts, TaskId, TaskState, TaskStatus};
use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
struct Lifecycle {
    state: TaskState,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    counts: Counts,
}

/// Status written by the task's threads and read by `status()` callers.
///
/// Every critical section is a field copy; readers never wait on I/O.
#[derive(Debug)]
pub struct RuntimeStatus {
    task_id: TaskId,
    lifecycle: Mutex<Lifecycle>,
    connected: AtomicBool,
    frames: AtomicU64,
}

impl RuntimeStatus {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Connecting,
                started_at: Some(Utc::now()),
                ..Default::default()
            }),
            connected: AtomicBool::new(false),
            frames: AtomicU64::new(0),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> R {
        let mut guard = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_state(&self, state: TaskState) {
        self.connected
            .store(state == TaskState::Connected, Ordering::SeqCst);
        self.with(|l| {
            l.state = state;
            if state == TaskState::Connected {
                l.reconnect_attempts = 0;
            }
        });
    }

    /// Record a fatal error; the task is reported as `error` from now on.
    pub fn set_error(&self, message: impl Into<String>) {
        self.connected.store(false, Ordering::SeqCst);
        let message = message.into();
        self.with(|l| {
            l.state = TaskState::Error;
            l.last_error = Some(message);
        });
    }

    /// Note a non-fatal error without changing state.
    pub fn note_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.with(|l| l.last_error = Some(message));
    }

    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.with(|l| l.reconnect_attempts = attempts);
    }

    pub fn record_frame(&self) -> u64 {
        self.frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn update_counts(&self, counts: Counts) {
        self.with(|l| l.counts = counts);
    }

    pub fn state(&self) -> TaskState {
        self.with(|l| l.state)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, subscribers: usize) -> TaskStatus {
        let frames_captured = self.frames.load(Ordering::Relaxed);
        self.with(|l| TaskStatus {
            task_id: self.task_id.clone(),
            state: l.state,
            running: !l.state.is_terminal(),
            connected: l.state == TaskState::Connected,
            subscribers,
            last_error: l.last_error.clone(),
            frames_captured,
            reconnect_attempts: l.reconnect_attempts,
            counts: l.counts,
            started_at: l.started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_resets_attempts() {
        let status = RuntimeStatus::new(TaskId::from("cam-1"));
        status.set_reconnect_attempts(3);
        status.set_state(TaskState::Connected);

        let snap = status.snapshot(2);
        assert!(snap.running);
        assert!(snap.connected);
        assert_eq!(snap.reconnect_attempts, 0);
        assert_eq!(snap.subscribers, 2);
    }

    #[test]
    fn test_error_is_terminal() {
        let status = RuntimeStatus::new(TaskId::from("cam-1"));
        status.set_state(TaskState::Connected);
        status.set_error("gave up after 5 reconnect attempts");

        let snap = status.snapshot(0);
        assert_eq!(snap.state, TaskState::Error);
        assert!(!snap.running);
        assert!(!status.is_connected());
        assert_eq!(
            snap.last_error.as_deref(),
            Some("gave up after 5 reconnect attempts")
        );
    }
}
