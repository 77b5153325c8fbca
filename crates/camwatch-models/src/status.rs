//! Task status reported to operators.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::Counts;
use crate::task::TaskId;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered with the scheduler, waiting for a trigger.
    Scheduled,
    Connecting,
    Connected,
    /// Fatal for this task; see `last_error`.
    Error,
    #[default]
    Stopped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Connecting => "connecting",
            TaskState::Connected => "connected",
            TaskState::Error => "error",
            TaskState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Error | TaskState::Stopped)
    }
}

/// Point-in-time status of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub running: bool,
    pub connected: bool,
    pub subscribers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub frames_captured: u64,
    pub reconnect_attempts: u32,
    pub counts: Counts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// Status for a task that has no runtime state.
    pub fn stopped(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Stopped,
            running: false,
            connected: false,
            subscribers: 0,
            last_error: None,
            frames_captured: 0,
            reconnect_attempts: 0,
            counts: Counts::default(),
            started_at: None,
        }
    }
}
