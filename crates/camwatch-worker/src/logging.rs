//! Per-task structured logging.
//!
//! Each task runs several components (capture, processing, events). A
//! [`TaskLogger`] stamps every line with the task id and the component so
//! one camera can be followed through the log.

use camwatch_models::TaskId;
use tracing::{error, info, warn, Span};

#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_id: TaskId,
    component: &'static str,
}

impl TaskLogger {
    pub fn new(task_id: &TaskId, component: &'static str) -> Self {
        Self {
            task_id: task_id.clone(),
            component,
        }
    }

    pub fn log_start(&self, detail: &str) {
        info!(task_id = %self.task_id, component = self.component, "{} up: {}", self.component, detail);
    }

    pub fn log_progress(&self, detail: &str) {
        info!(task_id = %self.task_id, component = self.component, "{}", detail);
    }

    pub fn log_warning(&self, detail: &str) {
        warn!(task_id = %self.task_id, component = self.component, "{}", detail);
    }

    pub fn log_error(&self, detail: &str) {
        error!(task_id = %self.task_id, component = self.component, "{}", detail);
    }

    pub fn log_completion(&self, detail: &str) {
        info!(task_id = %self.task_id, component = self.component, "{} down: {}", self.component, detail);
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Span entered by the capture thread for its whole lifetime.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("camera_task", task_id = %self.task_id, component = self.component)
    }
}
