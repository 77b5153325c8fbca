//! Worker error types.

use camwatch_models::TaskId;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Detector load failed: {0}")]
    DetectorLoad(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Store operation failed: {0}")]
    StoreFailed(String),

    #[error("Push failed: {0}")]
    PushFailed(String),

    #[error("Subscriber disconnected: {0}")]
    SubscriberGone(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid task config: {0}")]
    Model(#[from] camwatch_models::ModelError),

    #[error("Vision error: {0}")]
    Vision(#[from] camwatch_vision::VisionError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn detector_load(msg: impl Into<String>) -> Self {
        Self::DetectorLoad(msg.into())
    }

    pub fn task_failed(msg: impl Into<String>) -> Self {
        Self::TaskFailed(msg.into())
    }

    pub fn store_failed(msg: impl Into<String>) -> Self {
        Self::StoreFailed(msg.into())
    }

    pub fn push_failed(msg: impl Into<String>) -> Self {
        Self::PushFailed(msg.into())
    }

    pub fn subscriber_gone(msg: impl Into<String>) -> Self {
        Self::SubscriberGone(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether the error was caused by a rejected configuration.
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, WorkerError::Model(_) | WorkerError::ConfigError(_))
    }
}
