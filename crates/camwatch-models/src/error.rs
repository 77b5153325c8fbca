//! Configuration validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid task config: {0}")]
    InvalidConfig(String),

    #[error("Invalid zone config: {0}")]
    InvalidZone(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl ModelError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_zone(msg: impl Into<String>) -> Self {
        Self::InvalidZone(msg.into())
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }
}
