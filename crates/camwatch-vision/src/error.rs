//! Vision error types.

use thiserror::Error;

pub type VisionResult<T> = Result<T, VisionError>;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Stream open failed: {0}")]
    StreamOpen(String),

    #[error("Stream read failed: {0}")]
    StreamRead(String),

    #[error("Stream timed out after {0:?}")]
    StreamTimeout(std::time::Duration),

    #[error("Detector load failed: {0}")]
    DetectorLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VisionError {
    pub fn stream_open(msg: impl Into<String>) -> Self {
        Self::StreamOpen(msg.into())
    }

    pub fn stream_read(msg: impl Into<String>) -> Self {
        Self::StreamRead(msg.into())
    }

    pub fn detector_load(msg: impl Into<String>) -> Self {
        Self::DetectorLoad(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }
}
