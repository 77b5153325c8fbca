//! Detector capability.
//!
//! The inference engine is a black box: a loaded [`Detector`] turns a frame
//! into boxes, and a [`DetectorFactory`] loads detectors by model identifier.

use std::sync::Arc;

use async_trait::async_trait;
use camwatch_models::Detection;

use crate::error::VisionResult;
use crate::frame::Frame;

/// Thresholds passed with every inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub confidence: f32,
    pub iou_threshold: f32,
}

/// Stage timings reported by a detector, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceTimings {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

impl InferenceTimings {
    pub fn total_ms(&self) -> f64 {
        self.preprocess_ms + self.inference_ms + self.postprocess_ms
    }
}

/// Result of one inference call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inference {
    pub detections: Vec<Detection>,
    pub timings: InferenceTimings,
}

/// A loaded model instance.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn infer(&self, frame: &Frame, params: InferenceParams) -> VisionResult<Inference>;

    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Approximate resident memory, used for cache accounting.
    fn memory_bytes(&self) -> u64 {
        0
    }
}

/// Loads detector instances.
#[async_trait]
pub trait DetectorFactory: Send + Sync {
    async fn load(&self, model_path: &str, confidence: f32) -> VisionResult<Arc<dyn Detector>>;
}
