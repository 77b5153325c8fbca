//! Live preview messages delivered to subscribers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, Detection, Point};
use crate::task::TaskId;

/// Track state as shown on a live preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TrackView {
    pub track_id: u64,
    pub class_id: u32,
    pub bbox: BoundingBox,
    pub trajectory: Vec<Point>,
}

/// One annotated frame plus its detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PreviewMessage {
    pub task_id: TaskId,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    /// Base64-encoded JPEG.
    pub image: String,
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub tracks: Vec<TrackView>,
}
