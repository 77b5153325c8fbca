//! Per-camera detection task configuration.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ModelError, ModelResult};
use crate::schedule::ScheduleSpec;
use crate::zone::{ZoneConfig, ZoneConfigSpec};

/// Default detector confidence threshold.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;
/// Default detector NMS IoU threshold.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// Default IoU required to continue a track.
pub const DEFAULT_TRACK_IOU_THRESHOLD: f64 = 0.3;
/// Default cooldown between materialized events.
pub const DEFAULT_EVENT_COOLDOWN_SECS: u64 = 10;
/// Default event retention window.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Unique identifier for a detection task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What is stored alongside a materialized event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Detection events are not stored; zone events are stored without a snapshot.
    None,
    /// Annotated JPEG snapshot.
    #[default]
    Snapshot,
    /// Snapshot plus a clip request flag for the store.
    SnapshotClip,
}

impl SaveMode {
    pub fn wants_snapshot(&self) -> bool {
        !matches!(self, SaveMode::None)
    }

    pub fn wants_clip(&self) -> bool {
        matches!(self, SaveMode::SnapshotClip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyMode {
    #[default]
    Continuous,
    Scheduled,
    Manual,
}

fn default_confidence() -> f32 {
    DEFAULT_CONFIDENCE
}
fn default_iou() -> f32 {
    DEFAULT_IOU_THRESHOLD
}
fn default_track_iou() -> f64 {
    DEFAULT_TRACK_IOU_THRESHOLD
}
fn default_cooldown() -> u64 {
    DEFAULT_EVENT_COOLDOWN_SECS
}
fn default_retention() -> u32 {
    DEFAULT_RETENTION_DAYS
}

/// Task configuration as stored externally.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct TaskConfigSpec {
    #[validate(length(min = 1))]
    pub task_id: String,
    #[validate(length(min = 1))]
    pub camera_id: String,
    /// Connection descriptor handed to the stream source.
    #[validate(length(min = 1))]
    pub stream_url: String,
    #[serde(default)]
    #[validate(range(min = 16, max = 8192))]
    pub frame_width: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 16, max = 8192))]
    pub frame_height: Option<u32>,
    #[validate(length(min = 1))]
    pub model_path: String,
    #[serde(default = "default_confidence")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub iou_threshold: f32,
    #[serde(default = "default_track_iou")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub track_iou_threshold: f64,
    /// Empty means every class.
    #[serde(default)]
    pub target_classes: Vec<u32>,
    #[serde(default)]
    pub save_mode: SaveMode,
    #[serde(default)]
    pub frequency_mode: FrequencyMode,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default = "default_cooldown")]
    pub event_cooldown_seconds: u64,
    #[serde(default = "default_retention")]
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: u32,
    #[serde(default)]
    pub push_tag: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub zone_config: Option<ZoneConfigSpec>,
}

/// Validated, immutable task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskConfig {
    pub task_id: TaskId,
    pub camera_id: String,
    pub stream_url: String,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub model_path: String,
    pub confidence: f32,
    pub iou_threshold: f32,
    pub track_iou_threshold: f64,
    pub target_classes: BTreeSet<u32>,
    pub save_mode: SaveMode,
    pub frequency_mode: FrequencyMode,
    pub schedule: Option<ScheduleSpec>,
    pub event_cooldown_seconds: u64,
    pub retention_days: u32,
    pub push_tag: Option<String>,
    pub enabled: bool,
    pub zone: Option<ZoneConfig>,
}

impl TryFrom<TaskConfigSpec> for TaskConfig {
    type Error = ModelError;

    fn try_from(spec: TaskConfigSpec) -> ModelResult<Self> {
        spec.validate()?;

        if spec.frame_width.is_some() != spec.frame_height.is_some() {
            return Err(ModelError::invalid_config(
                "frame_width and frame_height must be set together",
            ));
        }

        if let Some(schedule) = &spec.schedule {
            schedule.validate()?;
        }
        if spec.frequency_mode == FrequencyMode::Scheduled && spec.schedule.is_none() {
            return Err(ModelError::invalid_config(
                "scheduled frequency mode requires a schedule",
            ));
        }

        let zone = spec.zone_config.map(ZoneConfig::try_from).transpose()?;

        Ok(TaskConfig {
            task_id: TaskId(spec.task_id),
            camera_id: spec.camera_id,
            stream_url: spec.stream_url,
            frame_width: spec.frame_width,
            frame_height: spec.frame_height,
            model_path: spec.model_path,
            confidence: spec.confidence,
            iou_threshold: spec.iou_threshold,
            track_iou_threshold: spec.track_iou_threshold,
            target_classes: spec.target_classes.into_iter().collect(),
            save_mode: spec.save_mode,
            frequency_mode: spec.frequency_mode,
            schedule: spec.schedule,
            event_cooldown_seconds: spec.event_cooldown_seconds,
            retention_days: spec.retention_days,
            push_tag: spec.push_tag.filter(|t| !t.trim().is_empty()),
            enabled: spec.enabled,
            zone,
        })
    }
}

impl TaskConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(value: serde_json::Value) -> ModelResult<Self> {
        let spec: TaskConfigSpec = serde_json::from_value(value)
            .map_err(|e| ModelError::invalid_config(e.to_string()))?;
        Self::try_from(spec)
    }

    /// Whether detections of `class_id` are of interest to this task.
    pub fn accepts_class(&self, class_id: u32) -> bool {
        self.target_classes.is_empty() || self.target_classes.contains(&class_id)
    }

    pub fn is_scheduled(&self) -> bool {
        self.frequency_mode == FrequencyMode::Scheduled
    }

    /// Cooldown applied to detection events.
    pub fn event_cooldown(&self) -> Duration {
        Duration::from_secs(self.event_cooldown_seconds)
    }

    /// Cooldown applied to gated zone events (occupancy changes).
    pub fn zone_cooldown(&self) -> Duration {
        self.zone
            .as_ref()
            .and_then(|z| z.cooldown_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.event_cooldown())
    }

    /// Push tag for outbound notifications; the zone tag wins over the task tag.
    pub fn push_tag(&self) -> Option<&str> {
        self.zone
            .as_ref()
            .and_then(|z| z.push_tag.as_deref())
            .or(self.push_tag.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> serde_json::Value {
        serde_json::json!({
            "task_id": "cam-1",
            "camera_id": "front-door",
            "stream_url": "rtsp://10.0.0.5/stream1",
            "model_path": "models/yolov8n.onnx"
        })
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = TaskConfig::from_json(base()).unwrap();
        assert_eq!(cfg.task_id.as_str(), "cam-1");
        assert_eq!(cfg.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(cfg.event_cooldown(), Duration::from_secs(10));
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.save_mode, SaveMode::Snapshot);
        assert!(cfg.zone.is_none());
        assert!(cfg.accepts_class(7));
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let mut json = base();
        json["confidence"] = serde_json::json!(1.5);
        assert!(matches!(
            TaskConfig::from_json(json),
            Err(ModelError::Validation(_))
        ));
    }

    #[test]
    fn test_scheduled_requires_schedule() {
        let mut json = base();
        json["frequency_mode"] = serde_json::json!("scheduled");
        assert!(TaskConfig::from_json(json).is_err());
    }

    #[test]
    fn test_target_classes_filter() {
        let mut json = base();
        json["target_classes"] = serde_json::json!([0, 2]);
        let cfg = TaskConfig::from_json(json).unwrap();
        assert!(cfg.accepts_class(0));
        assert!(!cfg.accepts_class(1));
    }

    #[test]
    fn test_malformed_zone_rejected() {
        let mut json = base();
        json["zone_config"] = serde_json::json!({
            "analysis_kind": "counting",
            "geometry": "polygon",
            "points": [{"x": 0.1, "y": 0.1}, {"x": 0.9, "y": 0.1}, {"x": 0.5, "y": 0.9}]
        });
        assert!(matches!(
            TaskConfig::from_json(json),
            Err(ModelError::InvalidZone(_))
        ));
    }

    #[test]
    fn test_zone_overrides_cooldown_and_tag() {
        let mut json = base();
        json["push_tag"] = serde_json::json!("task-tag");
        json["zone_config"] = serde_json::json!({
            "analysis_kind": "counting",
            "counting_kind": "occupancy",
            "geometry": "polygon",
            "points": [{"x": 0.1, "y": 0.1}, {"x": 0.9, "y": 0.1}, {"x": 0.5, "y": 0.9}],
            "cooldown_seconds": 3,
            "push_tag": "zone-tag"
        });
        let cfg = TaskConfig::from_json(json).unwrap();
        assert_eq!(cfg.zone_cooldown(), Duration::from_secs(3));
        assert_eq!(cfg.push_tag(), Some("zone-tag"));
    }
}
