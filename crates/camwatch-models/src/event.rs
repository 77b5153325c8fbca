//! Semantic events and the shapes they are persisted and pushed in.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{Detection, Point};
use crate::task::TaskId;

/// Kind of semantic fact raised by the tracker or the event pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Detection,
    ZoneEnter,
    ZoneExit,
    LineCross,
    LineCrossIn,
    LineCrossOut,
    OccupancyIncrease,
    OccupancyDecrease,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Detection => "detection",
            EventKind::ZoneEnter => "zone_enter",
            EventKind::ZoneExit => "zone_exit",
            EventKind::LineCross => "line_cross",
            EventKind::LineCrossIn => "line_cross_in",
            EventKind::LineCrossOut => "line_cross_out",
            EventKind::OccupancyIncrease => "occupancy_increase",
            EventKind::OccupancyDecrease => "occupancy_decrease",
        }
    }

    /// Human-readable description used in records and push payloads.
    pub fn description(&self) -> &'static str {
        match self {
            EventKind::Detection => "Target detected",
            EventKind::ZoneEnter => "Target entered area",
            EventKind::ZoneExit => "Target left area",
            EventKind::LineCross => "Target crossed line",
            EventKind::LineCrossIn => "Target crossed line inward",
            EventKind::LineCrossOut => "Target crossed line outward",
            EventKind::OccupancyIncrease => "Occupancy increased",
            EventKind::OccupancyDecrease => "Occupancy decreased",
        }
    }
}

/// Which analysis produced an event. Drives gating and categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Detection,
    Behavior,
    Occupancy,
    Flow,
}

/// Storage category; retention windows are chosen per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Detection,
    SmartBehavior,
    SmartCounting,
    /// Events ingested from outside this worker. Longer retention.
    External,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Detection => "detection",
            EventCategory::SmartBehavior => "smart_behavior",
            EventCategory::SmartCounting => "smart_counting",
            EventCategory::External => "external",
        }
    }
}

impl From<EventSource> for EventCategory {
    fn from(source: EventSource) -> Self {
        match source {
            EventSource::Detection => EventCategory::Detection,
            EventSource::Behavior => EventCategory::SmartBehavior,
            EventSource::Occupancy | EventSource::Flow => EventCategory::SmartCounting,
        }
    }
}

/// Snapshot of the zone counters at the time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Counts {
    pub current: u32,
    pub today_in: u64,
    pub today_out: u64,
}

/// A semantic fact produced from one processing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SemanticEvent {
    pub task_id: TaskId,
    pub kind: EventKind,
    pub source: EventSource,
    /// `None` for occupancy and plain detection events.
    pub track_id: Option<u64>,
    pub class_id: Option<u32>,
    pub position: Option<Point>,
    /// Signed delta for occupancy changes.
    pub change_amount: Option<i64>,
    pub counts: Counts,
    pub timestamp: DateTime<Utc>,
}

impl SemanticEvent {
    pub fn category(&self) -> EventCategory {
        self.source.into()
    }
}

/// A materialized event as handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventRecord {
    pub id: Uuid,
    pub camera_id: String,
    pub category: EventCategory,
    pub description: String,
    pub event: SemanticEvent,
    /// Detections visible in the frame that produced the event.
    pub detections: Vec<Detection>,
    /// A clip around the event was requested from the store.
    pub clip_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        camera_id: impl Into<String>,
        event: SemanticEvent,
        detections: Vec<Detection>,
        clip_requested: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: camera_id.into(),
            category: event.category(),
            description: event.kind.description().to_string(),
            created_at: event.timestamp,
            event,
            detections,
            clip_requested,
        }
    }
}

/// Normalized payload forwarded to push sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub camera_info: String,
    pub device_id: String,
    pub entered_count: u64,
    pub exited_count: u64,
    pub staying_count: u32,
    pub passed_count: u64,
    pub record_time: DateTime<Utc>,
    pub event_description: String,
    pub target_classes: Vec<u32>,
}

impl PushPayload {
    pub fn from_event(
        event: &SemanticEvent,
        camera_id: &str,
        target_classes: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            camera_info: event.task_id.to_string(),
            device_id: camera_id.to_string(),
            entered_count: event.counts.today_in,
            exited_count: event.counts.today_out,
            staying_count: event.counts.current,
            passed_count: event.counts.today_in + event.counts.today_out,
            record_time: event.timestamp,
            event_description: event.kind.description().to_string(),
            target_classes: target_classes.into_iter().collect(),
        }
    }

    /// Tags attached to a push: the configured tag and the device tag.
    pub fn tags(push_tag: &str, camera_id: &str) -> Vec<String> {
        vec![push_tag.to_string(), format!("device_{}", camera_id)]
    }
}

/// Payload for an occupancy alert (threshold reached).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub analysis_type: String,
    pub counting_type: String,
    pub task_id: TaskId,
    pub camera_id: String,
    pub threshold: u32,
    pub current_count: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-cycle timing sample, persisted alongside materialized events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceSample {
    pub task_id: TaskId,
    pub event_id: Option<Uuid>,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub objects_detected: usize,
    pub recorded_at: DateTime<Utc>,
}
