//! Shared data models for the camwatch detection backend.
//!
//! This crate provides Serde-serializable types for:
//! - Task configuration (validated once, before any thread is spawned)
//! - Zone analytics and schedule configuration
//! - Detections, bounding boxes and points
//! - Semantic events, persisted records and push payloads
//! - Live preview messages and task status

pub mod error;
pub mod event;
pub mod geometry;
pub mod preview;
pub mod schedule;
pub mod status;
pub mod task;
pub mod zone;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use event::{
    AlertPayload, Counts, EventCategory, EventKind, EventRecord, EventSource, PerformanceSample,
    PushPayload, SemanticEvent,
};
pub use geometry::{BoundingBox, Detection, Point};
pub use preview::{PreviewMessage, TrackView};
pub use schedule::ScheduleSpec;
pub use status::{TaskState, TaskStatus};
pub use task::{FrequencyMode, SaveMode, TaskConfig, TaskConfigSpec, TaskId};
pub use zone::{
    BehaviorMode, Direction, FlowFilter, ZoneAnalysis, ZoneConfig, ZoneConfigSpec, ZoneGeometry,
};
