//! Frame handling, object tracking and zone analytics.
//!
//! This crate provides:
//! - The depth-1 frame slot shared by capture and processing
//! - Stream source and detector capability traits
//! - An FFmpeg-backed stream source
//! - The IoU tracker with zone, line, occupancy and flow analytics
//! - Overlay rendering and JPEG encoding

pub mod detector;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod geometry;
pub mod render;
pub mod source;
pub mod tracker;

pub use detector::{Detector, DetectorFactory, Inference, InferenceParams, InferenceTimings};
pub use error::{VisionError, VisionResult};
pub use ffmpeg::FfmpegSource;
pub use frame::{Frame, FrameSlot, SlotStats};
pub use render::{annotate, encode_base64_jpeg, encode_jpeg, Overlay};
pub use source::{StreamDescriptor, StreamHandle, StreamRead, StreamSource};
pub use tracker::{IoUTracker, MissPolicy, Track, TrackerConfig};
