//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use camwatch_vision::render::PREVIEW_JPEG_QUALITY;
use camwatch_vision::{MissPolicy, TrackerConfig};

use crate::processing::CadencePolicy;
use crate::retry::ReconnectPolicy;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent inference calls across all tasks
    pub inference_workers: usize,
    /// Upper bound for a single inference call
    pub inference_timeout: Duration,
    /// Upper bound for opening a camera stream
    pub connect_timeout: Duration,
    /// Upper bound for a single frame read
    pub read_timeout: Duration,
    /// Pause between consecutive failed reads
    pub read_retry_pause: Duration,
    /// How long stop() waits for task threads
    pub join_timeout: Duration,
    /// Reconnect attempts before a task is failed
    pub max_reconnect_attempts: u32,
    /// Reconnect delay step; attempt `n` waits `n * step`
    pub reconnect_step: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
    /// Consecutive read failures that count as a disconnect
    pub read_failure_threshold: u32,
    /// Maximum cached detector instances
    pub cache_max_instances: usize,
    /// Maximum cached detector memory
    pub cache_max_bytes: u64,
    /// Preview messages buffered per task before the oldest is dropped
    pub preview_queue_capacity: usize,
    /// JPEG quality for previews
    pub preview_jpeg_quality: u8,
    /// Tracker miss handling
    pub miss_policy: MissPolicy,
    pub trajectory_window: usize,
    pub interpolation_threshold: f64,
    pub min_hits: u32,
    /// Highest inference stride (infer every Nth frame)
    pub cadence_max_stride: u32,
    /// Stride floor while no one is watching
    pub cadence_idle_stride: u32,
    /// Inference latency the cadence policy aims for
    pub cadence_target_latency: Duration,
    /// How often old events are purged
    pub retention_interval: Duration,
    /// Retention for externally sourced events
    pub external_retention_days: u32,
    /// Root directory for events and snapshots
    pub storage_dir: PathBuf,
    /// Task configuration file
    pub tasks_file: PathBuf,
    /// Prometheus listener; disabled when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Remote inference endpoint
    pub detector_endpoint: String,
    /// Frame size when a task does not specify one
    pub default_frame_width: u32,
    pub default_frame_height: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inference_workers: 3,
            inference_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            read_retry_pause: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_step: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(10),
            read_failure_threshold: 30,
            cache_max_instances: 8,
            cache_max_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            preview_queue_capacity: 8,
            preview_jpeg_quality: PREVIEW_JPEG_QUALITY,
            miss_policy: MissPolicy::Immediate,
            trajectory_window: 30,
            interpolation_threshold: 50.0,
            min_hits: 3,
            cadence_max_stride: 10,
            cadence_idle_stride: 2,
            cadence_target_latency: Duration::from_millis(200),
            retention_interval: Duration::from_secs(3600),
            external_retention_days: 90,
            storage_dir: PathBuf::from("./storage"),
            tasks_file: PathBuf::from("./tasks.json"),
            metrics_addr: None,
            detector_endpoint: "http://127.0.0.1:8000".to_string(),
            default_frame_width: 1280,
            default_frame_height: 720,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            inference_workers: env_parse("CAMWATCH_INFERENCE_WORKERS")
                .unwrap_or(d.inference_workers)
                .max(1),
            inference_timeout: env_parse("CAMWATCH_INFERENCE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.inference_timeout),
            connect_timeout: env_parse("CAMWATCH_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.connect_timeout),
            read_timeout: env_parse("CAMWATCH_READ_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.read_timeout),
            read_retry_pause: env_parse("CAMWATCH_READ_RETRY_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.read_retry_pause),
            join_timeout: env_parse("CAMWATCH_JOIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.join_timeout),
            max_reconnect_attempts: env_parse("CAMWATCH_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(d.max_reconnect_attempts),
            reconnect_step: env_parse("CAMWATCH_RECONNECT_STEP_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reconnect_step),
            reconnect_max_delay: env_parse("CAMWATCH_RECONNECT_MAX_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reconnect_max_delay),
            read_failure_threshold: env_parse("CAMWATCH_READ_FAILURE_THRESHOLD")
                .unwrap_or(d.read_failure_threshold),
            cache_max_instances: env_parse("CAMWATCH_CACHE_MAX_INSTANCES")
                .unwrap_or(d.cache_max_instances),
            cache_max_bytes: env_parse("CAMWATCH_CACHE_MAX_BYTES").unwrap_or(d.cache_max_bytes),
            preview_queue_capacity: env_parse("CAMWATCH_PREVIEW_QUEUE_CAPACITY")
                .unwrap_or(d.preview_queue_capacity)
                .max(1),
            preview_jpeg_quality: env_parse("CAMWATCH_PREVIEW_JPEG_QUALITY")
                .unwrap_or(d.preview_jpeg_quality),
            miss_policy: std::env::var("CAMWATCH_TRACK_MISS_POLICY")
                .ok()
                .and_then(|s| MissPolicy::parse(&s))
                .unwrap_or(d.miss_policy),
            trajectory_window: env_parse("CAMWATCH_TRAJECTORY_WINDOW")
                .unwrap_or(d.trajectory_window),
            interpolation_threshold: env_parse("CAMWATCH_INTERPOLATION_THRESHOLD_PX")
                .unwrap_or(d.interpolation_threshold),
            min_hits: env_parse("CAMWATCH_TRACK_MIN_HITS").unwrap_or(d.min_hits),
            cadence_max_stride: env_parse("CAMWATCH_CADENCE_MAX_STRIDE")
                .unwrap_or(d.cadence_max_stride),
            cadence_idle_stride: env_parse("CAMWATCH_CADENCE_IDLE_STRIDE")
                .unwrap_or(d.cadence_idle_stride),
            cadence_target_latency: env_parse("CAMWATCH_CADENCE_TARGET_LATENCY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.cadence_target_latency),
            retention_interval: env_parse("CAMWATCH_RETENTION_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.retention_interval),
            external_retention_days: env_parse("CAMWATCH_EXTERNAL_RETENTION_DAYS")
                .unwrap_or(d.external_retention_days),
            storage_dir: std::env::var("CAMWATCH_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.storage_dir),
            tasks_file: std::env::var("CAMWATCH_TASKS_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.tasks_file),
            metrics_addr: env_parse("CAMWATCH_METRICS_ADDR"),
            detector_endpoint: std::env::var("CAMWATCH_DETECTOR_ENDPOINT")
                .unwrap_or(d.detector_endpoint),
            default_frame_width: env_parse("CAMWATCH_FRAME_WIDTH")
                .unwrap_or(d.default_frame_width),
            default_frame_height: env_parse("CAMWATCH_FRAME_HEIGHT")
                .unwrap_or(d.default_frame_height),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            step: self.reconnect_step,
            max_delay: self.reconnect_max_delay,
        }
    }

    /// Tracker settings for a task with the given association threshold.
    pub fn tracker_config(&self, iou_threshold: f64) -> TrackerConfig {
        TrackerConfig {
            iou_threshold,
            miss_policy: self.miss_policy,
            min_hits: self.min_hits,
            trajectory_window: self.trajectory_window.max(1),
            interpolation_threshold: self.interpolation_threshold,
            ..TrackerConfig::default()
        }
    }

    pub fn cadence_policy(&self) -> CadencePolicy {
        CadencePolicy::new(
            self.cadence_max_stride,
            self.cadence_idle_stride,
            self.cadence_target_latency,
        )
    }
}
