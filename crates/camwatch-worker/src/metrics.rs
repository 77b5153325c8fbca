//! Prometheus metrics for the detection worker.

use std::net::SocketAddr;

use camwatch_vision::InferenceTimings;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder with an HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    // Ingestion
    pub const FRAMES_CAPTURED_TOTAL: &str = "camwatch_frames_captured_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "camwatch_frames_dropped_total";
    pub const STREAM_READ_ERRORS_TOTAL: &str = "camwatch_stream_read_errors_total";
    pub const RECONNECT_ATTEMPTS_TOTAL: &str = "camwatch_reconnect_attempts_total";
    pub const TASK_FAILURES_TOTAL: &str = "camwatch_task_failures_total";

    // Inference
    pub const INFERENCE_SECONDS: &str = "camwatch_inference_seconds";
    pub const PREPROCESS_SECONDS: &str = "camwatch_preprocess_seconds";
    pub const POSTPROCESS_SECONDS: &str = "camwatch_postprocess_seconds";
    pub const INFERENCE_ERRORS_TOTAL: &str = "camwatch_inference_errors_total";
    pub const OBJECTS_DETECTED: &str = "camwatch_objects_detected";

    // Events
    pub const EVENTS_EMITTED_TOTAL: &str = "camwatch_events_emitted_total";
    pub const EVENTS_SUPPRESSED_TOTAL: &str = "camwatch_events_suppressed_total";
    pub const EVENT_PERSIST_FAILURES_TOTAL: &str = "camwatch_event_persist_failures_total";
    pub const PUSH_FAILURES_TOTAL: &str = "camwatch_push_failures_total";
    pub const ALERTS_TOTAL: &str = "camwatch_alerts_total";

    // Fanout
    pub const PREVIEW_MESSAGES_SENT: &str = "camwatch_preview_messages_sent_total";
    pub const PREVIEW_MESSAGES_DROPPED: &str = "camwatch_preview_messages_dropped_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "camwatch_subscribers_active";

    // Lifecycle and cache
    pub const TASKS_ACTIVE: &str = "camwatch_tasks_active";
    pub const DETECTOR_CACHE_HITS: &str = "camwatch_detector_cache_hits_total";
    pub const DETECTOR_CACHE_MISSES: &str = "camwatch_detector_cache_misses_total";
    pub const DETECTOR_CACHE_EVICTIONS: &str = "camwatch_detector_cache_evictions_total";
    pub const EVENTS_PURGED_TOTAL: &str = "camwatch_events_purged_total";
}

pub fn record_frame_captured(task_id: &str) {
    counter!(names::FRAMES_CAPTURED_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_frames_dropped(task_id: &str, count: u64) {
    counter!(names::FRAMES_DROPPED_TOTAL, "task" => task_id.to_string()).increment(count);
}

pub fn record_read_error(task_id: &str) {
    counter!(names::STREAM_READ_ERRORS_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_reconnect_attempt(task_id: &str) {
    counter!(names::RECONNECT_ATTEMPTS_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_task_failure(task_id: &str) {
    counter!(names::TASK_FAILURES_TOTAL, "task" => task_id.to_string()).increment(1);
}

/// Record stage timings and object count for one inference call.
pub fn record_inference(task_id: &str, timings: &InferenceTimings, objects: usize) {
    let labels = [("task", task_id.to_string())];
    histogram!(names::PREPROCESS_SECONDS, &labels).record(timings.preprocess_ms / 1000.0);
    histogram!(names::INFERENCE_SECONDS, &labels).record(timings.inference_ms / 1000.0);
    histogram!(names::POSTPROCESS_SECONDS, &labels).record(timings.postprocess_ms / 1000.0);
    histogram!(names::OBJECTS_DETECTED, &labels).record(objects as f64);
}

pub fn record_inference_error(task_id: &str, reason: &str) {
    let labels = [
        ("task", task_id.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!(names::INFERENCE_ERRORS_TOTAL, &labels).increment(1);
}

pub fn record_event_emitted(task_id: &str, kind: &str) {
    let labels = [("task", task_id.to_string()), ("kind", kind.to_string())];
    counter!(names::EVENTS_EMITTED_TOTAL, &labels).increment(1);
}

pub fn record_event_suppressed(task_id: &str, kind: &str) {
    let labels = [("task", task_id.to_string()), ("kind", kind.to_string())];
    counter!(names::EVENTS_SUPPRESSED_TOTAL, &labels).increment(1);
}

pub fn record_persist_failure(task_id: &str) {
    counter!(names::EVENT_PERSIST_FAILURES_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_push_failure(task_id: &str) {
    counter!(names::PUSH_FAILURES_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_alert(task_id: &str) {
    counter!(names::ALERTS_TOTAL, "task" => task_id.to_string()).increment(1);
}

pub fn record_preview_sent(task_id: &str, subscribers: usize) {
    counter!(names::PREVIEW_MESSAGES_SENT, "task" => task_id.to_string())
        .increment(subscribers as u64);
}

pub fn record_preview_dropped(task_id: &str) {
    counter!(names::PREVIEW_MESSAGES_DROPPED, "task" => task_id.to_string()).increment(1);
}

pub fn set_subscribers(task_id: &str, count: usize) {
    gauge!(names::SUBSCRIBERS_ACTIVE, "task" => task_id.to_string()).set(count as f64);
}

pub fn set_active_tasks(count: usize) {
    gauge!(names::TASKS_ACTIVE).set(count as f64);
}

pub fn record_cache_hit(model: &str) {
    counter!(names::DETECTOR_CACHE_HITS, "model" => model.to_string()).increment(1);
}

pub fn record_cache_miss(model: &str) {
    counter!(names::DETECTOR_CACHE_MISSES, "model" => model.to_string()).increment(1);
}

pub fn record_cache_eviction(model: &str) {
    counter!(names::DETECTOR_CACHE_EVICTIONS, "model" => model.to_string()).increment(1);
}

pub fn record_events_purged(scope: &str, count: usize) {
    counter!(names::EVENTS_PURGED_TOTAL, "scope" => scope.to_string()).increment(count as u64);
}
