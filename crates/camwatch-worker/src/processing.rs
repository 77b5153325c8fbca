//! Processing cycle: latest frame -> inference -> tracker -> events + preview.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camwatch_models::{Detection, PreviewMessage, TaskConfig, TrackView, ZoneGeometry};
use camwatch_vision::{
    annotate, encode_base64_jpeg, Detector, Frame, FrameSlot, Inference, InferenceParams,
    IoUTracker, Overlay,
};
use chrono::Utc;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::error::WorkerResult;
use crate::events::{CycleInput, EventPipeline};
use crate::fanout::Fanout;
use crate::logging::TaskLogger;
use crate::metrics;
use crate::retry::FailureStreak;
use crate::runtime::RuntimeStatus;

/// Adaptive inference cadence: run inference on every `stride`-th frame.
///
/// The stride grows while inference is slower than the target latency and
/// shrinks once it is comfortably faster. With nobody watching the preview
/// it never drops below the idle floor.
#[derive(Debug, Clone)]
pub struct CadencePolicy {
    stride: u32,
    max_stride: u32,
    idle_stride: u32,
    target_latency: Duration,
    seen: u64,
}

impl CadencePolicy {
    pub fn new(max_stride: u32, idle_stride: u32, target_latency: Duration) -> Self {
        let max_stride = max_stride.max(1);
        Self {
            stride: 1,
            max_stride,
            idle_stride: idle_stride.clamp(1, max_stride),
            target_latency,
            seen: 0,
        }
    }

    /// Whether the next frame should go to the detector.
    pub fn admit(&mut self) -> bool {
        self.seen += 1;
        self.seen % u64::from(self.stride) == 0
    }

    /// Feed back the latency of the last inference call.
    pub fn observe(&mut self, latency: Duration, has_subscribers: bool) {
        if latency > self.target_latency {
            self.stride = (self.stride + 1).min(self.max_stride);
        } else if latency < self.target_latency / 2 && self.stride > 1 {
            self.stride -= 1;
        }
        if !has_subscribers {
            self.stride = self.stride.max(self.idle_stride);
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }
}

/// State owned by one task's processing cycle.
pub struct ProcessingContext {
    pub config: Arc<TaskConfig>,
    pub detector: Arc<dyn Detector>,
    pub slot: Arc<FrameSlot>,
    pub tracker: IoUTracker,
    pub pipeline: EventPipeline,
    pub fanout: Arc<Fanout>,
    pub status: Arc<RuntimeStatus>,
    pub cancel: CancelToken,
    /// Shared across tasks; bounds concurrent inference calls.
    pub inference_pool: Arc<Semaphore>,
    pub inference_timeout: Duration,
    pub cadence: CadencePolicy,
    pub preview_quality: u8,
}

/// Run the processing cycle until the task is cancelled.
pub async fn run_processing(mut ctx: ProcessingContext) {
    let logger = TaskLogger::new(&ctx.config.task_id, "processing");
    logger.log_start(&format!("model {}", ctx.detector.model_id()));

    let params = InferenceParams {
        confidence: ctx.config.confidence,
        iou_threshold: ctx.config.iou_threshold,
    };
    let mut failures = FailureStreak::new(&ctx.config.task_id, "inference", 3);
    let mut cycles: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = ctx.slot.next() => frame,
        };

        if !ctx.cadence.admit() {
            continue;
        }

        let permit = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            permit = ctx.inference_pool.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let started = Instant::now();
        let result =
            tokio::time::timeout(ctx.inference_timeout, ctx.detector.infer(&frame, params)).await;
        drop(permit);
        let latency = started.elapsed();

        let inference = match result {
            Ok(Ok(inference)) => {
                failures.reset();
                inference
            }
            Ok(Err(e)) => {
                metrics::record_inference_error(ctx.config.task_id.as_str(), "detector");
                if failures.extend() {
                    logger.log_warning(&format!("inference failed on frame {}: {}", frame.seq, e));
                }
                continue;
            }
            Err(_) => {
                metrics::record_inference_error(ctx.config.task_id.as_str(), "timeout");
                if failures.extend() {
                    logger.log_warning(&format!(
                        "inference timed out after {:?} on frame {}",
                        ctx.inference_timeout, frame.seq
                    ));
                }
                continue;
            }
        };

        ctx.cadence.observe(latency, ctx.fanout.has_subscribers());
        if ctx.cancel.is_cancelled() {
            break;
        }

        run_cycle(&mut ctx, frame, inference).await;
        cycles += 1;
    }

    logger.log_completion(&format!("{} cycles processed", cycles));
}

/// Track, emit and broadcast one inference result.
async fn run_cycle(ctx: &mut ProcessingContext, frame: Arc<Frame>, inference: Inference) {
    let now = Utc::now();
    let detections: Vec<Detection> = inference
        .detections
        .into_iter()
        .filter(|d| ctx.config.accepts_class(d.class_id))
        .collect();

    ctx.tracker
        .update(&detections, (frame.width(), frame.height()), now);
    let events = ctx.tracker.drain_events();
    let counts = ctx.tracker.counts();
    let tracks = ctx.tracker.confirmed_views();
    let zone = ctx.tracker.zone_pixels().cloned();
    ctx.status.update_counts(counts);

    ctx.pipeline
        .process(CycleInput {
            frame: &frame,
            detections: &detections,
            events,
            timings: inference.timings,
            tracks: &tracks,
            zone: zone.as_ref(),
            counts,
            now,
        })
        .await;

    let preview = PreviewInput {
        config: ctx.config.clone(),
        frame,
        detections,
        tracks,
        zone,
        quality: ctx.preview_quality,
    };
    ctx.fanout.offer(move || preview.build()).await;
}

/// Everything a preview needs, owned so it can be built off the runtime.
struct PreviewInput {
    config: Arc<TaskConfig>,
    frame: Arc<Frame>,
    detections: Vec<Detection>,
    tracks: Vec<TrackView>,
    zone: Option<ZoneGeometry>,
    quality: u8,
}

impl PreviewInput {
    /// Annotate, encode and serialize. CPU-bound.
    fn build(self) -> WorkerResult<String> {
        let annotated = annotate(
            &self.frame.image,
            &Overlay {
                detections: &self.detections,
                tracks: &self.tracks,
                zone: self.zone.as_ref(),
            },
        );
        let message = PreviewMessage {
            task_id: self.config.task_id.clone(),
            camera_id: self.config.camera_id.clone(),
            timestamp: self.frame.captured_at,
            image: encode_base64_jpeg(&annotated, self.quality)?,
            detections: self.detections,
            tracks: self.tracks,
        };
        Ok(serde_json::to_string(&message)?)
    }
}
