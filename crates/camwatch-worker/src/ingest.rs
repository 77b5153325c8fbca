//! Frame ingestion loop.
//!
//! One dedicated OS thread per task owns the camera connection. It keeps the
//! depth-1 frame slot filled and walks the
//! `Connecting -> Connected -> (Connecting on error)` state machine, with
//! linear backoff between reconnect attempts. Running out of attempts is
//! fatal for the task only.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use camwatch_models::{TaskId, TaskState};
use camwatch_vision::ffmpeg::redact;
use camwatch_vision::{Frame, FrameSlot, StreamDescriptor, StreamHandle, StreamRead, StreamSource};

use crate::cancel::CancelToken;
use crate::logging::TaskLogger;
use crate::metrics;
use crate::retry::{FailureStreak, ReconnectPolicy};
use crate::runtime::RuntimeStatus;

/// Everything the capture thread needs; moved onto the thread.
pub struct IngestContext {
    pub task_id: TaskId,
    pub descriptor: StreamDescriptor,
    pub source: Arc<dyn StreamSource>,
    pub slot: Arc<FrameSlot>,
    pub status: Arc<RuntimeStatus>,
    pub cancel: CancelToken,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub read_retry_pause: Duration,
    pub read_failure_threshold: u32,
}

enum PumpOutcome {
    Cancelled,
    Disconnected(String),
}

/// Spawn the capture thread for a task.
pub fn spawn_ingest(ctx: IngestContext) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("capture-{}", ctx.task_id))
        .spawn(move || run_ingest(ctx))
}

/// Run the ingestion state machine until cancelled or out of reconnect attempts.
pub fn run_ingest(ctx: IngestContext) {
    let logger = TaskLogger::new(&ctx.task_id, "ingest");
    let _span = logger.create_span().entered();
    logger.log_start(&redact(&ctx.descriptor.url));

    let mut attempt: u32 = 0;
    let mut seq: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if attempt > 0 {
            match ctx.policy.delay_for_attempt(attempt) {
                Some(delay) => {
                    ctx.status.set_reconnect_attempts(attempt);
                    metrics::record_reconnect_attempt(ctx.task_id.as_str());
                    logger.log_progress(&format!(
                        "reconnect attempt {}/{} in {:?}",
                        attempt, ctx.policy.max_attempts, delay
                    ));
                    if ctx.cancel.sleep_blocking(delay) {
                        break;
                    }
                }
                None => {
                    let message = format!(
                        "stream unavailable after {} reconnect attempts",
                        ctx.policy.max_attempts
                    );
                    logger.log_error(&message);
                    metrics::record_task_failure(ctx.task_id.as_str());
                    ctx.status.set_error(message);
                    ctx.cancel.cancel();
                    return;
                }
            }
        }

        ctx.status.set_state(TaskState::Connecting);
        let mut handle = match ctx.source.open(&ctx.descriptor, ctx.connect_timeout) {
            Ok(handle) => handle,
            Err(e) => {
                logger.log_warning(&format!("connect failed: {}", e));
                ctx.status.note_error(e.to_string());
                attempt += 1;
                continue;
            }
        };

        ctx.status.set_state(TaskState::Connected);
        logger.log_progress("stream connected");
        attempt = 0;

        let outcome = pump(&ctx, handle.as_mut(), &mut seq);
        handle.close();

        match outcome {
            PumpOutcome::Cancelled => break,
            PumpOutcome::Disconnected(reason) => {
                logger.log_warning(&format!("stream disconnected: {}", reason));
                ctx.status.note_error(reason);
                ctx.status.set_state(TaskState::Connecting);
                attempt = 1;
            }
        }
    }

    logger.log_completion(&format!("capture stopped after {} frames", seq));
}

/// Read frames into the slot until cancellation or disconnect.
fn pump(ctx: &IngestContext, handle: &mut dyn StreamHandle, seq: &mut u64) -> PumpOutcome {
    let mut failures = FailureStreak::new(&ctx.task_id, "frame read", 3);
    let mut dropped_seen = ctx.slot.stats().dropped;

    loop {
        if ctx.cancel.is_cancelled() {
            return PumpOutcome::Cancelled;
        }

        match handle.read() {
            StreamRead::Frame(image) => {
                failures.reset();
                *seq += 1;
                ctx.slot.publish(Frame::new(*seq, image));
                ctx.status.record_frame();
                metrics::record_frame_captured(ctx.task_id.as_str());

                let dropped = ctx.slot.stats().dropped;
                if dropped > dropped_seen {
                    metrics::record_frames_dropped(ctx.task_id.as_str(), dropped - dropped_seen);
                    dropped_seen = dropped;
                }
            }
            StreamRead::EndOfStream => {
                return PumpOutcome::Disconnected("end of stream".to_string());
            }
            StreamRead::Error(e) => {
                metrics::record_read_error(ctx.task_id.as_str());
                if failures.extend() {
                    tracing::warn!(task_id = %ctx.task_id, "Frame read failed: {}", e);
                }
                if failures.length() >= ctx.read_failure_threshold {
                    return PumpOutcome::Disconnected(format!(
                        "{} consecutive read failures, last: {}",
                        failures.length(),
                        e
                    ));
                }
                if ctx.cancel.sleep_blocking(ctx.read_retry_pause) {
                    return PumpOutcome::Cancelled;
                }
            }
        }
    }
}
