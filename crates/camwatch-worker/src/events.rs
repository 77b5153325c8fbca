//! Event pipeline: cooldown gating, materialization, persistence and push.

use std::sync::Arc;
use std::time::Duration;

use camwatch_models::{
    AlertPayload, Counts, Detection, EventKind, EventRecord, EventSource, PerformanceSample,
    PushPayload, SaveMode, SemanticEvent, TaskConfig, TrackView, ZoneAnalysis, ZoneGeometry,
};
use camwatch_vision::render::SNAPSHOT_JPEG_QUALITY;
use camwatch_vision::{annotate, encode_jpeg, Frame, InferenceTimings, Overlay};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::WorkerResult;
use crate::logging::TaskLogger;
use crate::metrics;
use crate::sink::PushSink;
use crate::store::EventStore;

/// Passes at most one event per cooldown window.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: chrono::Duration,
    last: Option<DateTime<Utc>>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            last: None,
        }
    }

    /// Pass if strictly more than the cooldown has elapsed since the last pass.
    pub fn try_pass(&mut self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) if now - last <= self.cooldown => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// One processing cycle's output, as handed to the pipeline.
pub struct CycleInput<'a> {
    pub frame: &'a Frame,
    pub detections: &'a [Detection],
    pub events: Vec<SemanticEvent>,
    pub timings: InferenceTimings,
    pub tracks: &'a [TrackView],
    /// Zone geometry in pixels, for snapshot overlays.
    pub zone: Option<&'a ZoneGeometry>,
    pub counts: Counts,
    pub now: DateTime<Utc>,
}

/// What the pipeline did with one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    pub materialized: Vec<Uuid>,
    pub suppressed: usize,
    pub alerts: usize,
    pub persist_failures: usize,
    pub push_failures: usize,
}

/// Per-task event pipeline. Owned by the task's processing cycle.
pub struct EventPipeline {
    config: Arc<TaskConfig>,
    store: Arc<dyn EventStore>,
    sink: Arc<dyn PushSink>,
    detection_gate: CooldownGate,
    zone_gate: CooldownGate,
    logger: TaskLogger,
}

impl EventPipeline {
    pub fn new(config: Arc<TaskConfig>, store: Arc<dyn EventStore>, sink: Arc<dyn PushSink>) -> Self {
        let logger = TaskLogger::new(&config.task_id, "events");
        Self {
            detection_gate: CooldownGate::new(config.event_cooldown()),
            zone_gate: CooldownGate::new(config.zone_cooldown()),
            config,
            store,
            sink,
            logger,
        }
    }

    pub async fn process(&mut self, mut input: CycleInput<'_>) -> CycleOutcome {
        let task = self.config.task_id.as_str().to_string();
        metrics::record_inference(&task, &input.timings, input.detections.len());

        let mut outcome = CycleOutcome::default();
        let mut snapshot: Option<Option<Vec<u8>>> = None;

        if self.config.zone.is_none() {
            if let Some(event) = self.detection_event(&input) {
                if self.detection_gate.try_pass(input.now) {
                    let persist = self.config.save_mode != SaveMode::None;
                    self.materialize(event, persist, &input, &mut snapshot, &mut outcome)
                        .await;
                } else {
                    metrics::record_event_suppressed(&task, EventKind::Detection.as_str());
                    outcome.suppressed += 1;
                }
            }
        }

        let zone_gated = self
            .config
            .zone
            .as_ref()
            .map(|z| z.cooldown_seconds.is_some())
            .unwrap_or(false);

        let events = std::mem::take(&mut input.events);
        for event in events {
            let passes = match event.source {
                EventSource::Occupancy => {
                    if self.check_alert(&event).await {
                        outcome.alerts += 1;
                    }
                    self.zone_gate.try_pass(input.now)
                }
                EventSource::Behavior | EventSource::Flow if zone_gated => {
                    self.zone_gate.try_pass(input.now)
                }
                _ => true,
            };

            if passes {
                self.materialize(event, true, &input, &mut snapshot, &mut outcome)
                    .await;
            } else {
                metrics::record_event_suppressed(&task, event.kind.as_str());
                outcome.suppressed += 1;
            }
        }

        outcome
    }

    /// Plain detection event for a task without zone analytics.
    fn detection_event(&self, input: &CycleInput<'_>) -> Option<SemanticEvent> {
        let first = input.detections.first()?;
        Some(SemanticEvent {
            task_id: self.config.task_id.clone(),
            kind: EventKind::Detection,
            source: EventSource::Detection,
            track_id: None,
            class_id: Some(first.class_id),
            position: Some(first.bbox.center()),
            change_amount: None,
            counts: input.counts,
            timestamp: input.now,
        })
    }

    /// Push an occupancy alert when the zone's threshold is reached.
    async fn check_alert(&self, event: &SemanticEvent) -> bool {
        let Some(zone) = self.config.zone.as_ref() else {
            return false;
        };
        let Some(threshold) = zone.alert_threshold else {
            return false;
        };
        if !matches!(zone.analysis, ZoneAnalysis::Occupancy) || event.counts.current < threshold {
            return false;
        }

        let alert = AlertPayload {
            analysis_type: "counting".to_string(),
            counting_type: zone.analysis.as_str().to_string(),
            task_id: self.config.task_id.clone(),
            camera_id: self.config.camera_id.clone(),
            threshold,
            current_count: event.counts.current,
            message: format!(
                "Occupancy {} reached alert threshold {}",
                event.counts.current, threshold
            ),
            timestamp: event.timestamp,
        };
        let tags = match self.config.push_tag() {
            Some(tag) => PushPayload::tags(tag, &self.config.camera_id),
            None => vec![format!("device_{}", self.config.camera_id)],
        };

        metrics::record_alert(self.config.task_id.as_str());
        match serde_json::to_value(&alert) {
            Ok(value) => {
                if let Err(e) = self.sink.push(&value, &tags, None).await {
                    metrics::record_push_failure(self.config.task_id.as_str());
                    self.logger.log_warning(&format!("alert push failed: {}", e));
                }
            }
            Err(e) => self.logger.log_error(&format!("alert payload: {}", e)),
        }
        true
    }

    /// Persist and push one event. Both sides are best-effort and independent.
    async fn materialize(
        &self,
        event: SemanticEvent,
        persist: bool,
        input: &CycleInput<'_>,
        snapshot: &mut Option<Option<Vec<u8>>>,
        outcome: &mut CycleOutcome,
    ) {
        let push_tag = self.config.push_tag();
        if !persist && push_tag.is_none() {
            return;
        }

        let image = if self.config.save_mode.wants_snapshot() {
            if snapshot.is_none() {
                *snapshot = Some(self.render_snapshot(input).await);
            }
            match &*snapshot {
                Some(Some(bytes)) => Some(bytes.as_slice()),
                _ => None,
            }
        } else {
            None
        };

        let kind = event.kind;
        let payload = PushPayload::from_event(
            &event,
            &self.config.camera_id,
            self.config.target_classes.iter().copied(),
        );
        let record = EventRecord::new(
            self.config.camera_id.clone(),
            event,
            input.detections.to_vec(),
            self.config.save_mode.wants_clip(),
        );
        let sample = PerformanceSample {
            task_id: self.config.task_id.clone(),
            event_id: Some(record.id),
            preprocess_ms: input.timings.preprocess_ms,
            inference_ms: input.timings.inference_ms,
            postprocess_ms: input.timings.postprocess_ms,
            frame_width: input.frame.width(),
            frame_height: input.frame.height(),
            objects_detected: input.detections.len(),
            recorded_at: input.now,
        };

        let persist_fut = async {
            if !persist {
                return Ok(());
            }
            self.store.save_event(&record, image).await?;
            self.store.record_performance(&sample).await
        };
        let push_fut = async {
            let Some(tag) = push_tag else {
                return Ok(());
            };
            let value = serde_json::to_value(&payload)?;
            let tags = PushPayload::tags(tag, &self.config.camera_id);
            self.sink.push(&value, &tags, image).await
        };

        let (persisted, pushed): (WorkerResult<()>, WorkerResult<()>) =
            tokio::join!(persist_fut, push_fut);

        let task = self.config.task_id.as_str();
        if let Err(e) = persisted {
            outcome.persist_failures += 1;
            metrics::record_persist_failure(task);
            self.logger
                .log_warning(&format!("failed to persist {} event: {}", kind.as_str(), e));
        }
        if let Err(e) = pushed {
            outcome.push_failures += 1;
            metrics::record_push_failure(task);
            self.logger
                .log_warning(&format!("failed to push {} event: {}", kind.as_str(), e));
        }

        metrics::record_event_emitted(task, kind.as_str());
        outcome.materialized.push(record.id);
    }

    /// Draw and encode the snapshot on the blocking pool.
    async fn render_snapshot(&self, input: &CycleInput<'_>) -> Option<Vec<u8>> {
        let image = input.frame.image.clone();
        let detections = input.detections.to_vec();
        let tracks = input.tracks.to_vec();
        let zone = input.zone.cloned();

        let encoded = tokio::task::spawn_blocking(move || {
            let annotated = annotate(
                &image,
                &Overlay {
                    detections: &detections,
                    tracks: &tracks,
                    zone: zone.as_ref(),
                },
            );
            encode_jpeg(&annotated, SNAPSHOT_JPEG_QUALITY)
        })
        .await;

        match encoded {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                self.logger.log_warning(&format!("snapshot encode failed: {}", e));
                None
            }
            Err(e) => {
                self.logger.log_warning(&format!("snapshot task join error: {}", e));
                None
            }
        }
    }
}
