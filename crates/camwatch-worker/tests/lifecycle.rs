//! Task manager lifecycle tests driven by in-process fakes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camwatch_models::{BoundingBox, Detection, TaskConfig, TaskConfigSpec, TaskId, TaskState};
use camwatch_vision::{
    Detector, DetectorFactory, Frame, Inference, InferenceParams, StreamDescriptor, StreamHandle,
    StreamRead, StreamSource, VisionError, VisionResult,
};
use camwatch_worker::{
    ChannelSubscriber, MemorySink, MemoryStore, StartOutcome, Subscriber, TaskManager,
    WorkerConfig, WorkerError, WorkerResult,
};
use image::RgbImage;

/// Camera that yields a small frame every few milliseconds, or refuses
/// connections while `offline` is set.
#[derive(Default)]
struct FakeCamera {
    offline: AtomicBool,
    opens: AtomicU32,
    closes: Arc<AtomicU32>,
}

struct FakeHandle {
    closes: Arc<AtomicU32>,
    closed: bool,
}

impl StreamHandle for FakeHandle {
    fn read(&mut self) -> StreamRead {
        std::thread::sleep(Duration::from_millis(5));
        StreamRead::Frame(RgbImage::new(64, 48))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl StreamSource for FakeCamera {
    fn open(
        &self,
        _descriptor: &StreamDescriptor,
        _timeout: Duration,
    ) -> VisionResult<Box<dyn StreamHandle>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(VisionError::stream_open("connection refused"));
        }
        Ok(Box::new(FakeHandle {
            closes: self.closes.clone(),
            closed: false,
        }))
    }
}

/// Always sees one person.
struct PersonDetector;

#[async_trait]
impl Detector for PersonDetector {
    async fn infer(&self, _frame: &Frame, _params: InferenceParams) -> VisionResult<Inference> {
        Ok(Inference {
            detections: vec![Detection::new(BoundingBox::new(8.0, 8.0, 12.0, 24.0), 0.9, 0)],
            ..Inference::default()
        })
    }

    fn model_id(&self) -> &str {
        "person"
    }
}

#[derive(Default)]
struct FakeFactory {
    loads: AtomicU32,
}

#[async_trait]
impl DetectorFactory for FakeFactory {
    async fn load(&self, model_path: &str, _confidence: f32) -> VisionResult<Arc<dyn Detector>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if model_path == "missing" {
            return Err(VisionError::detector_load("model file not found"));
        }
        Ok(Arc::new(PersonDetector))
    }
}

/// Subscriber whose connection is already gone.
struct ClosedSubscriber;

#[async_trait]
impl Subscriber for ClosedSubscriber {
    fn id(&self) -> &str {
        "closed"
    }

    async fn send(&self, _message: &str) -> WorkerResult<()> {
        Err(WorkerError::subscriber_gone("socket closed"))
    }
}

struct Harness {
    manager: Arc<TaskManager>,
    camera: Arc<FakeCamera>,
    factory: Arc<FakeFactory>,
    store: Arc<MemoryStore>,
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        max_reconnect_attempts: 2,
        reconnect_step: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(10),
        join_timeout: Duration::from_secs(2),
        read_retry_pause: Duration::from_millis(1),
        cadence_max_stride: 1,
        cadence_idle_stride: 1,
        ..WorkerConfig::default()
    }
}

fn harness() -> Harness {
    let camera = Arc::new(FakeCamera::default());
    let factory = Arc::new(FakeFactory::default());
    let store = Arc::new(MemoryStore::new());
    let manager = TaskManager::new(
        test_config(),
        store.clone(),
        Arc::new(MemorySink::new()),
        camera.clone(),
        factory.clone(),
    )
    .unwrap();
    Harness {
        manager,
        camera,
        factory,
        store,
    }
}

fn task(id: &str, model: &str) -> TaskConfig {
    TaskConfig::from_json(serde_json::json!({
        "task_id": id,
        "camera_id": "lobby",
        "stream_url": "rtsp://cam/lobby",
        "model_path": model,
        "enabled": true
    }))
    .unwrap()
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_is_idempotent_and_stop_is_safe() {
    let h = harness();
    let id = TaskId::from("lobby-1");

    assert_eq!(
        h.manager.start(task("lobby-1", "person")).await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        h.manager.start(task("lobby-1", "person")).await.unwrap(),
        StartOutcome::AlreadyRunning
    );
    assert_eq!(h.factory.loads.load(Ordering::SeqCst), 1);

    assert!(wait_for(|| h.manager.status(&id).connected).await);
    assert_eq!(h.manager.list_status().len(), 1);

    h.manager.stop(&id).await.unwrap();
    h.manager.stop(&id).await.unwrap();
    h.manager.stop(&TaskId::from("never-started")).await.unwrap();

    let status = h.manager.status(&id);
    assert_eq!(status.state, TaskState::Stopped);
    assert!(!status.running);
    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.camera.closes.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.store.enabled_writes(),
        vec![(id.clone(), true), (id, false)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_camera_ends_in_error_state() {
    let h = harness();
    h.camera.offline.store(true, Ordering::SeqCst);
    let id = TaskId::from("lobby-1");

    h.manager.start(task("lobby-1", "person")).await.unwrap();

    assert!(wait_for(|| h.manager.status(&id).state == TaskState::Error).await);
    let status = h.manager.status(&id);
    assert!(!status.running);
    assert!(!status.connected);
    assert!(status.last_error.is_some());
    // Initial attempt plus two reconnects.
    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 3);

    // A failed task can be started again once the camera is back.
    h.camera.offline.store(false, Ordering::SeqCst);
    assert_eq!(
        h.manager.start(task("lobby-1", "person")).await.unwrap(),
        StartOutcome::Started
    );
    assert!(wait_for(|| h.manager.status(&id).connected).await);
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detector_load_failure_aborts_start() {
    let h = harness();
    let id = TaskId::from("lobby-1");

    let err = h.manager.start(task("lobby-1", "missing")).await.unwrap_err();
    assert!(matches!(err, WorkerError::DetectorLoad(_)));

    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.status(&id).state, TaskState::Stopped);
    assert!(h.store.enabled_writes().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preview_is_only_encoded_with_subscribers() {
    let h = harness();
    let id = TaskId::from("lobby-1");
    h.manager.start(task("lobby-1", "person")).await.unwrap();

    assert!(wait_for(|| h.manager.status(&id).frames_captured > 5).await);
    assert_eq!(h.manager.preview_stats(&id).unwrap().encodes, 0);
    // Detections still produce events with nobody watching.
    assert!(wait_for(|| !h.store.events().is_empty()).await);

    let (viewer, mut previews) = ChannelSubscriber::channel("viewer", 4);
    assert_eq!(h.manager.attach_subscriber(&id, Arc::new(viewer)).unwrap(), 1);

    let message = tokio::time::timeout(Duration::from_secs(2), previews.recv())
        .await
        .unwrap()
        .unwrap();
    let preview: serde_json::Value = serde_json::from_str(&message).unwrap();
    assert_eq!(preview["task_id"], "lobby-1");
    assert!(h.manager.preview_stats(&id).unwrap().encodes > 0);

    assert!(h.manager.detach_subscriber(&id, "viewer"));
    assert_eq!(h.manager.status(&id).subscribers, 0);
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_subscriber_is_removed() {
    let h = harness();
    let id = TaskId::from("lobby-1");
    h.manager.start(task("lobby-1", "person")).await.unwrap();

    let (viewer, mut previews) = ChannelSubscriber::channel("viewer", 16);
    h.manager.attach_subscriber(&id, Arc::new(viewer)).unwrap();
    h.manager
        .attach_subscriber(&id, Arc::new(ClosedSubscriber))
        .unwrap();

    assert!(wait_for(|| h.manager.status(&id).subscribers == 1).await);
    assert!(h.manager.preview_stats(&id).unwrap().removed >= 1);

    // The healthy subscriber keeps receiving.
    tokio::time::timeout(Duration::from_secs(2), previews.recv())
        .await
        .unwrap()
        .unwrap();
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_to_unknown_task_fails() {
    let h = harness();
    let (viewer, _rx) = ChannelSubscriber::channel("viewer", 1);
    let err = h
        .manager
        .attach_subscriber(&TaskId::from("nope"), Arc::new(viewer))
        .unwrap_err();
    assert!(matches!(err, WorkerError::TaskNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduled_task_is_registered_not_started() {
    let h = harness();
    let id = TaskId::from("night-watch");
    let config = TaskConfig::from_json(serde_json::json!({
        "task_id": "night-watch",
        "camera_id": "yard",
        "stream_url": "rtsp://cam/yard",
        "model_path": "person",
        "frequency_mode": "scheduled",
        "schedule": {"kind": "window", "start": "22:00:00", "end": "23:00:00", "every_minutes": 30}
    }))
    .unwrap();

    assert_eq!(
        h.manager.start(config).await.unwrap(),
        StartOutcome::Scheduled
    );
    assert_eq!(h.manager.status(&id).state, TaskState::Scheduled);
    assert!(!h.manager.is_running(&id));
    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 0);

    h.manager.stop(&id).await.unwrap();
    assert_eq!(h.manager.status(&id).state, TaskState::Stopped);
    assert!(h.manager.list_status().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_all_enabled_skips_disabled_and_invalid() {
    let camera = Arc::new(FakeCamera::default());
    let spec = |id: &str, enabled: bool, confidence: f64| -> TaskConfigSpec {
        serde_json::from_value(serde_json::json!({
            "task_id": id,
            "camera_id": id,
            "stream_url": format!("rtsp://cam/{}", id),
            "model_path": "person",
            "confidence": confidence,
            "enabled": enabled
        }))
        .unwrap()
    };
    let store = Arc::new(MemoryStore::with_configs(vec![
        spec("a", true, 0.5),
        spec("b", false, 0.5),
        spec("c", true, 7.0),
    ]));
    let manager = TaskManager::new(
        test_config(),
        store,
        Arc::new(MemorySink::new()),
        camera,
        Arc::new(FakeFactory::default()),
    )
    .unwrap();

    assert_eq!(manager.start_all_enabled().await.unwrap(), 1);
    assert!(manager.is_running(&TaskId::from("a")));
    assert!(!manager.is_running(&TaskId::from("b")));
    assert!(!manager.is_running(&TaskId::from("c")));
    manager.shutdown().await;
}
