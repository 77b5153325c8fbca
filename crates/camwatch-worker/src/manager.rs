//! Task lifecycle manager.
//!
//! Owns the registry of running tasks (at most one per task id), the shared
//! detector cache, the inference pool and the scheduler. Every start/stop
//! runs under a single lifecycle lock; status reads never take it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use camwatch_models::{TaskConfig, TaskConfigSpec, TaskId, TaskState, TaskStatus};
use camwatch_vision::{DetectorFactory, FrameSlot, IoUTracker, StreamDescriptor, StreamSource};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cache::DetectorCache;
use crate::cancel::CancelToken;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::events::EventPipeline;
use crate::fanout::{Fanout, FanoutStats, Subscriber};
use crate::ingest::{spawn_ingest, IngestContext};
use crate::metrics;
use crate::processing::{run_processing, ProcessingContext};
use crate::runtime::RuntimeStatus;
use crate::scheduler::{Scheduler, TaskLauncher};
use crate::sink::PushSink;
use crate::store::EventStore;

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The task was already running; nothing changed.
    AlreadyRunning,
    /// Registered with the scheduler instead of started.
    Scheduled,
}

/// Runtime state of one started task.
pub struct RuntimeTask {
    config: Arc<TaskConfig>,
    cancel: CancelToken,
    status: Arc<RuntimeStatus>,
    slot: Arc<FrameSlot>,
    fanout: Arc<Fanout>,
    capture: Mutex<Option<std::thread::JoinHandle<()>>>,
    processing: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RuntimeTask {
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Still doing work: not cancelled and not in a terminal state.
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.status.state().is_terminal()
    }

    pub fn status(&self) -> TaskStatus {
        self.status.snapshot(self.fanout.subscriber_count())
    }
}

/// Registry and lifecycle owner for all camera tasks.
pub struct TaskManager {
    config: WorkerConfig,
    store: Arc<dyn EventStore>,
    sink: Arc<dyn PushSink>,
    source: Arc<dyn StreamSource>,
    cache: DetectorCache,
    inference_pool: Arc<Semaphore>,
    registry: RwLock<HashMap<TaskId, Arc<RuntimeTask>>>,
    lifecycle: tokio::sync::Mutex<()>,
    scheduler: Scheduler,
    runtime: Handle,
}

impl TaskManager {
    /// Create a manager. Must be called from within a tokio runtime.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn EventStore>,
        sink: Arc<dyn PushSink>,
        source: Arc<dyn StreamSource>,
        factory: Arc<dyn DetectorFactory>,
    ) -> WorkerResult<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| WorkerError::config_error(format!("no tokio runtime: {}", e)))?;

        Ok(Arc::new_cyclic(|weak: &Weak<TaskManager>| {
            let launcher: Weak<dyn TaskLauncher> = weak.clone();
            TaskManager {
                cache: DetectorCache::new(
                    factory,
                    config.cache_max_instances,
                    config.cache_max_bytes,
                ),
                inference_pool: Arc::new(Semaphore::new(config.inference_workers.max(1))),
                registry: RwLock::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                scheduler: Scheduler::new(launcher, runtime.clone()),
                runtime,
                config,
                store,
                sink,
                source,
            }
        }))
    }

    fn registry_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Arc<RuntimeTask>>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Arc<RuntimeTask>>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, task_id: &TaskId) -> Option<Arc<RuntimeTask>> {
        self.registry_read().get(task_id).cloned()
    }

    fn remove(&self, task_id: &TaskId) -> Option<Arc<RuntimeTask>> {
        let mut registry = self.registry_write();
        let removed = registry.remove(task_id);
        metrics::set_active_tasks(registry.len());
        removed
    }

    /// Start a validated task.
    ///
    /// Starting a running task is a no-op success. A task that previously
    /// failed is cleaned up and started afresh. Scheduled tasks are handed to
    /// the scheduler.
    pub async fn start(&self, config: TaskConfig) -> WorkerResult<StartOutcome> {
        let config = Arc::new(config);
        let task_id = config.task_id.clone();
        let _guard = self.lifecycle.lock().await;

        if let Some(existing) = self.get(&task_id) {
            if existing.is_live() {
                info!(task_id = %task_id, "Task already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            self.remove(&task_id);
            self.halt(existing).await;
        }

        let outcome = if config.is_scheduled() {
            self.scheduler.schedule(config)?;
            StartOutcome::Scheduled
        } else {
            self.launch_locked(config).await?;
            StartOutcome::Started
        };

        self.persist_enabled(&task_id, true).await;
        Ok(outcome)
    }

    /// Validate a raw config and start it.
    pub async fn start_spec(&self, spec: TaskConfigSpec) -> WorkerResult<StartOutcome> {
        let config = TaskConfig::try_from(spec)?;
        self.start(config).await
    }

    /// Load a config from the store and start it.
    pub async fn start_by_id(&self, task_id: &TaskId) -> WorkerResult<StartOutcome> {
        let spec = self.store.load_config(task_id).await?;
        self.start_spec(spec).await
    }

    /// Replace a task's configuration, restarting it if it was running.
    pub async fn replace(&self, config: TaskConfig) -> WorkerResult<StartOutcome> {
        self.stop(&config.task_id).await?;
        self.start(config).await
    }

    /// Stop a task and remove it from the registry and the scheduler.
    ///
    /// Stopping an unknown or already stopped task is a no-op success.
    pub async fn stop(&self, task_id: &TaskId) -> WorkerResult<()> {
        let _guard = self.lifecycle.lock().await;

        let unscheduled = self.scheduler.unschedule(task_id);
        let task = self.remove(task_id);
        let had_task = task.is_some();
        if let Some(task) = task {
            self.halt(task).await;
        }

        if unscheduled || had_task {
            self.persist_enabled(task_id, false).await;
            info!(task_id = %task_id, "Task stopped");
        }
        Ok(())
    }

    /// Current status, without waiting on any lifecycle operation.
    pub fn status(&self, task_id: &TaskId) -> TaskStatus {
        if let Some(task) = self.get(task_id) {
            return task.status();
        }
        let mut status = TaskStatus::stopped(task_id.clone());
        if self.scheduler.is_scheduled(task_id) {
            status.state = TaskState::Scheduled;
        }
        status
    }

    /// Status of every running or scheduled task, ordered by id.
    pub fn list_status(&self) -> Vec<TaskStatus> {
        let mut ids: BTreeSet<TaskId> = self.registry_read().keys().cloned().collect();
        ids.extend(self.scheduler.scheduled_ids());
        ids.iter().map(|id| self.status(id)).collect()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.get(task_id).map(|t| t.is_live()).unwrap_or(false)
    }

    /// Attach a live-preview subscriber to a running task.
    pub fn attach_subscriber(
        &self,
        task_id: &TaskId,
        subscriber: Arc<dyn Subscriber>,
    ) -> WorkerResult<usize> {
        let task = self
            .get(task_id)
            .ok_or_else(|| WorkerError::TaskNotFound(task_id.clone()))?;
        Ok(task.fanout.attach(subscriber))
    }

    pub fn detach_subscriber(&self, task_id: &TaskId, subscriber_id: &str) -> bool {
        self.get(task_id)
            .map(|t| t.fanout.detach(subscriber_id))
            .unwrap_or(false)
    }

    /// Preview fanout counters for a running task.
    pub fn preview_stats(&self, task_id: &TaskId) -> Option<FanoutStats> {
        self.get(task_id).map(|t| t.fanout.stats())
    }

    /// Start every config the store marks as enabled. Returns how many
    /// were started or scheduled.
    pub async fn start_all_enabled(&self) -> WorkerResult<usize> {
        let configs = self.store.list_configs().await?;
        let mut started = 0;
        for spec in configs.into_iter().filter(|c| c.enabled) {
            let task_id = spec.task_id.clone();
            match self.start_spec(spec).await {
                Ok(StartOutcome::AlreadyRunning) => {}
                Ok(_) => started += 1,
                Err(e) => warn!(task_id = %task_id, "Failed to start enabled task: {}", e),
            }
        }
        info!("Started {} enabled tasks", started);
        Ok(started)
    }

    /// Stop everything. Enabled flags are left as they are so the tasks come
    /// back on the next boot.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.scheduler.shutdown();

        let tasks: Vec<Arc<RuntimeTask>> = {
            let mut registry = self.registry_write();
            let tasks = registry.drain().map(|(_, t)| t).collect();
            metrics::set_active_tasks(0);
            tasks
        };
        for task in tasks {
            self.halt(task).await;
        }
        self.cache.clear().await;
        info!("Task manager shut down");
    }

    async fn persist_enabled(&self, task_id: &TaskId, enabled: bool) {
        if let Err(e) = self.store.set_enabled(task_id, enabled).await {
            warn!(task_id = %task_id, enabled, "Failed to persist enabled flag: {}", e);
        }
    }

    /// Resolve the detector and spawn the capture thread and processing cycle.
    /// Caller holds the lifecycle lock.
    async fn launch_locked(&self, config: Arc<TaskConfig>) -> WorkerResult<()> {
        let task_id = config.task_id.clone();
        let detector = self
            .cache
            .get_or_load(&config.model_path, config.confidence)
            .await?;

        let status = Arc::new(RuntimeStatus::new(task_id.clone()));
        let slot = Arc::new(FrameSlot::new());
        let cancel = CancelToken::new();
        let fanout = Arc::new(Fanout::new(
            task_id.clone(),
            self.config.preview_queue_capacity,
            self.runtime.clone(),
        ));

        let mut descriptor = StreamDescriptor::new(config.stream_url.clone());
        if let (Some(w), Some(h)) = (config.frame_width, config.frame_height) {
            descriptor = descriptor.with_size(w, h);
        }

        let capture = spawn_ingest(IngestContext {
            task_id: task_id.clone(),
            descriptor,
            source: self.source.clone(),
            slot: slot.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
            policy: self.config.reconnect_policy(),
            connect_timeout: self.config.connect_timeout,
            read_retry_pause: self.config.read_retry_pause,
            read_failure_threshold: self.config.read_failure_threshold,
        })?;

        let processing = self.runtime.spawn(run_processing(ProcessingContext {
            config: config.clone(),
            detector,
            slot: slot.clone(),
            tracker: IoUTracker::new(
                task_id.clone(),
                self.config.tracker_config(config.track_iou_threshold),
                config.zone.clone(),
            ),
            pipeline: EventPipeline::new(config.clone(), self.store.clone(), self.sink.clone()),
            fanout: fanout.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
            inference_pool: self.inference_pool.clone(),
            inference_timeout: self.config.inference_timeout,
            cadence: self.config.cadence_policy(),
            preview_quality: self.config.preview_jpeg_quality,
        }));

        let task = Arc::new(RuntimeTask {
            config,
            cancel,
            status,
            slot,
            fanout,
            capture: Mutex::new(Some(capture)),
            processing: Mutex::new(Some(processing)),
        });

        let mut registry = self.registry_write();
        registry.insert(task_id.clone(), task);
        metrics::set_active_tasks(registry.len());
        info!(task_id = %task_id, "Task started");
        Ok(())
    }

    /// Cancel a task and wait, bounded, for its threads.
    async fn halt(&self, task: Arc<RuntimeTask>) {
        let task_id = task.config.task_id.clone();
        task.cancel.cancel();
        task.fanout.shutdown();
        task.slot.clear();

        let join_timeout = self.config.join_timeout;

        let capture = task
            .capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = capture {
            let join = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(join_timeout, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(_))) => warn!(task_id = %task_id, "Capture thread panicked"),
                Ok(Err(e)) => warn!(task_id = %task_id, "Capture join failed: {}", e),
                Err(_) => warn!(
                    task_id = %task_id,
                    "Capture thread did not stop within {:?}; detaching it",
                    join_timeout
                ),
            }
        }

        let processing = task
            .processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = processing {
            let abort = handle.abort_handle();
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task_id = %task_id, "Processing task failed: {}", e),
                Err(_) => {
                    abort.abort();
                    warn!(
                        task_id = %task_id,
                        "Processing did not stop within {:?}; aborted",
                        join_timeout
                    );
                }
            }
        }

        if task.status.state() != TaskState::Error {
            task.status.set_state(TaskState::Stopped);
        }
    }
}

#[async_trait]
impl TaskLauncher for TaskManager {
    async fn launch_scheduled(&self, config: Arc<TaskConfig>) -> WorkerResult<()> {
        let _guard = self.lifecycle.lock().await;
        if let Some(existing) = self.get(&config.task_id) {
            if existing.is_live() {
                return Ok(());
            }
            self.remove(&config.task_id);
            self.halt(existing).await;
        }
        self.launch_locked(config).await
    }

    async fn halt_scheduled(&self, task_id: &TaskId) {
        let _guard = self.lifecycle.lock().await;
        if let Some(task) = self.remove(task_id) {
            self.halt(task).await;
        }
    }
}
