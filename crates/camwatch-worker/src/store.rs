//! Persistence capability: task configs, events, snapshots, performance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use camwatch_models::{EventCategory, EventRecord, PerformanceSample, TaskConfigSpec, TaskId};
use chrono::{DateTime, NaiveDate, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};

/// Which events a purge applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    /// Non-external events of one task created before `before`.
    Task { task_id: TaskId, before: DateTime<Utc> },
    /// External events (any task) created before `before`.
    External { before: DateTime<Utc> },
}

impl PurgeScope {
    fn before(&self) -> DateTime<Utc> {
        match self {
            PurgeScope::Task { before, .. } | PurgeScope::External { before } => *before,
        }
    }

    /// Whether `record` falls in this scope.
    pub fn matches(&self, record: &EventRecord) -> bool {
        if record.created_at >= self.before() {
            return false;
        }
        match self {
            PurgeScope::Task { task_id, .. } => {
                record.category != EventCategory::External && &record.event.task_id == task_id
            }
            PurgeScope::External { .. } => record.category == EventCategory::External,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PurgeScope::Task { .. } => "task",
            PurgeScope::External { .. } => "external",
        }
    }
}

/// Result of a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub events: usize,
    pub snapshots: usize,
}

/// Persistence capability used by the pipeline and the manager.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a materialized event with an optional JPEG snapshot.
    async fn save_event(&self, record: &EventRecord, snapshot: Option<&[u8]>) -> WorkerResult<()>;

    async fn record_performance(&self, sample: &PerformanceSample) -> WorkerResult<()>;

    async fn load_config(&self, task_id: &TaskId) -> WorkerResult<TaskConfigSpec>;

    async fn list_configs(&self) -> WorkerResult<Vec<TaskConfigSpec>>;

    async fn set_enabled(&self, task_id: &TaskId, enabled: bool) -> WorkerResult<()>;

    /// Delete events (and their snapshots) in `scope`.
    async fn purge_events(&self, scope: &PurgeScope) -> WorkerResult<PurgeReport>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    configs: Vec<TaskConfigSpec>,
    events: Vec<(EventRecord, Option<Vec<u8>>)>,
    performance: Vec<PerformanceSample>,
    enabled_writes: Vec<(TaskId, bool)>,
}

/// Store kept entirely in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: Vec<TaskConfigSpec>) -> Self {
        let store = Self::new();
        store.lock().configs = configs;
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent `save_event` calls fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Insert an event directly, bypassing the failure toggle.
    pub fn insert_event(&self, record: EventRecord, snapshot: Option<Vec<u8>>) {
        self.lock().events.push((record, snapshot));
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.lock().events.iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().events.iter().filter(|(_, s)| s.is_some()).count()
    }

    pub fn performance(&self) -> Vec<PerformanceSample> {
        self.lock().performance.clone()
    }

    pub fn enabled_writes(&self) -> Vec<(TaskId, bool)> {
        self.lock().enabled_writes.clone()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save_event(&self, record: &EventRecord, snapshot: Option<&[u8]>) -> WorkerResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(WorkerError::store_failed("save_event rejected"));
        }
        self.lock()
            .events
            .push((record.clone(), snapshot.map(<[u8]>::to_vec)));
        Ok(())
    }

    async fn record_performance(&self, sample: &PerformanceSample) -> WorkerResult<()> {
        self.lock().performance.push(sample.clone());
        Ok(())
    }

    async fn load_config(&self, task_id: &TaskId) -> WorkerResult<TaskConfigSpec> {
        self.lock()
            .configs
            .iter()
            .find(|c| c.task_id == task_id.as_str())
            .cloned()
            .ok_or_else(|| WorkerError::TaskNotFound(task_id.clone()))
    }

    async fn list_configs(&self) -> WorkerResult<Vec<TaskConfigSpec>> {
        Ok(self.lock().configs.clone())
    }

    async fn set_enabled(&self, task_id: &TaskId, enabled: bool) -> WorkerResult<()> {
        let mut state = self.lock();
        state.enabled_writes.push((task_id.clone(), enabled));
        if let Some(config) = state
            .configs
            .iter_mut()
            .find(|c| c.task_id == task_id.as_str())
        {
            config.enabled = enabled;
        }
        Ok(())
    }

    async fn purge_events(&self, scope: &PurgeScope) -> WorkerResult<PurgeReport> {
        let mut state = self.lock();
        let mut report = PurgeReport::default();
        state.events.retain(|(record, snapshot)| {
            if scope.matches(record) {
                report.events += 1;
                report.snapshots += usize::from(snapshot.is_some());
                false
            } else {
                true
            }
        });
        Ok(report)
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// Store backed by the local filesystem.
///
/// Layout under `root`:
/// - `events/<YYYY-MM-DD>/<camera>/<event-id>.json` plus `<event-id>.jpg`
/// - `performance/<YYYY-MM-DD>.jsonl`
///
/// Task configs live in a separate JSON array file.
pub struct FileStore {
    root: PathBuf,
    tasks_file: PathBuf,
    config_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, tasks_file: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tasks_file: tasks_file.into(),
            config_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    fn event_dir(&self, record: &EventRecord) -> PathBuf {
        self.events_dir()
            .join(record.created_at.format("%Y-%m-%d").to_string())
            .join(sanitize(&record.camera_id))
    }

    async fn read_config_values(&self) -> WorkerResult<Vec<serde_json::Value>> {
        match tokio::fs::read(&self.tasks_file).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_config_values(&self, values: &[serde_json::Value]) -> WorkerResult<()> {
        let tmp = self.tasks_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(values)?).await?;
        tokio::fs::rename(&tmp, &self.tasks_file).await?;
        Ok(())
    }

    /// Delete matching events under one date directory. A camera directory
    /// that cannot be processed is logged and skipped.
    async fn purge_date_dir(&self, dir: &Path, scope: &PurgeScope) -> WorkerResult<PurgeReport> {
        let mut report = PurgeReport::default();
        let mut cameras = tokio::fs::read_dir(dir).await?;
        while let Some(camera) = cameras.next_entry().await? {
            let path = camera.path();
            match self.purge_camera_dir(&path, scope, &mut report).await {
                Ok(()) => {
                    // Only succeeds when the directory is empty.
                    let _ = tokio::fs::remove_dir(&path).await;
                }
                Err(e) => {
                    warn!(dir = %path.display(), "Skipping camera directory during purge: {}", e);
                }
            }
        }
        let _ = tokio::fs::remove_dir(dir).await;
        Ok(report)
    }

    async fn purge_camera_dir(
        &self,
        camera: &Path,
        scope: &PurgeScope,
        report: &mut PurgeReport,
    ) -> WorkerResult<()> {
        if !tokio::fs::symlink_metadata(camera).await?.is_dir() {
            return Ok(());
        }
        let mut files = tokio::fs::read_dir(camera).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: EventRecord = match tokio::fs::read(&path)
                .await
                .map_err(WorkerError::from)
                .and_then(|b| serde_json::from_slice(&b).map_err(WorkerError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable event: {}", e);
                    continue;
                }
            };
            if !scope.matches(&record) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            report.events += 1;
            let snapshot = path.with_extension("jpg");
            if tokio::fs::remove_file(&snapshot).await.is_ok() {
                report.snapshots += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for FileStore {
    async fn save_event(&self, record: &EventRecord, snapshot: Option<&[u8]>) -> WorkerResult<()> {
        let dir = self.event_dir(record);
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(bytes) = snapshot {
            tokio::fs::write(dir.join(format!("{}.jpg", record.id)), bytes).await?;
        }
        tokio::fs::write(
            dir.join(format!("{}.json", record.id)),
            serde_json::to_vec_pretty(record)?,
        )
        .await?;

        debug!(event_id = %record.id, dir = %dir.display(), "Event saved");
        Ok(())
    }

    async fn record_performance(&self, sample: &PerformanceSample) -> WorkerResult<()> {
        let dir = self.root.join("performance");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.jsonl", sample.recorded_at.format("%Y-%m-%d")));

        let mut line = serde_json::to_vec(sample)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_config(&self, task_id: &TaskId) -> WorkerResult<TaskConfigSpec> {
        self.list_configs()
            .await?
            .into_iter()
            .find(|c| c.task_id == task_id.as_str())
            .ok_or_else(|| WorkerError::TaskNotFound(task_id.clone()))
    }

    async fn list_configs(&self) -> WorkerResult<Vec<TaskConfigSpec>> {
        let values = self.read_config_values().await?;
        let mut configs = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<TaskConfigSpec>(value) {
                Ok(spec) => configs.push(spec),
                Err(e) => warn!(index = i, "Skipping malformed task config: {}", e),
            }
        }
        Ok(configs)
    }

    async fn set_enabled(&self, task_id: &TaskId, enabled: bool) -> WorkerResult<()> {
        let _guard = self.config_lock.lock().await;
        let mut values = self.read_config_values().await?;

        let entry = values
            .iter_mut()
            .find(|v| v.get("task_id").and_then(|id| id.as_str()) == Some(task_id.as_str()))
            .ok_or_else(|| WorkerError::TaskNotFound(task_id.clone()))?;
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("enabled".to_string(), serde_json::Value::Bool(enabled));
        }

        self.write_config_values(&values).await?;
        info!(task_id = %task_id, enabled, "Updated task enabled flag");
        Ok(())
    }

    async fn purge_events(&self, scope: &PurgeScope) -> WorkerResult<PurgeReport> {
        let events_dir = self.events_dir();
        let mut dates = match tokio::fs::read_dir(&events_dir).await {
            Ok(dates) => dates,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PurgeReport::default())
            }
            Err(e) => return Err(e.into()),
        };

        let cutoff = scope.before().date_naive();
        let mut total = PurgeReport::default();
        while let Some(entry) = dates.next_entry().await? {
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
            else {
                continue;
            };
            // Directories dated after the cutoff cannot hold older events.
            if date > cutoff {
                continue;
            }
            match self.purge_date_dir(&entry.path(), scope).await {
                Ok(report) => {
                    total.events += report.events;
                    total.snapshots += report.snapshots;
                }
                Err(e) => {
                    warn!(date = %date, "Skipping date directory during purge: {}", e);
                }
            }
        }
        Ok(total)
    }
}

/// Make a camera id safe to use as a single path component.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
