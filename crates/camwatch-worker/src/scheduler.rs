//! Scheduler: turns schedule specs into start/stop calls on the manager.
//!
//! Each scheduled task gets one async job that sleeps until the next trigger
//! (local time), asks the launcher to start the task, and, when the schedule
//! carries a duration, arranges a deferred stop. Deferred stops are held by
//! the scheduler, not the job: replacing a job keeps the stop of a run it
//! already launched, while unscheduling cancels both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use camwatch_models::{ScheduleSpec, TaskConfig, TaskId};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};

/// How far ahead trigger search looks before giving up.
const SEARCH_HORIZON_DAYS: i64 = 400;

/// What the scheduler drives. Implemented by the task manager.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch_scheduled(&self, config: Arc<TaskConfig>) -> WorkerResult<()>;

    async fn halt_scheduled(&self, task_id: &TaskId);
}

fn day_matches(spec: &ScheduleSpec, date: NaiveDate) -> bool {
    let weekday = date.weekday().number_from_monday() as u8;
    match spec {
        ScheduleSpec::ClockTimes {
            weekdays,
            monthdays,
            ..
        } => {
            if weekdays.is_empty() && monthdays.is_empty() {
                return true;
            }
            weekdays.contains(&weekday) || monthdays.contains(&(date.day() as u8))
        }
        ScheduleSpec::Window { weekdays, .. } => {
            weekdays.is_empty() || weekdays.contains(&weekday)
        }
    }
}

fn times_of_day(spec: &ScheduleSpec) -> Vec<NaiveTime> {
    let mut times = match spec {
        ScheduleSpec::ClockTimes { times, .. } => times.clone(),
        ScheduleSpec::Window {
            start,
            end,
            every_minutes,
            ..
        } => {
            let step = chrono::Duration::minutes(i64::from((*every_minutes).max(1)));
            let mut times = Vec::new();
            let mut t = *start;
            while t < *end {
                times.push(t);
                let (next, wrapped) = t.overflowing_add_signed(step);
                if wrapped != 0 {
                    break;
                }
                t = next;
            }
            times
        }
    };
    times.sort();
    times.dedup();
    times
}

/// First trigger strictly after `after`, or `None` if nothing fires within the horizon.
pub fn next_trigger(spec: &ScheduleSpec, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let times = times_of_day(spec);
    if times.is_empty() {
        return None;
    }
    let start = after.date();
    (0..=SEARCH_HORIZON_DAYS)
        .filter_map(|offset| start.checked_add_signed(chrono::Duration::days(offset)))
        .filter(|date| day_matches(spec, *date))
        .find_map(|date| {
            times
                .iter()
                .map(|t| date.and_time(*t))
                .find(|candidate| *candidate > after)
        })
}

/// Source of the wall-clock time triggers are computed against.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Pending deferred stop per task. A newer run's stop replaces an older one.
type PendingStops = Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>;

fn lock_stops(
    stops: &PendingStops,
) -> std::sync::MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
    stops.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of scheduled jobs, keyed by task.
pub struct Scheduler {
    jobs: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    stops: PendingStops,
    launcher: Weak<dyn TaskLauncher>,
    runtime: Handle,
    clock: Clock,
}

impl Scheduler {
    pub fn new(launcher: Weak<dyn TaskLauncher>, runtime: Handle) -> Self {
        Self::with_clock(launcher, runtime, Arc::new(|| Local::now().naive_local()))
    }

    pub fn with_clock(launcher: Weak<dyn TaskLauncher>, runtime: Handle, clock: Clock) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            stops: Arc::new(Mutex::new(HashMap::new())),
            launcher,
            runtime,
            clock,
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the job for a scheduled task.
    pub fn schedule(&self, config: Arc<TaskConfig>) -> WorkerResult<()> {
        let spec = config.schedule.clone().ok_or_else(|| {
            WorkerError::config_error(format!("task {} has no schedule", config.task_id))
        })?;

        let task_id = config.task_id.clone();
        let handle = self.runtime.spawn(job_loop(JobContext {
            config,
            spec,
            launcher: self.launcher.clone(),
            stops: self.stops.clone(),
            clock: self.clock.clone(),
        }));
        if let Some(previous) = self.jobs().insert(task_id.clone(), handle) {
            previous.abort();
            debug!(task_id = %task_id, "Replaced existing schedule");
        }
        info!(task_id = %task_id, "Task scheduled");
        Ok(())
    }

    /// Remove a task's job, cancelling any pending deferred stop.
    pub fn unschedule(&self, task_id: &TaskId) -> bool {
        if let Some(stop) = lock_stops(&self.stops).remove(task_id) {
            stop.abort();
        }
        match self.jobs().remove(task_id) {
            Some(handle) => {
                handle.abort();
                info!(task_id = %task_id, "Task unscheduled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, task_id: &TaskId) -> bool {
        self.jobs()
            .get(task_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn scheduled_ids(&self) -> Vec<TaskId> {
        self.jobs().keys().cloned().collect()
    }

    /// Whether a deferred stop is waiting to halt the task's current run.
    pub fn has_pending_stop(&self, task_id: &TaskId) -> bool {
        lock_stops(&self.stops)
            .get(task_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.jobs().drain() {
            handle.abort();
        }
        for (_, stop) in lock_stops(&self.stops).drain() {
            stop.abort();
        }
    }
}

struct JobContext {
    config: Arc<TaskConfig>,
    spec: ScheduleSpec,
    launcher: Weak<dyn TaskLauncher>,
    stops: PendingStops,
    clock: Clock,
}

async fn job_loop(ctx: JobContext) {
    let JobContext {
        config,
        spec,
        launcher,
        stops,
        clock,
    } = ctx;

    loop {
        let now = clock();
        let Some(next) = next_trigger(&spec, now) else {
            warn!(task_id = %config.task_id, "Schedule has no future trigger");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(task_id = %config.task_id, next = %next, "Waiting for next trigger");
        tokio::time::sleep(wait).await;

        let Some(target) = launcher.upgrade() else {
            break;
        };
        info!(task_id = %config.task_id, "Schedule triggered");
        if let Err(e) = target.launch_scheduled(config.clone()).await {
            warn!(task_id = %config.task_id, "Scheduled start failed: {}", e);
            continue;
        }

        if let Some(minutes) = spec.duration_minutes() {
            let weak = Arc::downgrade(&target);
            let task_id = config.task_id.clone();
            let stop = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(u64::from(minutes) * 60)).await;
                if let Some(target) = weak.upgrade() {
                    info!(task_id = %task_id, "Scheduled run finished");
                    target.halt_scheduled(&task_id).await;
                }
            });
            if let Some(previous) = lock_stops(&stops).insert(config.task_id.clone(), stop) {
                previous.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: (i32, u32, u32), time: (u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, 0)
            .unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    struct NoopLauncher;

    #[async_trait]
    impl TaskLauncher for NoopLauncher {
        async fn launch_scheduled(&self, _config: Arc<TaskConfig>) -> WorkerResult<()> {
            Ok(())
        }

        async fn halt_scheduled(&self, _task_id: &TaskId) {}
    }

    #[test]
    fn test_clock_times_same_day_and_rollover() {
        let spec = ScheduleSpec::ClockTimes {
            times: vec![hm(20, 30), hm(8, 0)],
            weekdays: vec![],
            monthdays: vec![],
            duration_minutes: None,
        };
        // 2024-05-06 is a Monday.
        assert_eq!(
            next_trigger(&spec, at((2024, 5, 6), (7, 0))),
            Some(at((2024, 5, 6), (8, 0)))
        );
        assert_eq!(
            next_trigger(&spec, at((2024, 5, 6), (8, 0))),
            Some(at((2024, 5, 6), (20, 30)))
        );
        assert_eq!(
            next_trigger(&spec, at((2024, 5, 6), (21, 0))),
            Some(at((2024, 5, 7), (8, 0)))
        );
    }

    #[test]
    fn test_weekday_and_monthday_sets_are_combined() {
        let spec = ScheduleSpec::ClockTimes {
            times: vec![hm(9, 0)],
            weekdays: vec![6],
            monthdays: vec![15],
            duration_minutes: None,
        };
        // From Monday 2024-05-06: the 11th is Saturday, the 15th a Wednesday.
        let first = next_trigger(&spec, at((2024, 5, 6), (10, 0))).unwrap();
        assert_eq!(first, at((2024, 5, 11), (9, 0)));
        let second = next_trigger(&spec, first).unwrap();
        assert_eq!(second, at((2024, 5, 15), (9, 0)));
    }

    #[test]
    fn test_window_steps_until_end() {
        let spec = ScheduleSpec::Window {
            start: hm(9, 0),
            end: hm(10, 0),
            every_minutes: 20,
            weekdays: vec![1],
            duration_minutes: Some(10),
        };
        assert_eq!(times_of_day(&spec), vec![hm(9, 0), hm(9, 20), hm(9, 40)]);
        assert_eq!(
            next_trigger(&spec, at((2024, 5, 6), (9, 45))),
            Some(at((2024, 5, 13), (9, 0)))
        );
    }

    #[test]
    fn test_month_end_and_empty_times() {
        let spec = ScheduleSpec::ClockTimes {
            times: vec![hm(9, 0)],
            weekdays: vec![],
            monthdays: vec![31],
            duration_minutes: None,
        };
        assert!(next_trigger(&spec, at((2024, 5, 6), (9, 0))).is_some());

        let empty = ScheduleSpec::ClockTimes {
            times: vec![],
            weekdays: vec![],
            monthdays: vec![],
            duration_minutes: None,
        };
        assert_eq!(next_trigger(&empty, at((2024, 5, 6), (9, 0))), None);
    }

    #[tokio::test]
    async fn test_schedule_and_unschedule() {
        let launcher: Arc<dyn TaskLauncher> = Arc::new(NoopLauncher);
        let scheduler = Scheduler::new(Arc::downgrade(&launcher), Handle::current());
        let config = Arc::new(
            TaskConfig::from_json(serde_json::json!({
                "task_id": "cam-1",
                "camera_id": "front-door",
                "stream_url": "rtsp://cam/1",
                "model_path": "yolov8n",
                "frequency_mode": "scheduled",
                "schedule": {"kind": "clock_times", "times": ["03:00:00"]}
            }))
            .unwrap(),
        );

        tokio_test::assert_ok!(scheduler.schedule(config.clone()));
        tokio_test::assert_ok!(scheduler.schedule(config.clone()));
        assert!(scheduler.is_scheduled(&config.task_id));
        assert_eq!(scheduler.scheduled_ids().len(), 1);

        assert!(scheduler.unschedule(&config.task_id));
        assert!(!scheduler.unschedule(&config.task_id));
        assert!(!scheduler.is_scheduled(&config.task_id));
    }

    /// Records launch/halt calls with the (paused) runtime time they arrived at.
    struct RecordingLauncher {
        origin: tokio::time::Instant,
        calls: Mutex<Vec<(&'static str, u64)>>,
    }

    impl RecordingLauncher {
        fn new() -> Self {
            Self {
                origin: tokio::time::Instant::now(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, what: &'static str) {
            let at = self.origin.elapsed().as_secs();
            self.calls.lock().unwrap().push((what, at));
        }

        fn calls(&self) -> Vec<(&'static str, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskLauncher for RecordingLauncher {
        async fn launch_scheduled(&self, _config: Arc<TaskConfig>) -> WorkerResult<()> {
            self.record("launch");
            Ok(())
        }

        async fn halt_scheduled(&self, _task_id: &TaskId) {
            self.record("halt");
        }
    }

    /// Wall clock that starts at `base` and follows tokio's paused time.
    fn paused_clock(base: NaiveDateTime) -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || {
            base + chrono::Duration::from_std(origin.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
        })
    }

    /// Triggers at 09:00 and 09:10, each run lasting five minutes.
    fn morning_runs() -> Arc<TaskConfig> {
        Arc::new(
            TaskConfig::from_json(serde_json::json!({
                "task_id": "cam-1",
                "camera_id": "front-door",
                "stream_url": "rtsp://cam/1",
                "model_path": "yolov8n",
                "frequency_mode": "scheduled",
                "schedule": {
                    "kind": "clock_times",
                    "times": ["09:00:00", "09:10:00"],
                    "duration_minutes": 5
                }
            }))
            .unwrap(),
        )
    }

    fn paused_scheduler(launcher: &Arc<RecordingLauncher>) -> Scheduler {
        let launcher: Arc<dyn TaskLauncher> = launcher.clone();
        Scheduler::with_clock(
            Arc::downgrade(&launcher),
            Handle::current(),
            paused_clock(at((2024, 5, 6), (8, 59))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_launches_then_halts_after_duration() {
        let launcher = Arc::new(RecordingLauncher::new());
        let scheduler = paused_scheduler(&launcher);
        let config = morning_runs();

        tokio_test::assert_ok!(scheduler.schedule(config.clone()));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(launcher.calls(), vec![("launch", 60)]);
        assert!(scheduler.has_pending_stop(&config.task_id));

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(
            launcher.calls(),
            vec![("launch", 60), ("halt", 360), ("launch", 660)]
        );
        assert!(scheduler.is_scheduled(&config.task_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_keeps_the_running_window_stop() {
        let launcher = Arc::new(RecordingLauncher::new());
        let scheduler = paused_scheduler(&launcher);
        let config = morning_runs();

        tokio_test::assert_ok!(scheduler.schedule(config.clone()));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.calls(), vec![("launch", 60)]);

        // Replacing the job mid-run must not lose the stop of the 09:00 run.
        tokio_test::assert_ok!(scheduler.schedule(config.clone()));
        assert!(scheduler.has_pending_stop(&config.task_id));

        tokio::time::sleep(Duration::from_secs(580)).await;
        assert_eq!(
            launcher.calls(),
            vec![("launch", 60), ("halt", 360), ("launch", 660)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_cancels_pending_stop() {
        let launcher = Arc::new(RecordingLauncher::new());
        let scheduler = paused_scheduler(&launcher);
        let config = morning_runs();

        tokio_test::assert_ok!(scheduler.schedule(config.clone()));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(scheduler.unschedule(&config.task_id));
        assert!(!scheduler.has_pending_stop(&config.task_id));

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(launcher.calls(), vec![("launch", 60)]);
    }
}
