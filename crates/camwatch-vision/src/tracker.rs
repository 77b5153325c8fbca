//! IoU-based multi-object tracker with zone and line analytics.
//!
//! One tracker per task, mutated only by that task's processing cycle.
//! Tracks live in an id-keyed arena; every cycle:
//!
//! 1. candidate (track, detection) pairs with IoU at or above the threshold
//!    are assigned greedily, highest IoU first, ties to the older track
//! 2. unmatched detections open new tracks
//! 3. unmatched tracks are dropped or aged according to [`MissPolicy`]
//! 4. matched tracks extend their trajectory (interpolating large jumps,
//!    then smoothing)
//! 5. zone analytics compare each track's previous and current center
//!
//! Semantic events are buffered until [`IoUTracker::drain_events`], which
//! also clears the per-cycle dedup set.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use camwatch_models::{
    BehaviorMode, BoundingBox, Counts, Detection, Direction, EventKind, EventSource, FlowFilter,
    Point, SemanticEvent, TaskId, TrackView, ZoneAnalysis, ZoneConfig, ZoneGeometry,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use tracing::debug;

use crate::geometry::{interpolate, point_in_polygon, segments_intersect, vertical_direction};

/// What happens to a track that no detection matched this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissPolicy {
    /// Drop the track on its first miss.
    #[default]
    Immediate,
    /// Keep the track for up to `max_age` consecutive misses.
    Grace { max_age: u32 },
}

impl MissPolicy {
    /// Parse `immediate` or `grace:<max_age>`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        if s == "immediate" {
            return Some(MissPolicy::Immediate);
        }
        let max_age = s.strip_prefix("grace:")?.parse().ok()?;
        Some(MissPolicy::Grace { max_age })
    }
}

/// Tracker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub iou_threshold: f64,
    pub miss_policy: MissPolicy,
    /// Hits before a track is shown on previews.
    pub min_hits: u32,
    /// Maximum trajectory length; oldest points are dropped first.
    pub trajectory_window: usize,
    /// Center jumps longer than this (pixels) are filled by interpolation.
    pub interpolation_threshold: f64,
    /// Spacing of interpolated points (pixels).
    pub interpolation_spacing: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            miss_policy: MissPolicy::Immediate,
            min_hits: 3,
            trajectory_window: 30,
            interpolation_threshold: 50.0,
            interpolation_spacing: 10.0,
        }
    }
}

/// A tracked object.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: u64,
    pub class_id: u32,
    pub bbox: BoundingBox,
    pub center: Point,
    pub trajectory: VecDeque<Point>,
    pub hit_count: u32,
    /// Consecutive cycles without a match.
    pub misses: u32,
    pub confidence: f32,
}

impl Track {
    fn view(&self) -> TrackView {
        TrackView {
            track_id: self.id,
            class_id: self.class_id,
            bbox: self.bbox,
            trajectory: self.trajectory.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Track { track_id: u64, kind: EventKind },
    Occupancy { cycle: u64, kind: EventKind, delta: i64 },
}

/// Zone analytics state.
#[derive(Debug)]
struct ZoneState {
    config: ZoneConfig,
    /// Geometry in pixels, and the frame size it was computed for.
    pixels: Option<((u32, u32), ZoneGeometry)>,
    occupancy: u32,
    today_in: u64,
    today_out: u64,
    day: NaiveDate,
    /// Tracks already counted by a flow line.
    flow_counted: BTreeSet<u64>,
}

impl ZoneState {
    fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            pixels: None,
            occupancy: 0,
            today_in: 0,
            today_out: 0,
            day: Local::now().date_naive(),
            flow_counted: BTreeSet::new(),
        }
    }

    fn geometry_for(&mut self, frame_size: (u32, u32)) -> ZoneGeometry {
        match &self.pixels {
            Some((size, geometry)) if *size == frame_size => geometry.clone(),
            _ => {
                let geometry = self.config.geometry.denormalize(frame_size.0, frame_size.1);
                self.pixels = Some((frame_size, geometry.clone()));
                geometry
            }
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            debug!(
                previous = %self.day,
                today = %today,
                "Resetting daily zone counters"
            );
            self.day = today;
            self.today_in = 0;
            self.today_out = 0;
        }
    }

    fn counts(&self) -> Counts {
        Counts {
            current: self.occupancy,
            today_in: self.today_in,
            today_out: self.today_out,
        }
    }

    fn record(&mut self, direction: Direction, amount: u64) {
        match direction {
            Direction::In => self.today_in += amount,
            Direction::Out => self.today_out += amount,
        }
    }
}

/// Track movement observed in one cycle.
struct Movement {
    track_id: u64,
    class_id: u32,
    from: Point,
    to: Point,
}

/// Per-task multi-object tracker.
pub struct IoUTracker {
    task_id: TaskId,
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_track_id: u64,
    cycle: u64,
    zone: Option<ZoneState>,
    pending: Vec<SemanticEvent>,
    emitted: HashSet<DedupKey>,
}

impl IoUTracker {
    /// Create a new tracker.
    pub fn new(task_id: TaskId, config: TrackerConfig, zone: Option<ZoneConfig>) -> Self {
        Self {
            task_id,
            config,
            tracks: BTreeMap::new(),
            next_track_id: 1,
            cycle: 0,
            zone: zone.map(ZoneState::new),
            pending: Vec::new(),
            emitted: HashSet::new(),
        }
    }

    /// Update tracks with one cycle of detections.
    ///
    /// Returns the track id assigned to each detection, by index.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_size: (u32, u32),
        now: DateTime<Utc>,
    ) -> Vec<u64> {
        self.cycle += 1;

        let assignment = self.assign(detections);
        let mut assigned = vec![0u64; detections.len()];
        let mut matched: BTreeSet<u64> = BTreeSet::new();
        let mut movements = Vec::new();

        for (det_idx, track_id) in assignment.iter().enumerate() {
            let det = &detections[det_idx];
            let id = match track_id {
                Some(id) => {
                    if let Some(movement) = self.advance_track(*id, det) {
                        movements.push(movement);
                    }
                    *id
                }
                None => self.open_track(det),
            };
            matched.insert(id);
            assigned[det_idx] = id;
        }

        let removed = self.age_unmatched(&matched);

        if let Some(zone) = self.zone.as_mut() {
            zone.flow_counted.retain(|id| !removed.contains(id));
            zone.roll_day(now.with_timezone(&Local).date_naive());
        }
        if self.zone.is_some() {
            self.analyze_zone(&movements, &matched, frame_size, now);
        }

        assigned
    }

    /// Greedy global assignment. `result[det_idx]` is the matched track, if any.
    fn assign(&self, detections: &[Detection]) -> Vec<Option<u64>> {
        let mut candidates: Vec<(f64, u64, usize)> = Vec::new();
        for (track_id, track) in &self.tracks {
            for (det_idx, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.iou_threshold && iou > 0.0 {
                    candidates.push((iou, *track_id, det_idx));
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut result = vec![None; detections.len()];
        let mut claimed: HashSet<u64> = HashSet::new();
        for (_, track_id, det_idx) in candidates {
            if result[det_idx].is_some() || claimed.contains(&track_id) {
                continue;
            }
            result[det_idx] = Some(track_id);
            claimed.insert(track_id);
        }
        result
    }

    fn open_track(&mut self, det: &Detection) -> u64 {
        let id = self.next_track_id;
        self.next_track_id += 1;

        let center = det.bbox.center();
        let mut trajectory = VecDeque::with_capacity(self.config.trajectory_window);
        trajectory.push_back(center);

        self.tracks.insert(
            id,
            Track {
                id,
                class_id: det.class_id,
                bbox: det.bbox,
                center,
                trajectory,
                hit_count: 1,
                misses: 0,
                confidence: det.confidence,
            },
        );
        id
    }

    fn advance_track(&mut self, id: u64, det: &Detection) -> Option<Movement> {
        let config = &self.config;
        let track = self.tracks.get_mut(&id)?;

        let previous = track.center;
        let current = det.bbox.center();

        if previous.distance(&current) > config.interpolation_threshold {
            track
                .trajectory
                .extend(interpolate(&previous, &current, config.interpolation_spacing));
        }
        track.trajectory.push_back(current);
        if track.trajectory.len() >= 3 {
            smooth(&mut track.trajectory);
        }
        while track.trajectory.len() > config.trajectory_window {
            track.trajectory.pop_front();
        }

        track.bbox = det.bbox;
        track.center = current;
        track.class_id = det.class_id;
        track.confidence = det.confidence;
        track.hit_count += 1;
        track.misses = 0;

        Some(Movement {
            track_id: id,
            class_id: det.class_id,
            from: previous,
            to: current,
        })
    }

    /// Apply the miss policy. Returns ids of tracks removed this cycle.
    fn age_unmatched(&mut self, matched: &BTreeSet<u64>) -> Vec<u64> {
        let policy = self.config.miss_policy;
        let mut removed = Vec::new();
        self.tracks.retain(|id, track| {
            if matched.contains(id) {
                return true;
            }
            track.misses += 1;
            let keep = match policy {
                MissPolicy::Immediate => false,
                MissPolicy::Grace { max_age } => track.misses <= max_age,
            };
            if !keep {
                removed.push(*id);
            }
            keep
        });
        removed
    }

    fn analyze_zone(
        &mut self,
        movements: &[Movement],
        matched: &BTreeSet<u64>,
        frame_size: (u32, u32),
        now: DateTime<Utc>,
    ) {
        let Some(zone) = self.zone.as_mut() else {
            return;
        };
        let geometry = zone.geometry_for(frame_size);
        let analysis = zone.config.analysis;
        let previous = zone.occupancy;

        // Recounted from scratch each cycle over the tracks seen this cycle.
        if let ZoneGeometry::Polygon { vertices } = &geometry {
            zone.occupancy = self
                .tracks
                .values()
                .filter(|t| matched.contains(&t.id) && point_in_polygon(&t.center, vertices))
                .count() as u32;
        }

        match analysis {
            ZoneAnalysis::Behavior { mode } => self.behavior_events(movements, &geometry, mode, now),
            ZoneAnalysis::Occupancy => self.occupancy_event(previous, now),
            ZoneAnalysis::Flow { filter } => self.flow_events(movements, &geometry, filter, now),
        }
    }

    fn behavior_events(
        &mut self,
        movements: &[Movement],
        geometry: &ZoneGeometry,
        mode: BehaviorMode,
        now: DateTime<Utc>,
    ) {
        for m in movements {
            let (kind, direction) = match geometry {
                ZoneGeometry::Polygon { vertices } => {
                    let was_inside = point_in_polygon(&m.from, vertices);
                    let is_inside = point_in_polygon(&m.to, vertices);
                    match (was_inside, is_inside) {
                        (false, true) => (EventKind::ZoneEnter, Direction::In),
                        (true, false) => (EventKind::ZoneExit, Direction::Out),
                        _ => continue,
                    }
                }
                ZoneGeometry::Line { start, end } => {
                    if !segments_intersect(&m.from, &m.to, start, end) {
                        continue;
                    }
                    match mode {
                        BehaviorMode::Simple => {
                            let direction = vertical_direction(&m.from, &m.to);
                            if let (Some(d), Some(zone)) = (direction, self.zone.as_mut()) {
                                zone.record(d, 1);
                            }
                            self.emit_track_event(m, EventKind::LineCross, EventSource::Behavior, now);
                            continue;
                        }
                        BehaviorMode::Directional(_) => match vertical_direction(&m.from, &m.to) {
                            Some(Direction::In) => (EventKind::LineCrossIn, Direction::In),
                            Some(Direction::Out) => (EventKind::LineCrossOut, Direction::Out),
                            None => continue,
                        },
                    }
                }
            };

            if !mode.accepts(direction) {
                continue;
            }
            if let Some(zone) = self.zone.as_mut() {
                zone.record(direction, 1);
            }
            self.emit_track_event(m, kind, EventSource::Behavior, now);
        }
    }

    fn occupancy_event(&mut self, previous: u32, now: DateTime<Utc>) {
        let Some(zone) = self.zone.as_mut() else {
            return;
        };
        let delta = zone.occupancy as i64 - previous as i64;
        if delta == 0 {
            return;
        }

        let (kind, direction) = if delta > 0 {
            (EventKind::OccupancyIncrease, Direction::In)
        } else {
            (EventKind::OccupancyDecrease, Direction::Out)
        };
        zone.record(direction, delta.unsigned_abs());
        let counts = zone.counts();

        let key = DedupKey::Occupancy {
            cycle: self.cycle,
            kind,
            delta,
        };
        if !self.emitted.insert(key) {
            return;
        }
        self.pending.push(SemanticEvent {
            task_id: self.task_id.clone(),
            kind,
            source: EventSource::Occupancy,
            track_id: None,
            class_id: None,
            position: None,
            change_amount: Some(delta),
            counts,
            timestamp: now,
        });
    }

    fn flow_events(
        &mut self,
        movements: &[Movement],
        geometry: &ZoneGeometry,
        filter: FlowFilter,
        now: DateTime<Utc>,
    ) {
        let ZoneGeometry::Line { start, end } = geometry else {
            return;
        };
        for m in movements {
            let Some(zone) = self.zone.as_mut() else {
                return;
            };
            if zone.flow_counted.contains(&m.track_id) {
                continue;
            }
            if !segments_intersect(&m.from, &m.to, start, end) {
                continue;
            }
            let Some(direction) = vertical_direction(&m.from, &m.to) else {
                continue;
            };
            if !filter.accepts(direction) {
                continue;
            }

            zone.flow_counted.insert(m.track_id);
            zone.record(direction, 1);
            let kind = match direction {
                Direction::In => EventKind::LineCrossIn,
                Direction::Out => EventKind::LineCrossOut,
            };
            self.emit_track_event(m, kind, EventSource::Flow, now);
        }
    }

    fn emit_track_event(
        &mut self,
        m: &Movement,
        kind: EventKind,
        source: EventSource,
        now: DateTime<Utc>,
    ) {
        let key = DedupKey::Track {
            track_id: m.track_id,
            kind,
        };
        if !self.emitted.insert(key) {
            return;
        }
        let counts = self.counts();
        self.pending.push(SemanticEvent {
            task_id: self.task_id.clone(),
            kind,
            source,
            track_id: Some(m.track_id),
            class_id: Some(m.class_id),
            position: Some(m.to),
            change_amount: None,
            counts,
            timestamp: now,
        });
    }

    /// Take the events raised since the last drain and reset dedup state.
    pub fn drain_events(&mut self) -> Vec<SemanticEvent> {
        self.emitted.clear();
        std::mem::take(&mut self.pending)
    }

    /// Current zone counters (zeros when no zone is configured).
    pub fn counts(&self) -> Counts {
        self.zone.as_ref().map(ZoneState::counts).unwrap_or_default()
    }

    /// Zone geometry in pixels for the last frame size seen.
    pub fn zone_pixels(&self) -> Option<&ZoneGeometry> {
        self.zone
            .as_ref()
            .and_then(|z| z.pixels.as_ref())
            .map(|(_, g)| g)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Confirmed tracks (enough hits) as preview views.
    pub fn confirmed_views(&self) -> Vec<TrackView> {
        self.tracks
            .values()
            .filter(|t| t.hit_count >= self.config.min_hits)
            .map(Track::view)
            .collect()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

/// Centered moving average with a window of three.
fn smooth(trajectory: &mut VecDeque<Point>) {
    let raw: Vec<Point> = trajectory.iter().copied().collect();
    let n = raw.len();
    for (i, slot) in trajectory.iter_mut().enumerate() {
        let lo = i.saturating_sub(1);
        let hi = (i + 2).min(n);
        let window = &raw[lo..hi];
        let len = window.len() as f64;
        *slot = Point::new(
            window.iter().map(|p| p.x).sum::<f64>() / len,
            window.iter().map(|p| p.y).sum::<f64>() / len,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_models::ZoneConfigSpec;

    const FRAME: (u32, u32) = (400, 400);

    fn det(x1: f64, y1: f64, x2: f64, y2: f64) -> Detection {
        Detection::new(BoundingBox::from_corners(x1, y1, x2, y2), 0.9, 0)
    }

    fn tracker(config: TrackerConfig, zone: Option<serde_json::Value>) -> IoUTracker {
        let zone = zone.map(|json| {
            let spec: ZoneConfigSpec = serde_json::from_value(json).unwrap();
            ZoneConfig::try_from(spec).unwrap()
        });
        IoUTracker::new(TaskId::from("cam-1"), config, zone)
    }

    fn horizontal_line(extra: serde_json::Value) -> serde_json::Value {
        let mut json = serde_json::json!({
            "geometry": "line",
            "points": [{"x": 0.0, "y": 0.375}, {"x": 1.0, "y": 0.375}]
        });
        for (k, v) in extra.as_object().unwrap() {
            json[k] = v.clone();
        }
        json
    }

    fn square_zone(extra: serde_json::Value) -> serde_json::Value {
        let mut json = serde_json::json!({
            "geometry": "polygon",
            "points": [
                {"x": 0.25, "y": 0.25}, {"x": 0.75, "y": 0.25},
                {"x": 0.75, "y": 0.75}, {"x": 0.25, "y": 0.75}
            ]
        });
        for (k, v) in extra.as_object().unwrap() {
            json[k] = v.clone();
        }
        json
    }

    // Tall boxes whose centers sit at y=100 and y=200 but still overlap with IoU 0.6.
    fn above_line() -> Detection {
        det(50.0, -100.0, 150.0, 300.0)
    }

    fn below_line() -> Detection {
        det(50.0, 0.0, 150.0, 400.0)
    }

    #[test]
    fn test_same_id_across_overlapping_frames() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        let first = t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now);
        let second = t.update(&[det(12.0, 11.0, 52.0, 51.0)], FRAME, now);
        assert_eq!(first, second);
        assert_eq!(t.track(first[0]).unwrap().hit_count, 2);
    }

    #[test]
    fn test_new_ids_are_monotonic() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        let a = t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now)[0];
        let ids = t.update(
            &[det(10.0, 10.0, 50.0, 50.0), det(200.0, 200.0, 260.0, 260.0)],
            FRAME,
            now,
        );
        assert_eq!(ids[0], a);
        assert!(ids[1] > a);

        let c = t.update(&[det(300.0, 300.0, 350.0, 350.0)], FRAME, now)[0];
        assert!(c > ids[1]);
    }

    #[test]
    fn test_immediate_policy_drops_on_first_miss() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        let id = t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now)[0];
        t.update(&[], FRAME, now);
        assert!(t.track(id).is_none());

        let again = t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now)[0];
        assert_ne!(again, id);
    }

    #[test]
    fn test_grace_policy_keeps_track_through_misses() {
        let config = TrackerConfig {
            miss_policy: MissPolicy::Grace { max_age: 2 },
            ..Default::default()
        };
        let mut t = tracker(config, None);
        let now = Utc::now();
        let id = t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now)[0];

        t.update(&[], FRAME, now);
        t.update(&[], FRAME, now);
        assert_eq!(t.track(id).unwrap().misses, 2);

        let resumed = t.update(&[det(11.0, 10.0, 51.0, 50.0)], FRAME, now)[0];
        assert_eq!(resumed, id);
        assert_eq!(t.track(id).unwrap().misses, 0);

        for _ in 0..3 {
            t.update(&[], FRAME, now);
        }
        assert!(t.track(id).is_none());
    }

    #[test]
    fn test_tie_goes_to_older_track() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        let ids = t.update(
            &[det(0.0, 0.0, 40.0, 40.0), det(20.0, 0.0, 60.0, 40.0)],
            FRAME,
            now,
        );
        // Equidistant from both tracks.
        let next = t.update(&[det(10.0, 0.0, 50.0, 40.0)], FRAME, now);
        assert_eq!(next[0], ids[0]);
    }

    #[test]
    fn test_parse_miss_policy() {
        assert_eq!(MissPolicy::parse("immediate"), Some(MissPolicy::Immediate));
        assert_eq!(
            MissPolicy::parse("grace:10"),
            Some(MissPolicy::Grace { max_age: 10 })
        );
        assert_eq!(MissPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_trajectory_is_bounded() {
        let config = TrackerConfig {
            trajectory_window: 5,
            ..Default::default()
        };
        let mut t = tracker(config, None);
        let now = Utc::now();
        let mut id = 0;
        for step in 0..20 {
            let x = step as f64 * 2.0;
            id = t.update(&[det(x, 10.0, x + 40.0, 50.0)], FRAME, now)[0];
        }
        assert!(t.track(id).unwrap().trajectory.len() <= 5);
    }

    #[test]
    fn test_large_jump_is_interpolated() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        let id = t.update(&[above_line()], FRAME, now)[0];
        t.update(&[below_line()], FRAME, now);
        // One start point, eight interpolated points for a 100px jump, one end point.
        assert_eq!(t.track(id).unwrap().trajectory.len(), 10);
    }

    #[test]
    fn test_smoothing_averages_neighbors() {
        let mut trajectory: VecDeque<Point> = [
            Point::new(0.0, 0.0),
            Point::new(3.0, 0.0),
            Point::new(6.0, 3.0),
        ]
        .into_iter()
        .collect();
        smooth(&mut trajectory);
        assert_eq!(trajectory[0], Point::new(1.5, 0.0));
        assert_eq!(trajectory[1], Point::new(3.0, 1.0));
        assert_eq!(trajectory[2], Point::new(4.5, 1.5));
    }

    #[test]
    fn test_line_direction_classification() {
        let zone = horizontal_line(serde_json::json!({
            "analysis_kind": "behavior",
            "mode": "directional",
            "direction": "in"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();
        t.update(&[above_line()], FRAME, now);
        t.update(&[below_line()], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LineCrossIn);

        // Moving back up is `out`, which this zone does not report.
        t.update(&[above_line()], FRAME, now);
        assert!(t.drain_events().is_empty());
    }

    #[test]
    fn test_line_out_direction() {
        let zone = horizontal_line(serde_json::json!({
            "analysis_kind": "behavior",
            "mode": "directional",
            "direction": "out"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();
        t.update(&[below_line()], FRAME, now);
        t.update(&[above_line()], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LineCrossOut);
        assert_eq!(events[0].source, EventSource::Behavior);
    }

    #[test]
    fn test_simple_line_crossing() {
        let zone = horizontal_line(serde_json::json!({"analysis_kind": "behavior"}));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();
        t.update(&[above_line()], FRAME, now);
        t.update(&[below_line()], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LineCross);
    }

    #[test]
    fn test_area_enter_and_exit() {
        let zone = square_zone(serde_json::json!({"analysis_kind": "behavior"}));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();

        // Center (90, 200) outside, then (120, 200) inside the 100..300 square.
        t.update(&[det(40.0, 150.0, 140.0, 250.0)], FRAME, now);
        t.update(&[det(70.0, 150.0, 170.0, 250.0)], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ZoneEnter);
        assert_eq!(events[0].counts.today_in, 1);

        t.update(&[det(40.0, 150.0, 140.0, 250.0)], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ZoneExit);
    }

    #[test]
    fn test_directional_area_only_reports_configured_direction() {
        let zone = square_zone(serde_json::json!({
            "analysis_kind": "behavior",
            "mode": "directional",
            "direction": "out"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();
        t.update(&[det(40.0, 150.0, 140.0, 250.0)], FRAME, now);
        t.update(&[det(70.0, 150.0, 170.0, 250.0)], FRAME, now);
        assert!(t.drain_events().is_empty());

        t.update(&[det(40.0, 150.0, 140.0, 250.0)], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ZoneExit);
    }

    fn inside_boxes(n: usize) -> Vec<Detection> {
        (0..n)
            .map(|i| {
                let x = 110.0 + i as f64 * 36.0;
                det(x, 180.0, x + 30.0, 220.0)
            })
            .collect()
    }

    #[test]
    fn test_occupancy_delta_emits_single_event() {
        let zone = square_zone(serde_json::json!({
            "analysis_kind": "counting",
            "counting_kind": "occupancy"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();

        t.update(&inside_boxes(3), FRAME, now);
        t.drain_events();
        let before = t.counts();
        assert_eq!(before.current, 3);

        t.update(&inside_boxes(5), FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::OccupancyIncrease);
        assert_eq!(events[0].change_amount, Some(2));
        assert_eq!(events[0].track_id, None);
        assert_eq!(t.counts().today_in, before.today_in + 2);
        assert_eq!(t.counts().current, 5);

        t.update(&inside_boxes(5), FRAME, now);
        assert!(t.drain_events().is_empty());

        t.update(&inside_boxes(1), FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::OccupancyDecrease);
        assert_eq!(events[0].change_amount, Some(-4));
        assert_eq!(t.counts().today_out, 4);
    }

    #[test]
    fn test_flow_counts_each_track_once() {
        let zone = horizontal_line(serde_json::json!({
            "analysis_kind": "counting",
            "counting_kind": "flow"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();

        t.update(&[above_line()], FRAME, now);
        t.update(&[below_line()], FRAME, now);
        t.update(&[above_line()], FRAME, now);
        t.update(&[below_line()], FRAME, now);

        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LineCrossIn);
        assert_eq!(events[0].source, EventSource::Flow);
        assert_eq!(t.counts().today_in, 1);
        assert_eq!(t.counts().today_out, 0);
    }

    #[test]
    fn test_flow_filter_skips_other_direction() {
        let zone = horizontal_line(serde_json::json!({
            "analysis_kind": "counting",
            "counting_kind": "flow",
            "flow_direction": "out"
        }));
        let mut t = tracker(TrackerConfig::default(), Some(zone));
        let now = Utc::now();

        t.update(&[above_line()], FRAME, now);
        t.update(&[below_line()], FRAME, now);
        assert!(t.drain_events().is_empty());

        // Not counted on the way in, so the way out still counts.
        t.update(&[above_line()], FRAME, now);
        let events = t.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LineCrossOut);
    }

    #[test]
    fn test_confirmed_views_require_min_hits() {
        let mut t = tracker(TrackerConfig::default(), None);
        let now = Utc::now();
        t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now);
        t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now);
        assert!(t.confirmed_views().is_empty());
        t.update(&[det(10.0, 10.0, 50.0, 50.0)], FRAME, now);
        assert_eq!(t.confirmed_views().len(), 1);
    }
}
