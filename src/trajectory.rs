// src/trajectory.rs
//
// Per-track position history and the store that owns every trajectory.
// The tracker pushes matched positions here; speed and wrong-way rules
// read back. Histories outlive their tracks until the staleness sweep
// or the LRU cap removes them.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::types::TrajectoryConfig;

/// How many recent samples feed the direction vector.
const DIRECTION_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrajectoryPoint {
    pub x: f32,
    pub y: f32,
    pub timestamp: f64,
    pub frame_id: u64,
}

/// Time-ordered position history for one track, capped in length.
/// Derived metrics are maintained incrementally on append/evict.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub track_id: u64,
    points: VecDeque<TrajectoryPoint>,
    #[serde(skip)]
    max_points: usize,
    pub created_at: f64,
    pub last_updated: f64,
    /// Pixels traveled along the retained path.
    pub total_distance: f32,
    /// Pixels per second over the retained window.
    pub avg_speed: f32,
    /// Unit vector from the oldest to newest of the recent samples.
    pub direction: (f32, f32),
}

impl Trajectory {
    fn new(track_id: u64, max_points: usize, timestamp: f64) -> Self {
        Self {
            track_id,
            points: VecDeque::with_capacity(max_points.min(128)),
            max_points,
            created_at: timestamp,
            last_updated: timestamp,
            total_distance: 0.0,
            avg_speed: 0.0,
            direction: (0.0, 0.0),
        }
    }

    /// Appends a sample. Out-of-order timestamps violate the ordering
    /// invariant and are discarded; returns whether the point was kept.
    pub fn add_point(&mut self, x: f32, y: f32, timestamp: f64, frame_id: u64) -> bool {
        if let Some(last) = self.points.back() {
            if timestamp <= last.timestamp {
                debug!(
                    track_id = self.track_id,
                    timestamp, "dropping out-of-order trajectory sample"
                );
                return false;
            }
            let dx = x - last.x;
            let dy = y - last.y;
            self.total_distance += (dx * dx + dy * dy).sqrt();
        }

        self.points.push_back(TrajectoryPoint {
            x,
            y,
            timestamp,
            frame_id,
        });
        self.last_updated = timestamp;

        while self.points.len() > self.max_points {
            if self.points.len() >= 2 {
                let first = self.points[0];
                let second = self.points[1];
                let dx = second.x - first.x;
                let dy = second.y - first.y;
                self.total_distance = (self.total_distance - (dx * dx + dy * dy).sqrt()).max(0.0);
            }
            self.points.pop_front();
        }

        self.update_metrics();
        true
    }

    fn update_metrics(&mut self) {
        if self.points.len() < 2 {
            self.avg_speed = 0.0;
            self.direction = (0.0, 0.0);
            return;
        }

        let first = self.points.front().expect("len checked");
        let last = self.points.back().expect("len checked");
        let elapsed = last.timestamp - first.timestamp;
        if elapsed > 0.0 {
            self.avg_speed = self.total_distance / elapsed as f32;
        }

        // Direction over the recent tail only, so old motion does not
        // mask a turn.
        let window = self.points.len().min(DIRECTION_WINDOW);
        let start = &self.points[self.points.len() - window];
        let dx = last.x - start.x;
        let dy = last.y - start.y;
        let length = (dx * dx + dy * dy).sqrt();
        if length > 0.0 {
            self.direction = (dx / length, dy / length);
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &TrajectoryPoint> {
        self.points.iter()
    }

    pub fn first(&self) -> Option<&TrajectoryPoint> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.back()
    }

    pub fn duration(&self) -> f64 {
        match (self.points.front(), self.points.back()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    /// Pixel-space extent of the whole history.
    pub fn bounding_box(&self) -> Option<(f32, f32, f32, f32)> {
        if self.points.is_empty() {
            return None;
        }
        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for p in &self.points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some((min_x, min_y, max_x, max_y))
    }

    /// Centered moving average over the raw history. The raw samples are
    /// left untouched.
    pub fn smoothed(&self, window: usize) -> Vec<(f32, f32)> {
        if self.points.len() < window || window < 2 {
            return self.points.iter().map(|p| (p.x, p.y)).collect();
        }

        let half = window / 2;
        (0..self.points.len())
            .map(|i| {
                let start = i.saturating_sub(half);
                let end = (i + half + 1).min(self.points.len());
                let span = (end - start) as f32;
                let (sx, sy) = self
                    .points
                    .range(start..end)
                    .fold((0.0f32, 0.0f32), |(ax, ay), p| (ax + p.x, ay + p.y));
                (sx / span, sy / span)
            })
            .collect()
    }

    /// Linear extrapolation `dt` seconds ahead of the newest sample.
    /// A hint only; violation rules never consume predicted positions
    /// as ground truth.
    pub fn predict(&self, dt: f64) -> Option<(f32, f32)> {
        let last = self.points.back()?;
        if self.points.len() < 2 {
            return Some((last.x, last.y));
        }
        let vx = self.direction.0 * self.avg_speed;
        let vy = self.direction.1 * self.avg_speed;
        Some((last.x + vx * dt as f32, last.y + vy * dt as f32))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryStats {
    pub total: usize,
    /// Updated within the last 30 seconds of the reference timestamp.
    pub active: usize,
    pub avg_len: f32,
    pub avg_duration_s: f64,
    pub total_distance_px: f32,
}

/// Owns every trajectory, keyed by track id. Bounded two ways: an LRU
/// cap on the concurrent count, and a staleness sweep the manager runs
/// inline each frame.
#[derive(Debug)]
pub struct TrajectoryStore {
    config: TrajectoryConfig,
    trajectories: HashMap<u64, Trajectory>,
}

impl TrajectoryStore {
    pub fn new(config: TrajectoryConfig) -> Self {
        Self {
            config,
            trajectories: HashMap::new(),
        }
    }

    pub fn add_point(&mut self, track_id: u64, x: f32, y: f32, timestamp: f64, frame_id: u64) {
        if !self.trajectories.contains_key(&track_id) {
            self.evict_to_cap();
            self.trajectories.insert(
                track_id,
                Trajectory::new(track_id, self.config.max_points, timestamp),
            );
            debug!(track_id, "created trajectory");
        }
        if let Some(trajectory) = self.trajectories.get_mut(&track_id) {
            trajectory.add_point(x, y, timestamp, frame_id);
        }
    }

    /// Makes room for one more trajectory by dropping the
    /// least-recently-updated entries. Ties break on the lowest id.
    fn evict_to_cap(&mut self) {
        while self.trajectories.len() >= self.config.max_trajectories {
            let victim = self
                .trajectories
                .values()
                .min_by(|a, b| {
                    a.last_updated
                        .partial_cmp(&b.last_updated)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.track_id.cmp(&b.track_id))
                })
                .map(|t| t.track_id);
            match victim {
                Some(track_id) => {
                    self.trajectories.remove(&track_id);
                    debug!(track_id, "evicted least-recently-updated trajectory");
                }
                None => break,
            }
        }
    }

    pub fn get(&self, track_id: u64) -> Option<&Trajectory> {
        self.trajectories.get(&track_id)
    }

    pub fn smoothed(&self, track_id: u64) -> Option<Vec<(f32, f32)>> {
        self.trajectories
            .get(&track_id)
            .map(|t| t.smoothed(self.config.smoothing_window))
    }

    pub fn predict(&self, track_id: u64, dt: f64) -> Option<(f32, f32)> {
        self.trajectories.get(&track_id).and_then(|t| t.predict(dt))
    }

    pub fn remove(&mut self, track_id: u64) -> bool {
        self.trajectories.remove(&track_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn track_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.trajectories.keys().copied()
    }

    /// Removes trajectories idle beyond the staleness horizon. Keyed on
    /// frame timestamps so replays stay deterministic.
    pub fn sweep_stale(&mut self, now: f64) -> usize {
        let horizon = self.config.stale_after_s;
        let before = self.trajectories.len();
        self.trajectories
            .retain(|_, t| now - t.last_updated <= horizon);
        let removed = before - self.trajectories.len();
        if removed > 0 {
            info!(removed, "swept stale trajectories");
        }
        removed
    }

    pub fn statistics(&self, now: f64) -> TrajectoryStats {
        if self.trajectories.is_empty() {
            return TrajectoryStats {
                total: 0,
                active: 0,
                avg_len: 0.0,
                avg_duration_s: 0.0,
                total_distance_px: 0.0,
            };
        }

        let total = self.trajectories.len();
        let mut active = 0;
        let mut points = 0usize;
        let mut duration = 0.0;
        let mut distance = 0.0f32;
        for t in self.trajectories.values() {
            if now - t.last_updated <= 30.0 {
                active += 1;
            }
            points += t.len();
            duration += t.duration();
            distance += t.total_distance;
        }

        TrajectoryStats {
            total,
            active,
            avg_len: points as f32 / total as f32,
            avg_duration_s: duration / total as f64,
            total_distance_px: distance,
        }
    }

    /// Tracks whose history passes through the given pixel rectangle.
    pub fn tracks_through_region(&self, rect: (f32, f32, f32, f32)) -> Vec<u64> {
        let (min_x, min_y, max_x, max_y) = rect;
        let mut ids: Vec<u64> = self
            .trajectories
            .values()
            .filter(|t| {
                t.points()
                    .any(|p| p.x >= min_x && p.x <= max_x && p.y >= min_y && p.y <= max_y)
            })
            .map(|t| t.track_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// JSON export of selected (or all) trajectories for downstream
    /// persistence.
    pub fn export_json(&self, track_ids: Option<&[u64]>) -> serde_json::Value {
        let mut entries: Vec<&Trajectory> = match track_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.trajectories.get(id))
                .collect(),
            None => self.trajectories.values().collect(),
        };
        entries.sort_by_key(|t| t.track_id);
        serde_json::json!({ "trajectories": entries })
    }

    pub fn clear(&mut self) {
        self.trajectories.clear();
        info!("all trajectories cleared");
    }
}
