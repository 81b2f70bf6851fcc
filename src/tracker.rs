// src/tracker.rs
//
// Frame-to-frame association of detections to persistent tracks.
// Greedy minimum-cost nearest-neighbor with a distance gate; ids are
// allocated from a monotonic counter and never reused.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::trajectory::TrajectoryStore;
use crate::types::{Detection, Frame, TrackedVehicle, TrackerConfig};

#[derive(Debug)]
struct TrackState {
    vehicle: TrackedVehicle,
    missed_frames: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub frames_processed: u64,
    pub active_tracks: usize,
    pub tracks_created: u64,
}

pub struct VehicleTracker {
    config: TrackerConfig,
    tracks: HashMap<u64, TrackState>,
    next_track_id: u64,
    frames_processed: u64,
    tracks_created: u64,
}

impl VehicleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        info!(
            gate_px = config.max_match_distance_px,
            max_disappeared = config.max_disappeared_frames,
            "vehicle tracker initialized"
        );
        Self {
            config,
            tracks: HashMap::new(),
            next_track_id: 1,
            frames_processed: 0,
            tracks_created: 0,
        }
    }

    /// Associates one frame's detections with the live tracks, spawns
    /// tracks for the leftovers, ages out the unmatched, and pushes each
    /// matched position into the trajectory store. Returns the vehicles
    /// observed this frame, ordered by track id.
    ///
    /// A frame with zero detections just ages every track by one step.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame: &Frame,
        store: &mut TrajectoryStore,
    ) -> Vec<TrackedVehicle> {
        self.frames_processed += 1;
        let timestamp = frame.timestamp;
        let frame_id = frame.frame_id;

        let assignments = self.assign(detections, store, timestamp);

        let mut matched_tracks: HashSet<u64> = HashSet::new();
        let mut matched_detections: HashSet<usize> = HashSet::new();
        let mut observed: Vec<u64> = Vec::with_capacity(detections.len());

        for (track_id, det_idx) in assignments {
            let detection = &detections[det_idx];
            let center = detection.bbox.center();
            let state = self.tracks.get_mut(&track_id).expect("assigned track");
            state.vehicle.bbox = detection.bbox;
            state.vehicle.class = detection.class;
            state.vehicle.confidence = detection.confidence;
            state.vehicle.center = center;
            state.vehicle.last_seen = timestamp;
            state.vehicle.frame_count += 1;
            state.missed_frames = 0;
            store.add_point(track_id, center.0, center.1, timestamp, frame_id);
            matched_tracks.insert(track_id);
            matched_detections.insert(det_idx);
            observed.push(track_id);
        }

        // Leftover detections become fresh tracks
        for (det_idx, detection) in detections.iter().enumerate() {
            if matched_detections.contains(&det_idx) {
                continue;
            }
            let track_id = self.spawn_track(detection, timestamp);
            let center = detection.bbox.center();
            store.add_point(track_id, center.0, center.1, timestamp, frame_id);
            matched_tracks.insert(track_id);
            observed.push(track_id);
        }

        // Age out everything unmatched; trajectories stay in the store
        // until the staleness sweep gets to them.
        let max_disappeared = self.config.max_disappeared_frames;
        self.tracks.retain(|track_id, state| {
            if matched_tracks.contains(track_id) {
                return true;
            }
            state.missed_frames += 1;
            let keep = state.missed_frames <= max_disappeared;
            if !keep {
                debug!(
                    track_id,
                    missed = state.missed_frames,
                    "dropping disappeared track"
                );
            }
            keep
        });

        observed.sort_unstable();
        observed
            .iter()
            .map(|id| self.tracks[id].vehicle.clone())
            .collect()
    }

    /// Greedy assignment over all gated (track, detection) pairs, cheapest
    /// first. Equal costs resolve to the lowest track id, then the lowest
    /// detection index, so ambiguity is never left to hash order.
    fn assign(
        &self,
        detections: &[Detection],
        store: &TrajectoryStore,
        timestamp: f64,
    ) -> Vec<(u64, usize)> {
        let mut candidates: Vec<(f32, u64, usize)> = Vec::new();
        for state in self.tracks.values() {
            let track_id = state.vehicle.track_id;
            let dt = timestamp - state.vehicle.last_seen;
            let predicted = store.predict(track_id, dt);
            for (det_idx, detection) in detections.iter().enumerate() {
                let center = detection.bbox.center();
                let mut dist = euclidean(state.vehicle.center, center);
                if let Some(p) = predicted {
                    dist = dist.min(euclidean(p, center));
                }
                if dist <= self.config.max_match_distance_px {
                    candidates.push((dist, track_id, det_idx));
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut used_tracks: HashSet<u64> = HashSet::new();
        let mut used_detections: HashSet<usize> = HashSet::new();
        let mut assignments = Vec::new();
        for (_, track_id, det_idx) in candidates {
            if used_tracks.contains(&track_id) || used_detections.contains(&det_idx) {
                continue;
            }
            used_tracks.insert(track_id);
            used_detections.insert(det_idx);
            assignments.push((track_id, det_idx));
        }
        assignments
    }

    fn spawn_track(&mut self, detection: &Detection, timestamp: f64) -> u64 {
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks_created += 1;

        let center = detection.bbox.center();
        self.tracks.insert(
            track_id,
            TrackState {
                vehicle: TrackedVehicle {
                    track_id,
                    bbox: detection.bbox,
                    class: detection.class,
                    confidence: detection.confidence,
                    center,
                    first_seen: timestamp,
                    last_seen: timestamp,
                    frame_count: 1,
                },
                missed_frames: 0,
            },
        );
        debug!(track_id, class = detection.class.as_str(), "new track");
        track_id
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn get(&self, track_id: u64) -> Option<&TrackedVehicle> {
        self.tracks.get(&track_id).map(|s| &s.vehicle)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            frames_processed: self.frames_processed,
            active_tracks: self.tracks.len(),
            tracks_created: self.tracks_created,
        }
    }

    /// Drops all tracks. The id counter is not reset: ids stay unique
    /// for the lifetime of the tracker.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.frames_processed = 0;
        info!("vehicle tracker reset");
    }
}

fn euclidean(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, TrajectoryConfig, VehicleClass};
    use ndarray::Array2;

    fn make_frame(timestamp: f64, frame_id: u64) -> Frame {
        Frame::new(Array2::zeros((4, 4)), timestamp, frame_id)
    }

    fn make_detection(cx: f32, cy: f32) -> Detection {
        Detection::new(
            BoundingBox::new(cx - 20.0, cy - 15.0, cx + 20.0, cy + 15.0),
            VehicleClass::Car,
            0.9,
        )
    }

    fn make_tracker() -> (VehicleTracker, TrajectoryStore) {
        (
            VehicleTracker::new(TrackerConfig::default()),
            TrajectoryStore::new(TrajectoryConfig::default()),
        )
    }

    // ---- Association tests ----

    #[test]
    fn test_track_persists_across_frames() {
        let (mut tracker, mut store) = make_tracker();

        let first = tracker.update(&[make_detection(100.0, 100.0)], &make_frame(0.0, 0), &mut store);
        let second = tracker.update(
            &[make_detection(110.0, 102.0)],
            &make_frame(0.033, 1),
            &mut store,
        );

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].track_id, second[0].track_id);
        assert_eq!(second[0].frame_count, 2);
        assert_eq!(store.get(second[0].track_id).unwrap().len(), 2);
    }

    #[test]
    fn test_detection_beyond_gate_spawns_new_track() {
        let (mut tracker, mut store) = make_tracker();

        tracker.update(&[make_detection(100.0, 100.0)], &make_frame(0.0, 0), &mut store);
        let vehicles = tracker.update(
            &[make_detection(400.0, 400.0)],
            &make_frame(0.033, 1),
            &mut store,
        );

        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].track_id, 2);
        assert_eq!(tracker.active_count(), 2);
    }

    #[test]
    fn test_equidistant_ambiguity_resolves_to_lowest_track_id() {
        let (mut tracker, mut store) = make_tracker();

        // Two tracks at x=100 and x=140
        tracker.update(
            &[make_detection(100.0, 100.0), make_detection(140.0, 100.0)],
            &make_frame(0.0, 0),
            &mut store,
        );
        // One detection exactly between them
        let vehicles = tracker.update(
            &[make_detection(120.0, 100.0)],
            &make_frame(0.033, 1),
            &mut store,
        );

        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].track_id, 1);
    }

    #[test]
    fn test_empty_frame_ages_tracks_without_error() {
        let config = TrackerConfig {
            max_disappeared_frames: 2,
            ..TrackerConfig::default()
        };
        let mut tracker = VehicleTracker::new(config);
        let mut store = TrajectoryStore::new(TrajectoryConfig::default());

        tracker.update(&[make_detection(100.0, 100.0)], &make_frame(0.0, 0), &mut store);
        tracker.update(&[], &make_frame(0.1, 1), &mut store);
        tracker.update(&[], &make_frame(0.2, 2), &mut store);
        assert_eq!(tracker.active_count(), 1);

        // Third empty frame exceeds max_disappeared_frames
        tracker.update(&[], &make_frame(0.3, 3), &mut store);
        assert_eq!(tracker.active_count(), 0);
        // The trajectory outlives the track
        assert!(store.get(1).is_some());
    }

    #[test]
    fn test_track_ids_never_reused() {
        let config = TrackerConfig {
            max_disappeared_frames: 0,
            ..TrackerConfig::default()
        };
        let mut tracker = VehicleTracker::new(config);
        let mut store = TrajectoryStore::new(TrajectoryConfig::default());

        let mut seen = std::collections::HashSet::new();
        let mut t = 0.0;
        for i in 0..10 {
            // Alternate between a detection and an empty frame so every
            // track dies and the next spawn must allocate a fresh id.
            let detections = if i % 2 == 0 {
                vec![make_detection(500.0, 500.0)]
            } else {
                vec![]
            };
            let vehicles = tracker.update(&detections, &make_frame(t, i), &mut store);
            for v in &vehicles {
                assert!(seen.insert(v.track_id), "track id {} reused", v.track_id);
            }
            t += 1.0;
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_matched_position_lands_in_store() {
        let (mut tracker, mut store) = make_tracker();

        tracker.update(&[make_detection(100.0, 200.0)], &make_frame(0.0, 0), &mut store);
        let trajectory = store.get(1).unwrap();
        let point = trajectory.last().unwrap();
        assert_eq!((point.x, point.y), (100.0, 200.0));
        assert_eq!(point.frame_id, 0);
    }
}
