// src/speed.rs
//
// Real-world speed from pixel trajectories. Combines trajectory samples
// with the camera calibration to measure distance over time in the
// ground plane; uncalibrated cameras and short tracks are steady "no
// result" states, never errors.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::calibration::CameraCalibrator;
use crate::trajectory::Trajectory;
use crate::types::SpeedConfig;

pub const KMH_PER_MPS: f64 = 3.6;
const MPH_PER_MPS: f64 = 1.0 / 0.44704;

/// Confidence baselines: measurements over shorter distance/time than
/// these are reported with proportionally reduced confidence.
const FULL_CONFIDENCE_DISTANCE_M: f64 = 10.0;
const FULL_CONFIDENCE_TIME_S: f64 = 2.0;
/// Heading changes sharper than this between segments count against the
/// trajectory's plausibility.
const DIRECTION_CHANGE_RAD: f64 = std::f64::consts::FRAC_PI_4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnit {
    Kmh,
    Mph,
    Mps,
}

pub fn convert_speed(value: f64, from: SpeedUnit, to: SpeedUnit) -> f64 {
    let mps = match from {
        SpeedUnit::Kmh => value / KMH_PER_MPS,
        SpeedUnit::Mph => value / MPH_PER_MPS,
        SpeedUnit::Mps => value,
    };
    match to {
        SpeedUnit::Kmh => mps * KMH_PER_MPS,
        SpeedUnit::Mph => mps * MPH_PER_MPS,
        SpeedUnit::Mps => mps,
    }
}

/// One speed measurement for one track.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedMeasurement {
    pub track_id: u64,
    pub timestamp: f64,
    pub speed_kmh: f64,
    pub speed_mps: f64,
    pub distance_m: f64,
    pub elapsed_s: f64,
    pub zone_id: Option<String>,
    pub speed_limit_kmh: f64,
    pub confidence: f64,
    pub entry_world: (f64, f64),
    pub exit_world: (f64, f64),
    pub entry_time: f64,
    pub exit_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeedStats {
    pub total_measurements: usize,
    pub tracks_measured: usize,
    pub mean_speed_kmh: f64,
    pub min_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub mean_confidence: f64,
}

pub struct SpeedCalculator {
    config: SpeedConfig,
    calibrator: Arc<CameraCalibrator>,
    measurements: HashMap<u64, Vec<SpeedMeasurement>>,
}

impl SpeedCalculator {
    pub fn new(config: SpeedConfig, calibrator: Arc<CameraCalibrator>) -> Self {
        Self {
            config,
            calibrator,
            measurements: HashMap::new(),
        }
    }

    /// Measures the track's speed over its two most temporally separated
    /// samples. `None` when the camera is uncalibrated, the track is too
    /// short, or the baseline is below the measurement minima.
    pub fn compute_speed(&mut self, trajectory: &Trajectory) -> Option<SpeedMeasurement> {
        if !self.calibrator.is_calibrated() {
            return None;
        }
        if trajectory.len() < self.config.min_tracking_frames {
            return None;
        }

        // Project the whole history; samples outside the homography's
        // reach are skipped.
        let world: Vec<((f64, f64), f64)> = trajectory
            .points()
            .filter_map(|p| {
                self.calibrator
                    .pixel_to_world(p.x as f64, p.y as f64)
                    .map(|w| (w, p.timestamp))
            })
            .collect();
        if world.len() < 2 {
            return None;
        }

        let (entry_world, entry_time) = world[0];
        let (exit_world, exit_time) = world[world.len() - 1];
        let distance_m = ((exit_world.0 - entry_world.0).powi(2)
            + (exit_world.1 - entry_world.1).powi(2))
        .sqrt();
        let elapsed_s = exit_time - entry_time;

        if distance_m < self.config.min_distance_m {
            debug!(
                track_id = trajectory.track_id,
                distance_m, "measurement baseline too short"
            );
            return None;
        }
        if elapsed_s < self.config.min_time_s {
            debug!(
                track_id = trajectory.track_id,
                elapsed_s, "measurement window too short"
            );
            return None;
        }

        let speed_mps = distance_m / elapsed_s;
        let speed_kmh = speed_mps * KMH_PER_MPS;

        // Zone lookup at the track's current position
        let last = trajectory.last()?;
        let zone = self.calibrator.zone_for(last.x as f64, last.y as f64);
        let (zone_id, speed_limit_kmh) = match zone {
            Some(z) => (Some(z.zone_id.clone()), z.speed_limit_kmh),
            None => (None, self.config.default_speed_limit_kmh),
        };

        let confidence = measurement_confidence(&world, distance_m, elapsed_s);

        let measurement = SpeedMeasurement {
            track_id: trajectory.track_id,
            timestamp: exit_time,
            speed_kmh,
            speed_mps,
            distance_m,
            elapsed_s,
            zone_id,
            speed_limit_kmh,
            confidence,
            entry_world,
            exit_world,
            entry_time,
            exit_time,
        };

        info!(
            track_id = trajectory.track_id,
            speed_kmh, confidence, "speed measured"
        );
        self.measurements
            .entry(trajectory.track_id)
            .or_default()
            .push(measurement.clone());
        Some(measurement)
    }

    /// Instantaneous km/h over a sliding window of samples.
    pub fn instantaneous_speeds(&self, trajectory: &Trajectory, window: usize) -> Vec<f64> {
        if !self.calibrator.is_calibrated() || window < 2 || trajectory.len() < window {
            return Vec::new();
        }

        let points: Vec<_> = trajectory.points().collect();
        (0..=points.len() - window)
            .map(|i| {
                let first = points[i];
                let last = points[i + window - 1];
                let elapsed = last.timestamp - first.timestamp;
                if elapsed <= 0.0 {
                    return 0.0;
                }
                match self
                    .calibrator
                    .distance_m((first.x as f64, first.y as f64), (last.x as f64, last.y as f64))
                {
                    Some(d) => d / elapsed * KMH_PER_MPS,
                    None => 0.0,
                }
            })
            .collect()
    }

    /// Confidence-weighted mean over the track's recent measurements.
    pub fn smoothed_speed(&self, track_id: u64) -> Option<f64> {
        let history = self.measurements.get(&track_id)?;
        if history.is_empty() {
            return None;
        }

        let start = history.len().saturating_sub(self.config.smoothing_window);
        let recent = &history[start..];
        let total_weight: f64 = recent.iter().map(|m| m.confidence).sum();
        if total_weight > 0.0 {
            let weighted: f64 = recent.iter().map(|m| m.speed_kmh * m.confidence).sum();
            Some(weighted / total_weight)
        } else {
            recent.last().map(|m| m.speed_kmh)
        }
    }

    pub fn measurements_for(&self, track_id: u64) -> Option<&[SpeedMeasurement]> {
        self.measurements.get(&track_id).map(|v| v.as_slice())
    }

    /// Drops measurements older than the configured horizon.
    pub fn prune(&mut self, now: f64) -> usize {
        let horizon = self.config.measurement_max_age_s;
        let mut removed = 0;
        self.measurements.retain(|_, history| {
            let before = history.len();
            history.retain(|m| now - m.timestamp <= horizon);
            removed += before - history.len();
            !history.is_empty()
        });
        if removed > 0 {
            debug!(removed, "pruned aged speed measurements");
        }
        removed
    }

    pub fn stats(&self) -> SpeedStats {
        let all: Vec<&SpeedMeasurement> = self.measurements.values().flatten().collect();
        if all.is_empty() {
            return SpeedStats {
                total_measurements: 0,
                tracks_measured: 0,
                mean_speed_kmh: 0.0,
                min_speed_kmh: 0.0,
                max_speed_kmh: 0.0,
                mean_confidence: 0.0,
            };
        }

        let n = all.len() as f64;
        SpeedStats {
            total_measurements: all.len(),
            tracks_measured: self.measurements.len(),
            mean_speed_kmh: all.iter().map(|m| m.speed_kmh).sum::<f64>() / n,
            min_speed_kmh: all.iter().map(|m| m.speed_kmh).fold(f64::MAX, f64::min),
            max_speed_kmh: all.iter().map(|m| m.speed_kmh).fold(f64::MIN, f64::max),
            mean_confidence: all.iter().map(|m| m.confidence).sum::<f64>() / n,
        }
    }
}

/// Starts at 1.0 and is degraded by short baselines and by erratic
/// heading changes along the world-space path.
fn measurement_confidence(
    world: &[((f64, f64), f64)],
    distance_m: f64,
    elapsed_s: f64,
) -> f64 {
    let mut confidence = 1.0;

    if distance_m < FULL_CONFIDENCE_DISTANCE_M {
        confidence *= distance_m / FULL_CONFIDENCE_DISTANCE_M;
    }
    if elapsed_s < FULL_CONFIDENCE_TIME_S {
        confidence *= elapsed_s / FULL_CONFIDENCE_TIME_S;
    }

    if world.len() > 2 {
        let mut direction_changes = 0usize;
        let mut prev_heading: Option<f64> = None;
        for pair in world.windows(2) {
            let dx = pair[1].0 .0 - pair[0].0 .0;
            let dy = pair[1].0 .1 - pair[0].0 .1;
            if dx.abs() <= 0.1 && dy.abs() <= 0.1 {
                continue; // jitter below measurement noise
            }
            let heading = dy.atan2(dx);
            if let Some(prev) = prev_heading {
                let mut diff = (heading - prev).abs();
                if diff > std::f64::consts::PI {
                    diff = 2.0 * std::f64::consts::PI - diff;
                }
                if diff > DIRECTION_CHANGE_RAD {
                    direction_changes += 1;
                }
            }
            prev_heading = Some(heading);
        }

        let change_ratio = direction_changes as f64 / world.len() as f64;
        if change_ratio > 0.2 {
            confidence *= 1.0 - change_ratio;
        }
    }

    confidence.clamp(0.0, 1.0)
}
