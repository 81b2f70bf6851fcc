// src/manager.rs
//
// Per-stream orchestrator. One manager owns one stream's tracker,
// trajectory store, speed calculator, lane detector and rule engine;
// the camera calibrator is shared read-only across streams watching the
// same camera. Frame processing is strictly sequential: association and
// trajectory updates are order-dependent, so nothing here parallelizes
// within a stream.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info};

use crate::calibration::CameraCalibrator;
use crate::lanes::LaneDetector;
use crate::speed::{SpeedCalculator, SpeedMeasurement};
use crate::tracker::VehicleTracker;
use crate::trajectory::TrajectoryStore;
use crate::types::{
    Config, Detection, Frame, TrackedVehicle, TrafficViolation, ViolationSeverity, ViolationType,
};
use crate::violations::ViolationDetector;

/// Aggregated counts over a closed time window.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationReport {
    pub report_id: String,
    pub generated_at: f64,
    pub window: (f64, f64),
    pub total_violations: usize,
    pub by_type: HashMap<ViolationType, usize>,
    pub by_severity: HashMap<ViolationSeverity, usize>,
    /// Counts keyed by UTC hour of day.
    pub by_hour: HashMap<u32, usize>,
    pub top_zones: Vec<(String, usize)>,
    /// Tracks with more than one violation in the window.
    pub repeat_offenders: Vec<(u64, usize)>,
    pub false_positive_rate: f64,
    pub frames_processed: u64,
}

/// Live counters since the last housekeeping horizon.
#[derive(Debug, Clone, Serialize)]
pub struct RollingStats {
    /// (track, type) pairs currently inside a cooldown window.
    pub open_violations: usize,
    /// Violations in the last hour.
    pub hourly_rate: usize,
    /// Violations in the last 24 hours.
    pub daily_total: usize,
    pub by_type: HashMap<ViolationType, usize>,
    pub by_severity: HashMap<ViolationSeverity, usize>,
    pub mean_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub calibrated: bool,
    pub calibration_error_m: Option<f64>,
    pub zones: usize,
    pub active_tracks: usize,
    pub stored_trajectories: usize,
    pub frames_processed: u64,
    pub detections_seen: u64,
    pub violations_detected: u64,
    pub last_frame_timestamp: Option<f64>,
}

pub struct ViolationManager {
    config: Config,
    calibrator: Arc<CameraCalibrator>,
    tracker: VehicleTracker,
    store: TrajectoryStore,
    speed: SpeedCalculator,
    lanes: LaneDetector,
    detector: ViolationDetector,
    frames_processed: u64,
    detections_seen: u64,
    violations_detected: u64,
    last_frame_timestamp: Option<f64>,
}

impl ViolationManager {
    /// Builds the full per-stream pipeline. The calibrator must be fully
    /// configured before the first frame; it is read-only from here on.
    pub fn new(config: Config, calibrator: Arc<CameraCalibrator>) -> Self {
        let manager = Self {
            tracker: VehicleTracker::new(config.tracker.clone()),
            store: TrajectoryStore::new(config.trajectory.clone()),
            speed: SpeedCalculator::new(config.speed.clone(), Arc::clone(&calibrator)),
            lanes: LaneDetector::new(config.lanes.clone()),
            detector: ViolationDetector::new(config.violations.clone(), Arc::clone(&calibrator)),
            calibrator,
            config,
            frames_processed: 0,
            detections_seen: 0,
            violations_detected: 0,
            last_frame_timestamp: None,
        };
        info!(
            calibrated = manager.calibrator.is_calibrated(),
            "violation manager ready"
        );
        manager
    }

    /// Runs one frame through the whole pipeline and returns its
    /// violations. `external_speed` lets a caller merge measurements
    /// produced outside this stream (e.g. a radar feed) into the rule
    /// evaluation.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        external_speed: Option<&[SpeedMeasurement]>,
    ) -> Vec<TrafficViolation> {
        let now = frame.timestamp;
        self.frames_processed += 1;
        self.detections_seen += detections.len() as u64;
        self.last_frame_timestamp = Some(now);

        // Housekeeping runs inline: it only removes entries, so it needs
        // no ordering against the live reads below.
        self.store.sweep_stale(now);
        self.detector.sweep_cooldowns(now);
        self.detector.cleanup_log(now);
        self.speed.prune(now);

        let vehicles = self.tracker.update(detections, frame, &mut self.store);
        self.lanes.detect_lanes(frame);

        let mut violations: Vec<TrafficViolation> = Vec::new();

        for vehicle in &vehicles {
            if let Some(trajectory) = self.store.get(vehicle.track_id) {
                if let Some(measurement) = self.speed.compute_speed(trajectory) {
                    if let Some(v) = self.detector.evaluate_speed(&measurement, vehicle) {
                        violations.push(v);
                    }
                }
            }

            if let Some(candidate) = self.lanes.check_violation(&vehicle.bbox) {
                if let Some(v) = self.detector.evaluate_lane(&candidate, vehicle, now) {
                    violations.push(v);
                }
            }

            if let Some(trajectory) = self.store.get(vehicle.track_id) {
                if let Some(v) = self.detector.evaluate_wrong_way(vehicle, trajectory, now) {
                    violations.push(v);
                }
            }
        }

        violations.extend(self.detector.evaluate_following(&vehicles, now));

        if let Some(external) = external_speed {
            for measurement in external {
                if let Some(vehicle) = self.find_vehicle(&vehicles, measurement.track_id) {
                    if let Some(v) = self.detector.evaluate_speed(measurement, vehicle) {
                        violations.push(v);
                    }
                }
            }
        }

        self.violations_detected += violations.len() as u64;

        debug!(
            frame_id = frame.frame_id,
            vehicles = vehicles.len(),
            violations = violations.len(),
            "frame processed"
        );
        violations
    }

    fn find_vehicle<'a>(
        &self,
        vehicles: &'a [TrackedVehicle],
        track_id: u64,
    ) -> Option<&'a TrackedVehicle> {
        vehicles.iter().find(|v| v.track_id == track_id)
    }

    /// Aggregates the retained violation log over a time window.
    /// Read-only and side-effect free.
    pub fn generate_report(&self, start: f64, end: f64) -> ViolationReport {
        let window: Vec<&TrafficViolation> = self
            .detector
            .violations_between(start, end)
            .into_iter()
            .filter(|v| !self.detector.is_false_positive(&v.violation_id))
            .collect();

        let mut by_type: HashMap<ViolationType, usize> = HashMap::new();
        let mut by_severity: HashMap<ViolationSeverity, usize> = HashMap::new();
        let mut by_hour: HashMap<u32, usize> = HashMap::new();
        for v in &window {
            *by_type.entry(v.violation_type).or_insert(0) += 1;
            *by_severity.entry(v.severity).or_insert(0) += 1;
            if let Some(hour) = utc_hour(v.timestamp) {
                *by_hour.entry(hour).or_insert(0) += 1;
            }
        }

        let top_zones: Vec<(String, usize)> = window
            .iter()
            .filter_map(|v| v.zone_id.clone())
            .counts()
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .take(10)
            .collect();

        let repeat_offenders: Vec<(u64, usize)> = window
            .iter()
            .map(|v| v.track_id)
            .counts()
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .take(10)
            .collect();

        let total_in_window = self.detector.violations_between(start, end).len();
        let false_positives = total_in_window - window.len();

        ViolationReport {
            report_id: format!("report-{}-{}", (start * 1000.0) as i64, (end * 1000.0) as i64),
            generated_at: self.last_frame_timestamp.unwrap_or(end),
            window: (start, end),
            total_violations: window.len(),
            by_type,
            by_severity,
            by_hour,
            top_zones,
            repeat_offenders,
            false_positive_rate: false_positives as f64 / total_in_window.max(1) as f64,
            frames_processed: self.frames_processed,
        }
    }

    /// Rolling statistics relative to the latest processed frame.
    pub fn current_statistics(&self) -> RollingStats {
        let now = self.last_frame_timestamp.unwrap_or(0.0);
        let last_day: Vec<&TrafficViolation> = self.detector.violations_between(now - 86_400.0, now);

        let mut by_type: HashMap<ViolationType, usize> = HashMap::new();
        let mut by_severity: HashMap<ViolationSeverity, usize> = HashMap::new();
        let mut confidence_sum = 0.0f64;
        let mut hourly = 0usize;
        for v in &last_day {
            *by_type.entry(v.violation_type).or_insert(0) += 1;
            *by_severity.entry(v.severity).or_insert(0) += 1;
            confidence_sum += v.confidence as f64;
            if now - v.timestamp <= 3_600.0 {
                hourly += 1;
            }
        }

        RollingStats {
            open_violations: self.detector.open_violations(now),
            hourly_rate: hourly,
            daily_total: last_day.len(),
            by_type,
            by_severity,
            mean_confidence: confidence_sum / last_day.len().max(1) as f64,
        }
    }

    /// Component health snapshot. Read-only.
    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            calibrated: self.calibrator.is_calibrated(),
            calibration_error_m: self.calibrator.mean_error_m(),
            zones: self.calibrator.zones().len(),
            active_tracks: self.tracker.active_count(),
            stored_trajectories: self.store.len(),
            frames_processed: self.frames_processed,
            detections_seen: self.detections_seen,
            violations_detected: self.violations_detected,
            last_frame_timestamp: self.last_frame_timestamp,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &VehicleTracker {
        &self.tracker
    }

    pub fn trajectories(&self) -> &TrajectoryStore {
        &self.store
    }

    pub fn violations(&self) -> &ViolationDetector {
        &self.detector
    }

    pub fn speed(&self) -> &SpeedCalculator {
        &self.speed
    }

    pub fn lanes(&self) -> &LaneDetector {
        &self.lanes
    }
}

fn utc_hour(timestamp: f64) -> Option<u32> {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0).map(|dt| dt.hour())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationPoint, CalibrationZone, ZoneDirection};
    use crate::types::{BoundingBox, VehicleClass};
    use ndarray::Array2;

    /// 0.1 m/px flat calibration with one 60 km/h forward zone covering
    /// the whole 1000x1000 px view.
    fn make_calibrator() -> Arc<CameraCalibrator> {
        let mut calibrator = CameraCalibrator::default();
        for (pixel, world) in [
            ((0.0, 0.0), (0.0, 0.0)),
            ((1000.0, 0.0), (100.0, 0.0)),
            ((0.0, 1000.0), (0.0, 100.0)),
            ((1000.0, 1000.0), (100.0, 100.0)),
        ] {
            calibrator
                .add_point(CalibrationPoint::new(pixel, world))
                .unwrap();
        }
        calibrator
            .add_zone(CalibrationZone {
                zone_id: "main".to_string(),
                name: "Main".to_string(),
                pixel_polygon: vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
                world_polygon: vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)],
                speed_limit_kmh: 60.0,
                entry_line: ((0.0, 100.0), (1000.0, 100.0)),
                exit_line: ((0.0, 900.0), (1000.0, 900.0)),
                direction: ZoneDirection::Forward,
            })
            .unwrap();
        Arc::new(calibrator)
    }

    fn make_manager() -> ViolationManager {
        ViolationManager::new(Config::default(), make_calibrator())
    }

    fn make_frame(timestamp: f64, frame_id: u64) -> Frame {
        Frame::new(Array2::zeros((64, 64)), timestamp, frame_id)
    }

    fn make_detection(cx: f32, cy: f32) -> Detection {
        Detection::new(
            BoundingBox::new(cx - 20.0, cy - 15.0, cx + 20.0, cy + 15.0),
            VehicleClass::Car,
            0.9,
        )
    }

    /// Drives one vehicle down the zone fast enough to speed. ~26.4 m/s
    /// = 95 km/h at 0.1 m/px.
    fn drive_speeding_vehicle(manager: &mut ViolationManager, frames: u64, t0: f64) -> Vec<TrafficViolation> {
        let mut emitted = Vec::new();
        for i in 0..frames {
            let t = t0 + i as f64 * 0.1;
            let y = 100.0 + (t - t0) as f32 * 264.0;
            let detections = vec![make_detection(500.0, y)];
            emitted.extend(manager.process_frame(&make_frame(t, i), &detections, None));
        }
        emitted
    }

    #[test]
    fn test_speeding_vehicle_emits_exactly_one_violation() {
        let mut manager = make_manager();
        // 2 seconds of driving at ~95 km/h: plenty of frames over the
        // cooldown-free window, exactly one emission
        let violations = drive_speeding_vehicle(&mut manager, 21, 1_000.0);

        let speed: Vec<&TrafficViolation> = violations
            .iter()
            .filter(|v| v.violation_type == ViolationType::Speed)
            .collect();
        assert_eq!(speed.len(), 1);
        assert_eq!(speed[0].severity, ViolationSeverity::Moderate);
        assert_eq!(speed[0].zone_id.as_deref(), Some("main"));
    }

    #[test]
    fn test_slow_vehicle_emits_nothing() {
        let mut manager = make_manager();
        // ~36 km/h in a 60 zone
        for i in 0..30u64 {
            let t = 1_000.0 + i as f64 * 0.1;
            let y = 100.0 + i as f32 * 10.0;
            let violations =
                manager.process_frame(&make_frame(t, i), &[make_detection(500.0, y)], None);
            assert!(violations.is_empty());
        }
    }

    #[test]
    fn test_external_speed_measurements_are_merged() {
        let mut manager = make_manager();
        // A single stationary detection to register track 1
        manager.process_frame(&make_frame(1_000.0, 0), &[make_detection(500.0, 500.0)], None);

        let external = vec![SpeedMeasurement {
            track_id: 1,
            timestamp: 1_000.1,
            speed_kmh: 120.0,
            speed_mps: 120.0 / 3.6,
            distance_m: 33.0,
            elapsed_s: 1.0,
            zone_id: Some("main".to_string()),
            speed_limit_kmh: 60.0,
            confidence: 0.95,
            entry_world: (0.0, 0.0),
            exit_world: (0.0, 33.0),
            entry_time: 999.1,
            exit_time: 1_000.1,
        }];
        let violations = manager.process_frame(
            &make_frame(1_000.1, 1),
            &[make_detection(500.0, 500.0)],
            Some(&external),
        );

        let speed: Vec<_> = violations
            .iter()
            .filter(|v| v.violation_type == ViolationType::Speed)
            .collect();
        assert_eq!(speed.len(), 1);
        assert_eq!(speed[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn test_report_aggregates_by_type_and_offender() {
        let mut manager = make_manager();
        drive_speeding_vehicle(&mut manager, 21, 1_000.0);

        let report = manager.generate_report(999.0, 1_100.0);
        assert_eq!(report.total_violations, 1);
        assert_eq!(report.by_type.get(&ViolationType::Speed), Some(&1));
        assert_eq!(report.top_zones.first().unwrap().0, "main");
        // One violation: not a repeat offender
        assert!(report.repeat_offenders.is_empty());
        assert_eq!(report.false_positive_rate, 0.0);
    }

    #[test]
    fn test_system_status_reflects_pipeline() {
        let mut manager = make_manager();
        let status = manager.system_status();
        assert!(status.calibrated);
        assert_eq!(status.zones, 1);
        assert_eq!(status.frames_processed, 0);

        manager.process_frame(&make_frame(1_000.0, 0), &[make_detection(500.0, 500.0)], None);
        let status = manager.system_status();
        assert_eq!(status.frames_processed, 1);
        assert_eq!(status.active_tracks, 1);
        assert_eq!(status.stored_trajectories, 1);
        assert_eq!(status.last_frame_timestamp, Some(1_000.0));
    }

    #[test]
    fn test_rolling_stats_count_recent_violations() {
        let mut manager = make_manager();
        drive_speeding_vehicle(&mut manager, 21, 1_000.0);

        let stats = manager.current_statistics();
        assert_eq!(stats.daily_total, 1);
        assert_eq!(stats.hourly_rate, 1);
        assert_eq!(stats.open_violations, 1);
        assert!(stats.mean_confidence > 0.0);
    }

    #[test]
    fn test_empty_frames_are_not_errors() {
        let mut manager = make_manager();
        for i in 0..5u64 {
            let violations = manager.process_frame(&make_frame(1_000.0 + i as f64 * 0.1, i), &[], None);
            assert!(violations.is_empty());
        }
        assert_eq!(manager.system_status().frames_processed, 5);
    }
}
