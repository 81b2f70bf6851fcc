// src/violations.rs
//
// Stateful rule engine. Every (track, violation type) pair walks
// idle → triggered → cooldown → idle; the cooldown map is the only
// suppression state, keyed on the composite pair with the trigger
// timestamp, checked and updated inside the single-threaded per-stream
// loop. One continuous infraction emits once per cooldown window.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::calibration::CameraCalibrator;
use crate::lanes::LaneViolationCandidate;
use crate::speed::SpeedMeasurement;
use crate::trajectory::Trajectory;
use crate::types::{
    TrackedVehicle, TrafficViolation, ViolationConfig, ViolationDetails, ViolationSeverity,
    ViolationType,
};

#[derive(Debug, Clone, Serialize)]
pub struct ViolationStats {
    pub total: u64,
    pub by_type: HashMap<ViolationType, u64>,
    pub by_severity: HashMap<ViolationSeverity, u64>,
    pub false_positives: usize,
    pub false_positive_rate: f64,
    pub active_cooldowns: usize,
}

pub struct ViolationDetector {
    config: ViolationConfig,
    calibrator: Arc<CameraCalibrator>,
    /// (track, type) → trigger timestamp. Present and fresh = cooldown.
    cooldowns: HashMap<(u64, ViolationType), f64>,
    log: Vec<TrafficViolation>,
    false_positive_ids: HashSet<String>,
    total_emitted: u64,
    by_type: HashMap<ViolationType, u64>,
    by_severity: HashMap<ViolationSeverity, u64>,
}

impl ViolationDetector {
    pub fn new(config: ViolationConfig, calibrator: Arc<CameraCalibrator>) -> Self {
        Self {
            config,
            calibrator,
            cooldowns: HashMap::new(),
            log: Vec::new(),
            false_positive_ids: HashSet::new(),
            total_emitted: 0,
            by_type: HashMap::new(),
            by_severity: HashMap::new(),
        }
    }

    fn cooldown_period(&self, violation_type: ViolationType) -> f64 {
        match violation_type {
            ViolationType::Speed => self.config.cooldown_speed_s,
            ViolationType::LaneInvasion => self.config.cooldown_lane_s,
            ViolationType::WrongWay => self.config.cooldown_wrong_way_s,
            ViolationType::FollowingDistance => self.config.cooldown_following_s,
        }
    }

    fn in_cooldown(&self, track_id: u64, violation_type: ViolationType, now: f64) -> bool {
        match self.cooldowns.get(&(track_id, violation_type)) {
            Some(triggered_at) => now - triggered_at < self.cooldown_period(violation_type),
            None => false,
        }
    }

    fn emit(&mut self, violation: TrafficViolation) -> TrafficViolation {
        self.cooldowns.insert(
            (violation.track_id, violation.violation_type),
            violation.timestamp,
        );
        self.total_emitted += 1;
        *self.by_type.entry(violation.violation_type).or_insert(0) += 1;
        *self.by_severity.entry(violation.severity).or_insert(0) += 1;
        self.log.push(violation.clone());
        violation
    }

    // ---- rules ----

    /// Speeding: measurement above limit plus tolerance. Severity comes
    /// from the amount over the limit, first matching bucket from the
    /// top.
    pub fn evaluate_speed(
        &mut self,
        measurement: &SpeedMeasurement,
        vehicle: &TrackedVehicle,
    ) -> Option<TrafficViolation> {
        if measurement.confidence < self.config.min_speed_confidence {
            return None;
        }
        let over_limit = measurement.speed_kmh - measurement.speed_limit_kmh;
        if over_limit <= self.config.speed_tolerance_kmh {
            return None;
        }
        if self.in_cooldown(vehicle.track_id, ViolationType::Speed, measurement.timestamp) {
            return None;
        }

        let severity = self.speed_severity(over_limit);
        warn!(
            track_id = vehicle.track_id,
            speed_kmh = measurement.speed_kmh,
            limit_kmh = measurement.speed_limit_kmh,
            severity = severity.as_str(),
            "speed violation"
        );
        Some(self.emit(TrafficViolation {
            violation_id: TrafficViolation::make_id(
                ViolationType::Speed,
                vehicle.track_id,
                measurement.timestamp,
            ),
            violation_type: ViolationType::Speed,
            severity,
            track_id: vehicle.track_id,
            timestamp: measurement.timestamp,
            location: vehicle.center,
            zone_id: measurement.zone_id.clone(),
            confidence: measurement.confidence as f32,
            description: format!(
                "{:.1} km/h in a {:.0} km/h zone",
                measurement.speed_kmh, measurement.speed_limit_kmh
            ),
            details: ViolationDetails::Speed {
                measured_kmh: measurement.speed_kmh,
                limit_kmh: measurement.speed_limit_kmh,
                over_limit_kmh: over_limit,
            },
        }))
    }

    /// Lane invasion from a detector candidate; severity scales with how
    /// deep past the line the vehicle center sits.
    pub fn evaluate_lane(
        &mut self,
        candidate: &LaneViolationCandidate,
        vehicle: &TrackedVehicle,
        now: f64,
    ) -> Option<TrafficViolation> {
        if candidate.confidence < self.config.min_lane_confidence {
            return None;
        }
        if self.in_cooldown(vehicle.track_id, ViolationType::LaneInvasion, now) {
            return None;
        }

        let severity = self.lane_severity(candidate.penetration);
        info!(
            track_id = vehicle.track_id,
            subtype = candidate.subtype.as_str(),
            severity = severity.as_str(),
            "lane invasion"
        );
        Some(self.emit(TrafficViolation {
            violation_id: TrafficViolation::make_id(
                ViolationType::LaneInvasion,
                vehicle.track_id,
                now,
            ),
            violation_type: ViolationType::LaneInvasion,
            severity,
            track_id: vehicle.track_id,
            timestamp: now,
            location: vehicle.center,
            zone_id: self
                .calibrator
                .zone_for(vehicle.center.0 as f64, vehicle.center.1 as f64)
                .map(|z| z.zone_id.clone()),
            confidence: candidate.confidence,
            description: format!(
                "{} at {:.0}px from the line",
                candidate.subtype.as_str(),
                candidate.distance_px
            ),
            details: ViolationDetails::LaneInvasion {
                subtype: candidate.subtype,
                distance_px: candidate.distance_px,
            },
        }))
    }

    /// Wrong-way driving: the track's direction opposes the zone's
    /// expected direction beyond the tolerance angle. Always critical.
    pub fn evaluate_wrong_way(
        &mut self,
        vehicle: &TrackedVehicle,
        trajectory: &Trajectory,
        now: f64,
    ) -> Option<TrafficViolation> {
        if trajectory.len() < self.config.wrong_way_min_samples {
            return None;
        }
        let zone = self
            .calibrator
            .zone_for(vehicle.center.0 as f64, vehicle.center.1 as f64)?;
        let expected = zone.expected_direction()?;

        let direction = trajectory.direction;
        if direction == (0.0, 0.0) {
            return None;
        }
        let dot = direction.0 as f64 * expected.0 + direction.1 as f64 * expected.1;
        let angle_deg = dot.clamp(-1.0, 1.0).acos().to_degrees();
        if angle_deg <= self.config.wrong_way_tolerance_deg {
            return None;
        }
        if self.in_cooldown(vehicle.track_id, ViolationType::WrongWay, now) {
            return None;
        }

        warn!(
            track_id = vehicle.track_id,
            angle_deg,
            zone_id = zone.zone_id.as_str(),
            "wrong-way driving"
        );
        let zone_id = zone.zone_id.clone();
        Some(self.emit(TrafficViolation {
            violation_id: TrafficViolation::make_id(ViolationType::WrongWay, vehicle.track_id, now),
            violation_type: ViolationType::WrongWay,
            severity: ViolationSeverity::Critical,
            track_id: vehicle.track_id,
            timestamp: now,
            location: vehicle.center,
            zone_id: Some(zone_id),
            confidence: 0.9,
            description: format!("opposing zone direction by {angle_deg:.0}\u{b0}"),
            details: ViolationDetails::WrongWay { angle_deg },
        }))
    }

    /// Unsafe following distance between image-plane leader/follower
    /// pairs sharing a lane. The gap is measured on the ground plane
    /// when calibrated; otherwise a configured pixel factor approximates
    /// it.
    pub fn evaluate_following(
        &mut self,
        vehicles: &[TrackedVehicle],
        now: f64,
    ) -> Vec<TrafficViolation> {
        let mut ordered: Vec<&TrackedVehicle> = vehicles.iter().collect();
        // Bottom of the image first: the follower sits below its leader
        ordered.sort_by(|a, b| {
            b.center
                .1
                .partial_cmp(&a.center.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.track_id.cmp(&b.track_id))
        });

        let mut violations = Vec::new();
        for pair in ordered.windows(2) {
            let follower = pair[0];
            let leader = pair[1];

            let x_gap = (follower.center.0 - leader.center.0).abs();
            if x_gap >= self.config.lane_x_tolerance_px {
                continue;
            }

            let gap_m = match self.calibrator.distance_m(
                (follower.center.0 as f64, follower.center.1 as f64),
                (leader.center.0 as f64, leader.center.1 as f64),
            ) {
                Some(d) => d,
                None => {
                    (follower.center.1 - leader.center.1).abs() as f64 * self.config.px_to_m_fallback
                }
            };
            if gap_m >= self.config.min_following_gap_m {
                continue;
            }
            if self.in_cooldown(follower.track_id, ViolationType::FollowingDistance, now) {
                continue;
            }

            let severity = self.following_severity(gap_m);
            info!(
                track_id = follower.track_id,
                leader_id = leader.track_id,
                gap_m,
                "following too closely"
            );
            violations.push(self.emit(TrafficViolation {
                violation_id: TrafficViolation::make_id(
                    ViolationType::FollowingDistance,
                    follower.track_id,
                    now,
                ),
                violation_type: ViolationType::FollowingDistance,
                severity,
                track_id: follower.track_id,
                timestamp: now,
                location: follower.center,
                zone_id: self
                    .calibrator
                    .zone_for(follower.center.0 as f64, follower.center.1 as f64)
                    .map(|z| z.zone_id.clone()),
                confidence: 0.7,
                description: format!(
                    "{:.1}m behind track {} (minimum {:.0}m)",
                    gap_m, leader.track_id, self.config.min_following_gap_m
                ),
                details: ViolationDetails::FollowingDistance {
                    gap_m,
                    min_gap_m: self.config.min_following_gap_m,
                },
            }));
        }
        violations
    }

    // ---- severity ladders ----

    fn speed_severity(&self, over_limit: f64) -> ViolationSeverity {
        let [critical, severe, moderate] = self.config.speed_severity_kmh;
        if over_limit >= critical {
            ViolationSeverity::Critical
        } else if over_limit >= severe {
            ViolationSeverity::Severe
        } else if over_limit >= moderate {
            ViolationSeverity::Moderate
        } else {
            ViolationSeverity::Minor
        }
    }

    fn lane_severity(&self, penetration: f32) -> ViolationSeverity {
        let [critical, severe, moderate] = self.config.lane_severity_ratio;
        if penetration >= critical {
            ViolationSeverity::Critical
        } else if penetration >= severe {
            ViolationSeverity::Severe
        } else if penetration >= moderate {
            ViolationSeverity::Moderate
        } else {
            ViolationSeverity::Minor
        }
    }

    fn following_severity(&self, gap_m: f64) -> ViolationSeverity {
        let min_gap = self.config.min_following_gap_m;
        if gap_m < min_gap * 0.3 {
            ViolationSeverity::Critical
        } else if gap_m < min_gap * 0.5 {
            ViolationSeverity::Severe
        } else {
            ViolationSeverity::Moderate
        }
    }

    // ---- housekeeping & queries ----

    /// Drops cooldown entries whose window has elapsed: the pair is back
    /// to idle and a new trigger is a new, independent violation.
    pub fn sweep_cooldowns(&mut self, now: f64) -> usize {
        let before = self.cooldowns.len();
        let config = &self.config;
        self.cooldowns.retain(|(_, violation_type), triggered_at| {
            let period = match violation_type {
                ViolationType::Speed => config.cooldown_speed_s,
                ViolationType::LaneInvasion => config.cooldown_lane_s,
                ViolationType::WrongWay => config.cooldown_wrong_way_s,
                ViolationType::FollowingDistance => config.cooldown_following_s,
            };
            now - *triggered_at < period
        });
        before - self.cooldowns.len()
    }

    /// Ages the in-memory violation log out past the retention horizon.
    pub fn cleanup_log(&mut self, now: f64) -> usize {
        let horizon = self.config.log_max_age_s;
        let before = self.log.len();
        self.log.retain(|v| now - v.timestamp <= horizon);
        let removed = before - self.log.len();
        if removed > 0 {
            self.false_positive_ids
                .retain(|id| self.log.iter().any(|v| &v.violation_id == id));
            info!(removed, "aged out old violations");
        }
        removed
    }

    pub fn violations(&self) -> &[TrafficViolation] {
        &self.log
    }

    pub fn violations_for_vehicle(&self, track_id: u64) -> Vec<&TrafficViolation> {
        self.log.iter().filter(|v| v.track_id == track_id).collect()
    }

    pub fn violations_of_type(&self, violation_type: ViolationType) -> Vec<&TrafficViolation> {
        self.log
            .iter()
            .filter(|v| v.violation_type == violation_type)
            .collect()
    }

    pub fn violations_between(&self, start: f64, end: f64) -> Vec<&TrafficViolation> {
        self.log
            .iter()
            .filter(|v| v.timestamp >= start && v.timestamp <= end)
            .collect()
    }

    pub fn mark_false_positive(&mut self, violation_id: &str) -> bool {
        if self.log.iter().any(|v| v.violation_id == violation_id) {
            self.false_positive_ids.insert(violation_id.to_string());
            info!(violation_id, "marked false positive");
            true
        } else {
            false
        }
    }

    pub fn is_false_positive(&self, violation_id: &str) -> bool {
        self.false_positive_ids.contains(violation_id)
    }

    /// Pairs still inside their suppression window.
    pub fn open_violations(&self, now: f64) -> usize {
        self.cooldowns
            .iter()
            .filter(|((_, violation_type), triggered_at)| {
                now - **triggered_at < self.cooldown_period(*violation_type)
            })
            .count()
    }

    pub fn statistics(&self) -> ViolationStats {
        let total = self.total_emitted;
        ViolationStats {
            total,
            by_type: self.by_type.clone(),
            by_severity: self.by_severity.clone(),
            false_positives: self.false_positive_ids.len(),
            false_positive_rate: self.false_positive_ids.len() as f64 / (total.max(1) as f64),
            active_cooldowns: self.cooldowns.len(),
        }
    }
}
