// src/types.rs

use ndarray::Array2;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub trajectory: TrajectoryConfig,
    pub speed: SpeedConfig,
    pub lanes: LaneConfig,
    pub violations: ViolationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Association gate: a detection farther than this from every track
    /// (and from its predicted position) starts a new track.
    pub max_match_distance_px: f32,
    /// Consecutive unmatched frames before a track is dropped.
    pub max_disappeared_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance_px: 80.0,
            max_disappeared_frames: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Samples retained per trajectory; oldest evicted beyond this.
    pub max_points: usize,
    /// Concurrent trajectories; least-recently-updated evicted beyond this.
    pub max_trajectories: usize,
    /// Trajectories idle longer than this are removed by the sweep.
    pub stale_after_s: f64,
    pub smoothing_window: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            max_points: 100,
            max_trajectories: 1000,
            stale_after_s: 300.0,
            smoothing_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// Minimum trajectory samples before a speed is reported.
    pub min_tracking_frames: usize,
    /// Baselines below which a measurement is discarded outright.
    pub min_distance_m: f64,
    pub min_time_s: f64,
    /// Applied when the track resolves to no calibration zone.
    pub default_speed_limit_kmh: f64,
    /// Measurements blended into the smoothed per-track speed.
    pub smoothing_window: usize,
    /// Measurement history older than this is pruned.
    pub measurement_max_age_s: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            min_tracking_frames: 10,
            min_distance_m: 5.0,
            min_time_s: 0.5,
            default_speed_limit_kmh: 60.0,
            smoothing_window: 5,
            measurement_max_age_s: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Gradient magnitude above which a pixel counts as an edge.
    pub edge_threshold: u16,
    /// Hough accumulator resolution and vote floor.
    pub rho_resolution_px: f32,
    pub theta_resolution_deg: f32,
    pub vote_threshold: u32,
    /// Lines flatter than this are discarded as non-lane.
    pub min_abs_slope: f32,
    /// Half-width of the center band, as a fraction of frame width.
    pub center_band_frac: f32,
    /// Crossing thresholds at the vehicle's vertical center.
    pub center_cross_px: f32,
    pub side_cross_px: f32,
    /// Frames of line history kept for temporal smoothing.
    pub smoothing_frames: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 100,
            rho_resolution_px: 2.0,
            theta_resolution_deg: 1.0,
            vote_threshold: 50,
            min_abs_slope: 0.5,
            center_band_frac: 0.2,
            center_cross_px: 30.0,
            side_cross_px: 40.0,
            smoothing_frames: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationConfig {
    /// Tolerance above the zone limit before speeding triggers at all.
    pub speed_tolerance_kmh: f64,
    /// km/h over the limit, ordered top-down: critical, severe, moderate.
    /// Anything below the last breakpoint is minor.
    pub speed_severity_kmh: [f64; 3],
    pub min_lane_confidence: f32,
    /// Line-penetration ratio breakpoints: critical, severe, moderate.
    pub lane_severity_ratio: [f32; 3],
    pub wrong_way_tolerance_deg: f64,
    pub wrong_way_min_samples: usize,
    pub min_following_gap_m: f64,
    /// Same-lane gate for the leader/follower pairing.
    pub lane_x_tolerance_px: f32,
    /// Pixel-to-meter fallback for the gap when uncalibrated.
    pub px_to_m_fallback: f64,
    /// Suppression windows per violation type, seconds.
    pub cooldown_speed_s: f64,
    pub cooldown_lane_s: f64,
    pub cooldown_wrong_way_s: f64,
    pub cooldown_following_s: f64,
    /// Speed measurements below this confidence never trigger, so a
    /// shaky early measurement cannot burn the cooldown window.
    pub min_speed_confidence: f64,
    /// Violation log entries older than this are aged out.
    pub log_max_age_s: f64,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            speed_tolerance_kmh: 5.0,
            speed_severity_kmh: [60.0, 40.0, 20.0],
            min_lane_confidence: 0.6,
            lane_severity_ratio: [1.0, 0.8, 0.5],
            wrong_way_tolerance_deg: 90.0,
            wrong_way_min_samples: 5,
            min_following_gap_m: 20.0,
            lane_x_tolerance_px: 100.0,
            px_to_m_fallback: 0.1,
            cooldown_speed_s: 30.0,
            cooldown_lane_s: 15.0,
            cooldown_wrong_way_s: 60.0,
            cooldown_following_s: 20.0,
            min_speed_confidence: 0.7,
            log_max_age_s: 3600.0,
        }
    }
}

// ============================================================================
// FRAME & DETECTIONS
// ============================================================================

/// Single-channel frame handed in by the caller. Only the lane detector
/// reads pixels; everything else works from detections and timestamps.
#[derive(Debug, Clone)]
pub struct Frame {
    pub luma: Array2<u8>,
    /// Seconds since the epoch, strictly increasing across frames.
    pub timestamp: f64,
    pub frame_id: u64,
}

impl Frame {
    pub fn new(luma: Array2<u8>, timestamp: f64, frame_id: u64) -> Self {
        Self {
            luma,
            timestamp,
            frame_id,
        }
    }

    pub fn width(&self) -> usize {
        self.luma.ncols()
    }

    pub fn height(&self) -> usize {
        self.luma.nrows()
    }
}

/// Canonical vehicle classes. Detector labels outside this set map to
/// `Unknown` instead of silently matching on a numeric class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Bicycle,
    Unknown,
}

impl VehicleClass {
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "car" => Self::Car,
            "motorcycle" | "motorbike" => Self::Motorcycle,
            "bus" => Self::Bus,
            "truck" => Self::Truck,
            "bicycle" | "bike" => Self::Bicycle,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
            Self::Bicycle => "bicycle",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1
            && self.y2 > self.y1
            && [self.x1, self.y1, self.x2, self.y2]
                .iter()
                .all(|v| v.is_finite())
    }
}

/// One observation in one frame, validated at the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: VehicleClass,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class: VehicleClass, confidence: f32) -> Self {
        Self {
            bbox,
            class,
            confidence,
        }
    }

    /// Maps a raw detector record into the core. Malformed records
    /// (degenerate box, confidence outside [0, 1]) yield `None` and are
    /// dropped by the caller instead of propagating.
    pub fn from_label(bbox: BoundingBox, label: &str, confidence: f32) -> Option<Self> {
        if !bbox.is_valid() || !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return None;
        }
        Some(Self::new(bbox, VehicleClass::parse(label), confidence))
    }
}

/// A persistent identity maintained by the tracker. The position history
/// lives in the `TrajectoryStore`, keyed by `track_id`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedVehicle {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub class: VehicleClass,
    pub confidence: f32,
    pub center: (f32, f32),
    pub first_seen: f64,
    pub last_seen: f64,
    pub frame_count: u32,
}

// ============================================================================
// VIOLATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    Speed,
    LaneInvasion,
    WrongWay,
    FollowingDistance,
}

impl ViolationType {
    pub const ALL: [ViolationType; 4] = [
        Self::Speed,
        Self::LaneInvasion,
        Self::WrongWay,
        Self::FollowingDistance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::LaneInvasion => "lane_invasion",
            Self::WrongWay => "wrong_way",
            Self::FollowingDistance => "following_distance",
        }
    }

    /// Short tag used in deterministic violation ids.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Speed => "spd",
            Self::LaneInvasion => "lane",
            Self::WrongWay => "wway",
            Self::FollowingDistance => "gap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Minor,
    Moderate,
    Severe,
    Critical,
}

impl ViolationSeverity {
    pub const ALL: [ViolationSeverity; 4] =
        [Self::Minor, Self::Moderate, Self::Severe, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
            Self::Critical => "critical",
        }
    }
}

/// Which classified line a vehicle is crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneCrossing {
    CrossedLeft,
    CrossedRight,
    CenterLineViolation,
}

impl LaneCrossing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrossedLeft => "crossed_left",
            Self::CrossedRight => "crossed_right",
            Self::CenterLineViolation => "center_line_violation",
        }
    }
}

/// Type-specific payload. A tagged variant so the detector and the
/// reporting side branch exhaustively instead of downcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationDetails {
    Speed {
        measured_kmh: f64,
        limit_kmh: f64,
        over_limit_kmh: f64,
    },
    LaneInvasion {
        subtype: LaneCrossing,
        distance_px: f32,
    },
    WrongWay {
        angle_deg: f64,
    },
    FollowingDistance {
        gap_m: f64,
        min_gap_m: f64,
    },
}

impl ViolationDetails {
    pub fn violation_type(&self) -> ViolationType {
        match self {
            Self::Speed { .. } => ViolationType::Speed,
            Self::LaneInvasion { .. } => ViolationType::LaneInvasion,
            Self::WrongWay { .. } => ViolationType::WrongWay,
            Self::FollowingDistance { .. } => ViolationType::FollowingDistance,
        }
    }
}

/// Emitted violation record. Immutable once emitted; consumed by the
/// manager for statistics and handed to external notification/storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficViolation {
    /// Deterministic: `{tag}-{track_id}-{timestamp_ms}`.
    pub violation_id: String,
    pub violation_type: ViolationType,
    pub severity: ViolationSeverity,
    pub track_id: u64,
    pub timestamp: f64,
    /// Pixel position of the offending vehicle when triggered.
    pub location: (f32, f32),
    pub zone_id: Option<String>,
    pub confidence: f32,
    pub description: String,
    pub details: ViolationDetails,
}

impl TrafficViolation {
    pub fn make_id(violation_type: ViolationType, track_id: u64, timestamp: f64) -> String {
        format!(
            "{}-{}-{}",
            violation_type.tag(),
            track_id,
            (timestamp * 1000.0) as u64
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_class_parse_unknown_label() {
        assert_eq!(VehicleClass::parse("Car"), VehicleClass::Car);
        assert_eq!(VehicleClass::parse("motorbike"), VehicleClass::Motorcycle);
        assert_eq!(VehicleClass::parse("traffic light"), VehicleClass::Unknown);
        assert_eq!(VehicleClass::parse(""), VehicleClass::Unknown);
    }

    #[test]
    fn test_detection_boundary_validation() {
        let good = BoundingBox::new(10.0, 10.0, 50.0, 40.0);
        assert!(Detection::from_label(good, "car", 0.9).is_some());

        // Inverted box
        let inverted = BoundingBox::new(50.0, 10.0, 10.0, 40.0);
        assert!(Detection::from_label(inverted, "car", 0.9).is_none());

        // Confidence out of range
        assert!(Detection::from_label(good, "car", 1.5).is_none());
        assert!(Detection::from_label(good, "car", f32::NAN).is_none());
    }

    #[test]
    fn test_violation_id_is_deterministic() {
        let a = TrafficViolation::make_id(ViolationType::Speed, 12, 1_000.5);
        let b = TrafficViolation::make_id(ViolationType::Speed, 12, 1_000.5);
        assert_eq!(a, b);
        assert_eq!(a, "spd-12-1000500");
    }

    #[test]
    fn test_config_defaults_roundtrip_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            back.tracker.max_disappeared_frames,
            config.tracker.max_disappeared_frames
        );
        assert_eq!(back.speed.default_speed_limit_kmh, 60.0);
    }
}
