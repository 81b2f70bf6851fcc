//! Traffic violation detection core.
//!
//! Turns per-frame vehicle detections into persistent trajectories,
//! converts pixel motion into real-world speed through a calibrated
//! ground-plane homography, and runs a stateful rule engine for
//! speeding, lane invasion, wrong-way driving and unsafe following
//! distance, with per-(track, type) cooldowns to keep one continuous
//! infraction from flooding downstream consumers.
//!
//! One [`manager::ViolationManager`] drives one camera stream; streams
//! sharing a physical camera share a read-only
//! [`calibration::CameraCalibrator`].

pub mod calibration;
pub mod config;
pub mod error;
pub mod lanes;
pub mod manager;
pub mod speed;
pub mod tracker;
pub mod trajectory;
pub mod types;
pub mod violations;

pub use calibration::{
    CalibrationDocument, CalibrationPoint, CalibrationZone, CameraCalibrator, ZoneDirection,
};
pub use error::{Error, Result};
pub use lanes::{LaneDetector, LaneLine, LaneSet, LaneViolationCandidate};
pub use manager::{RollingStats, SystemStatus, ViolationManager, ViolationReport};
pub use speed::{SpeedCalculator, SpeedMeasurement, SpeedUnit};
pub use tracker::VehicleTracker;
pub use trajectory::{Trajectory, TrajectoryPoint, TrajectoryStore};
pub use types::{
    BoundingBox, Config, Detection, Frame, LaneCrossing, TrackedVehicle, TrafficViolation,
    VehicleClass, ViolationDetails, ViolationSeverity, ViolationType,
};
pub use violations::ViolationDetector;
