// src/error.rs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration-time failures. Steady-state "no result" conditions
/// (uncalibrated camera, too few trajectory samples) are `Option::None`
/// at the call sites, never errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("calibration requires at least {required} points, got {got}")]
    NotEnoughCalibrationPoints { required: usize, got: usize },

    #[error("calibration points are collinear or otherwise degenerate")]
    DegenerateCalibration,

    #[error("calibration residual {error_m:.3}m exceeds the {limit_m:.3}m bound")]
    CalibrationResidual { error_m: f64, limit_m: f64 },

    #[error("zone `{zone_id}`: polygon needs at least 3 vertices, got {got}")]
    InvalidZonePolygon { zone_id: String, got: usize },

    #[error("zone `{zone_id}` is already registered")]
    DuplicateZone { zone_id: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("failed to encode/decode calibration document: {0}")]
    CalibrationDocument(#[from] serde_json::Error),
}
