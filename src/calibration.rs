// src/calibration.rs
//
// Pixel to ground-plane calibration. A planar homography is fitted from
// pixel/world correspondences (normalized DLT, solved through the
// eigenvector of AᵀA with the smallest eigenvalue) and gated on its mean
// reprojection residual. Pure geometry plus static zone configuration:
// no tracks, no time.

use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

const MIN_CALIBRATION_POINTS: usize = 4;
/// Residual bound (meters) above which a fit is rejected.
pub const DEFAULT_MAX_FIT_ERROR_M: f64 = 0.5;

/// One pixel/ground-plane correspondence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub pixel: (f64, f64),
    /// Ground-plane coordinates in meters.
    pub world: (f64, f64),
    #[serde(default)]
    pub description: String,
}

impl CalibrationPoint {
    pub fn new(pixel: (f64, f64), world: (f64, f64)) -> Self {
        Self {
            pixel,
            world,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneDirection {
    /// Traffic must flow entry line → exit line.
    Forward,
    /// No directional expectation.
    Any,
}

/// Named enforcement region, configured once at setup and read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationZone {
    pub zone_id: String,
    pub name: String,
    pub pixel_polygon: Vec<(f64, f64)>,
    pub world_polygon: Vec<(f64, f64)>,
    pub speed_limit_kmh: f64,
    pub entry_line: ((f64, f64), (f64, f64)),
    pub exit_line: ((f64, f64), (f64, f64)),
    pub direction: ZoneDirection,
}

impl CalibrationZone {
    /// Unit pixel-space vector from the entry line midpoint to the exit
    /// line midpoint. `None` for `Any` zones or degenerate line pairs.
    pub fn expected_direction(&self) -> Option<(f64, f64)> {
        if self.direction == ZoneDirection::Any {
            return None;
        }
        let entry_mid = midpoint(self.entry_line);
        let exit_mid = midpoint(self.exit_line);
        let dx = exit_mid.0 - entry_mid.0;
        let dy = exit_mid.1 - entry_mid.1;
        let length = (dx * dx + dy * dy).sqrt();
        if length < 1e-9 {
            return None;
        }
        Some((dx / length, dy / length))
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        point_in_polygon((x, y), &self.pixel_polygon)
    }
}

fn midpoint(line: ((f64, f64), (f64, f64))) -> (f64, f64) {
    (
        (line.0 .0 + line.1 .0) / 2.0,
        (line.0 .1 + line.1 .1) / 2.0,
    )
}

/// The persisted calibration record: everything needed to rebuild a
/// calibrator. Round-trips losslessly through JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationDocument {
    pub points: Vec<CalibrationPoint>,
    pub zones: Vec<CalibrationZone>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub is_valid: bool,
    pub mean_error_m: Option<f64>,
    pub max_error_m: Option<f64>,
    pub num_points: usize,
    pub num_zones: usize,
}

pub struct CameraCalibrator {
    points: Vec<CalibrationPoint>,
    /// Registration order decides zone lookup: first registered wins.
    zones: Vec<CalibrationZone>,
    homography: Option<Matrix3<f64>>,
    inverse: Option<Matrix3<f64>>,
    mean_error_m: Option<f64>,
    max_error_m: Option<f64>,
    max_fit_error_m: f64,
}

impl Default for CameraCalibrator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIT_ERROR_M)
    }
}

impl CameraCalibrator {
    pub fn new(max_fit_error_m: f64) -> Self {
        Self {
            points: Vec::new(),
            zones: Vec::new(),
            homography: None,
            inverse: None,
            mean_error_m: None,
            max_error_m: None,
            max_fit_error_m,
        }
    }

    /// Adds one correspondence and refits once enough points exist.
    /// A point that makes the fit degenerate or pushes the residual past
    /// the bound is rejected and the calibrator keeps its previous state.
    pub fn add_point(&mut self, point: CalibrationPoint) -> Result<()> {
        self.points.push(point);
        if self.points.len() < MIN_CALIBRATION_POINTS {
            return Ok(());
        }
        match self.refit() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.points.pop();
                warn!(error = %e, "calibration point rejected");
                Err(e)
            }
        }
    }

    fn refit(&mut self) -> Result<()> {
        let n = self.points.len();
        if n < MIN_CALIBRATION_POINTS {
            return Err(Error::NotEnoughCalibrationPoints {
                required: MIN_CALIBRATION_POINTS,
                got: n,
            });
        }

        let pixels: Vec<(f64, f64)> = self.points.iter().map(|p| p.pixel).collect();
        let worlds: Vec<(f64, f64)> = self.points.iter().map(|p| p.world).collect();
        if is_collinear(&pixels) || is_collinear(&worlds) {
            return Err(Error::DegenerateCalibration);
        }

        let homography = fit_homography(&pixels, &worlds)?;
        let inverse = homography
            .try_inverse()
            .ok_or(Error::DegenerateCalibration)?;

        let mut mean = 0.0;
        let mut max = 0.0f64;
        for point in &self.points {
            let projected = project(&homography, point.pixel).ok_or(Error::DegenerateCalibration)?;
            let err = ((projected.0 - point.world.0).powi(2)
                + (projected.1 - point.world.1).powi(2))
            .sqrt();
            mean += err;
            max = max.max(err);
        }
        mean /= n as f64;

        if mean > self.max_fit_error_m {
            return Err(Error::CalibrationResidual {
                error_m: mean,
                limit_m: self.max_fit_error_m,
            });
        }

        self.homography = Some(homography);
        self.inverse = Some(inverse);
        self.mean_error_m = Some(mean);
        self.max_error_m = Some(max);
        info!(points = n, mean_error_m = mean, "camera calibrated");
        Ok(())
    }

    pub fn is_calibrated(&self) -> bool {
        self.homography.is_some()
    }

    pub fn pixel_to_world(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        project(self.homography.as_ref()?, (x, y))
    }

    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        project(self.inverse.as_ref()?, (x, y))
    }

    /// Ground-plane distance in meters between two pixel points.
    pub fn distance_m(&self, a: (f64, f64), b: (f64, f64)) -> Option<f64> {
        let wa = self.pixel_to_world(a.0, a.1)?;
        let wb = self.pixel_to_world(b.0, b.1)?;
        Some(((wb.0 - wa.0).powi(2) + (wb.1 - wa.1).powi(2)).sqrt())
    }

    pub fn add_zone(&mut self, zone: CalibrationZone) -> Result<()> {
        if zone.pixel_polygon.len() < 3 || zone.world_polygon.len() < 3 {
            return Err(Error::InvalidZonePolygon {
                zone_id: zone.zone_id.clone(),
                got: zone.pixel_polygon.len().min(zone.world_polygon.len()),
            });
        }
        if self.zones.iter().any(|z| z.zone_id == zone.zone_id) {
            return Err(Error::DuplicateZone {
                zone_id: zone.zone_id.clone(),
            });
        }
        info!(
            zone_id = zone.zone_id.as_str(),
            limit_kmh = zone.speed_limit_kmh,
            "calibration zone added"
        );
        self.zones.push(zone);
        Ok(())
    }

    /// Zone containing the pixel point. When zones overlap the first
    /// registered one wins; the tie-break is deliberate and stable.
    pub fn zone_for(&self, x: f64, y: f64) -> Option<&CalibrationZone> {
        self.zones.iter().find(|z| z.contains(x, y))
    }

    pub fn zones(&self) -> &[CalibrationZone] {
        &self.zones
    }

    pub fn zone(&self, zone_id: &str) -> Option<&CalibrationZone> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }

    pub fn validate(&self) -> CalibrationReport {
        CalibrationReport {
            is_valid: self.is_calibrated(),
            mean_error_m: self.mean_error_m,
            max_error_m: self.max_error_m,
            num_points: self.points.len(),
            num_zones: self.zones.len(),
        }
    }

    pub fn mean_error_m(&self) -> Option<f64> {
        self.mean_error_m
    }

    // ---- persistence ----

    pub fn to_document(&self) -> CalibrationDocument {
        CalibrationDocument {
            points: self.points.clone(),
            zones: self.zones.clone(),
        }
    }

    /// Rebuilds a calibrator from a persisted document. All points are
    /// installed before the single refit, so a document whose early
    /// points happen to be collinear still loads.
    pub fn from_document(document: CalibrationDocument, max_fit_error_m: f64) -> Result<Self> {
        let mut calibrator = Self::new(max_fit_error_m);
        calibrator.points = document.points;
        if calibrator.points.len() >= MIN_CALIBRATION_POINTS {
            calibrator.refit()?;
        }
        for zone in document.zones {
            calibrator.add_zone(zone)?;
        }
        Ok(calibrator)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    pub fn from_json(json: &str, max_fit_error_m: f64) -> Result<Self> {
        let document: CalibrationDocument = serde_json::from_str(json)?;
        Self::from_document(document, max_fit_error_m)
    }

    /// Stock perspective calibration for a straight highway view:
    /// lane markers at the near edge and toward the vanishing point,
    /// plus a single 100 km/h measurement zone.
    pub fn default_highway_calibration(image_width: f64, image_height: f64) -> Result<Self> {
        let lane_width = 3.5;
        let visible_distance = 50.0;
        let w = image_width;
        let h = image_height;

        let mut calibrator = Self::default();
        let raw = [
            ((w * 0.2, h * 0.9), (-lane_width, 5.0)),
            ((w * 0.5, h * 0.9), (0.0, 5.0)),
            ((w * 0.8, h * 0.9), (lane_width, 5.0)),
            ((w * 0.4, h * 0.3), (-lane_width / 2.0, visible_distance)),
            ((w * 0.5, h * 0.3), (0.0, visible_distance)),
            ((w * 0.6, h * 0.3), (lane_width / 2.0, visible_distance)),
        ];
        for (i, (pixel, world)) in raw.into_iter().enumerate() {
            calibrator.add_point(CalibrationPoint {
                pixel,
                world,
                description: format!("highway point {}", i + 1),
            })?;
        }

        calibrator.add_zone(CalibrationZone {
            zone_id: "highway_main".to_string(),
            name: "Main Highway Zone".to_string(),
            pixel_polygon: vec![
                (w * 0.1, h * 0.9),
                (w * 0.9, h * 0.9),
                (w * 0.7, h * 0.3),
                (w * 0.3, h * 0.3),
            ],
            world_polygon: vec![
                (-lane_width * 1.5, 5.0),
                (lane_width * 1.5, 5.0),
                (lane_width * 0.5, visible_distance),
                (-lane_width * 0.5, visible_distance),
            ],
            speed_limit_kmh: 100.0,
            entry_line: ((w * 0.2, h * 0.8), (w * 0.8, h * 0.8)),
            exit_line: ((w * 0.3, h * 0.4), (w * 0.7, h * 0.4)),
            direction: ZoneDirection::Forward,
        })?;

        Ok(calibrator)
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

fn project(h: &Matrix3<f64>, p: (f64, f64)) -> Option<(f64, f64)> {
    let v = h * Vector3::new(p.0, p.1, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some((v.x / v.z, v.y / v.z))
}

/// Normalized DLT. Correspondences are conditioned with a similarity
/// transform (centroid at the origin, mean distance √2) before solving
/// Ah = 0 through the smallest eigenvector of AᵀA.
fn fit_homography(pixels: &[(f64, f64)], worlds: &[(f64, f64)]) -> Result<Matrix3<f64>> {
    let (t_pixel, norm_pixels) = normalize_points(pixels);
    let (t_world, norm_worlds) = normalize_points(worlds);

    let n = norm_pixels.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (&(x, y), &(wx, wy))) in norm_pixels.iter().zip(norm_worlds.iter()).enumerate() {
        let r = 2 * i;
        a[(r, 0)] = -x;
        a[(r, 1)] = -y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = x * wx;
        a[(r, 7)] = y * wx;
        a[(r, 8)] = wx;
        a[(r + 1, 3)] = -x;
        a[(r + 1, 4)] = -y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = x * wy;
        a[(r + 1, 7)] = y * wy;
        a[(r + 1, 8)] = wy;
    }

    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or(Error::DegenerateCalibration)?;
    let h = eigen.eigenvectors.column(min_idx);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_world_inv = t_world
        .try_inverse()
        .ok_or(Error::DegenerateCalibration)?;
    let mut homography = t_world_inv * hn * t_pixel;

    let scale = homography[(2, 2)];
    if scale.abs() < 1e-12 {
        return Err(Error::DegenerateCalibration);
    }
    homography /= scale;
    Ok(homography)
}

fn normalize_points(points: &[(f64, f64)]) -> (Matrix3<f64>, Vec<(f64, f64)>) {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let transform = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| (scale * (p.0 - cx), scale * (p.1 - cy)))
        .collect();
    (transform, normalized)
}

/// True when the point cloud has (near-)zero spread along one axis of
/// its covariance, which makes the homography unsolvable.
fn is_collinear(points: &[(f64, f64)]) -> bool {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p.0 - cx;
        let dy = p.1 - cy;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let trace = sxx + syy;
    if trace < 1e-12 {
        return true; // all points coincide
    }
    let disc = ((sxx - syy).powi(2) + 4.0 * sxy * sxy).sqrt();
    let min_eig = (trace - disc) / 2.0;
    let max_eig = (trace + disc) / 2.0;
    min_eig < 1e-8 * max_eig
}

/// Ray-casting point-in-polygon test.
fn point_in_polygon(point: (f64, f64), polygon: &[(f64, f64)]) -> bool {
    let (x, y) = point;
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let (mut p1x, mut p1y) = polygon[0];
    for i in 1..=n {
        let (p2x, p2y) = polygon[i % n];
        if y > p1y.min(p2y) && y <= p1y.max(p2y) && x <= p1x.max(p2x) {
            let crosses = if (p1y - p2y).abs() < f64::EPSILON {
                true
            } else {
                let x_intersection = (y - p1y) * (p2x - p1x) / (p2y - p1y) + p1x;
                (p1x - p2x).abs() < f64::EPSILON || x <= x_intersection
            };
            if crosses {
                inside = !inside;
            }
        }
        p1x = p2x;
        p1y = p2y;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat 0.1 m-per-pixel calibration square: an exact affine fit.
    fn make_scaled_calibrator() -> CameraCalibrator {
        let mut calibrator = CameraCalibrator::default();
        for (pixel, world) in [
            ((0.0, 0.0), (0.0, 0.0)),
            ((100.0, 0.0), (10.0, 0.0)),
            ((0.0, 100.0), (0.0, 10.0)),
            ((100.0, 100.0), (10.0, 10.0)),
        ] {
            calibrator
                .add_point(CalibrationPoint::new(pixel, world))
                .unwrap();
        }
        calibrator
    }

    fn make_square_zone(zone_id: &str, limit: f64) -> CalibrationZone {
        CalibrationZone {
            zone_id: zone_id.to_string(),
            name: zone_id.to_string(),
            pixel_polygon: vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)],
            world_polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            speed_limit_kmh: limit,
            entry_line: ((0.0, 90.0), (100.0, 90.0)),
            exit_line: ((0.0, 10.0), (100.0, 10.0)),
            direction: ZoneDirection::Forward,
        }
    }

    // ---- Fit tests ----

    #[test]
    fn test_not_calibrated_below_four_points() {
        let mut calibrator = CameraCalibrator::default();
        for pixel in [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)] {
            calibrator
                .add_point(CalibrationPoint::new(pixel, (pixel.0 / 10.0, pixel.1 / 10.0)))
                .unwrap();
        }

        assert!(!calibrator.is_calibrated());
        assert!(calibrator.pixel_to_world(50.0, 50.0).is_none());
        assert!(!calibrator.validate().is_valid);
    }

    #[test]
    fn test_four_exact_points_calibrate() {
        let calibrator = make_scaled_calibrator();
        assert!(calibrator.is_calibrated());

        let (wx, wy) = calibrator.pixel_to_world(50.0, 50.0).unwrap();
        assert!((wx - 5.0).abs() < 1e-6);
        assert!((wy - 5.0).abs() < 1e-6);

        // Inverse maps back
        let (px, py) = calibrator.world_to_pixel(wx, wy).unwrap();
        assert!((px - 50.0).abs() < 1e-6);
        assert!((py - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_collinear_points_rejected() {
        let mut calibrator = CameraCalibrator::default();
        for x in [0.0, 10.0, 20.0] {
            calibrator
                .add_point(CalibrationPoint::new((x, x), (x, x)))
                .unwrap();
        }
        let result = calibrator.add_point(CalibrationPoint::new((30.0, 30.0), (30.0, 30.0)));

        assert!(matches!(result, Err(Error::DegenerateCalibration)));
        assert!(!calibrator.is_calibrated());
        // The rejected point did not stick
        assert_eq!(calibrator.validate().num_points, 3);
    }

    #[test]
    fn test_distance_between_pixel_points() {
        let calibrator = make_scaled_calibrator();
        // 300 px at 0.1 m/px
        let d = calibrator.distance_m((0.0, 0.0), (0.0, 300.0)).unwrap();
        assert!((d - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_default_highway_calibration_is_valid() {
        let calibrator = CameraCalibrator::default_highway_calibration(1920.0, 1080.0).unwrap();
        assert!(calibrator.is_calibrated());
        assert!(calibrator.validate().mean_error_m.unwrap() < 0.01);

        let zone = calibrator.zone_for(960.0, 700.0).unwrap();
        assert_eq!(zone.zone_id, "highway_main");
        // Entry at the bottom, exit toward the horizon: traffic flows up
        let (dx, dy) = zone.expected_direction().unwrap();
        assert!(dx.abs() < 1e-9);
        assert!(dy < 0.0);
    }

    // ---- Zone tests ----

    #[test]
    fn test_first_registered_zone_wins_overlap() {
        let mut calibrator = CameraCalibrator::default();
        calibrator.add_zone(make_square_zone("zone_a", 60.0)).unwrap();
        calibrator.add_zone(make_square_zone("zone_b", 80.0)).unwrap();

        assert_eq!(calibrator.zone_for(50.0, 50.0).unwrap().zone_id, "zone_a");
    }

    #[test]
    fn test_degenerate_zone_polygon_rejected() {
        let mut calibrator = CameraCalibrator::default();
        let mut zone = make_square_zone("thin", 60.0);
        zone.pixel_polygon.truncate(2);

        assert!(matches!(
            calibrator.add_zone(zone),
            Err(Error::InvalidZonePolygon { .. })
        ));
        assert!(calibrator.zones().is_empty());
    }

    #[test]
    fn test_point_outside_every_zone() {
        let mut calibrator = CameraCalibrator::default();
        calibrator.add_zone(make_square_zone("zone_a", 60.0)).unwrap();
        assert!(calibrator.zone_for(500.0, 500.0).is_none());
    }

    // ---- Persistence tests ----

    #[test]
    fn test_document_json_roundtrip_is_lossless() {
        let mut calibrator = make_scaled_calibrator();
        calibrator.add_zone(make_square_zone("zone_a", 60.0)).unwrap();

        let json = calibrator.to_json().unwrap();
        let restored = CameraCalibrator::from_json(&json, DEFAULT_MAX_FIT_ERROR_M).unwrap();

        assert_eq!(restored.to_document(), calibrator.to_document());
        assert!(restored.is_calibrated());
        let (wx, _) = restored.pixel_to_world(100.0, 0.0).unwrap();
        assert!((wx - 10.0).abs() < 1e-6);
    }
}
