//! The stereo calibration snapshot.
//!
//! A [`CalibrationResult`] can only be obtained through validation, either
//! from freshly computed [`CalibrationParts`] or from a persisted JSON record,
//! so code holding one never has to re-check it.

use super::Camera;
use crate::camera::{CameraModel, CameraModelError, RadTanModel, Resolution};
use crate::geometry::is_rotation;
use chrono::{DateTime, Utc};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const ROTATION_TOLERANCE: f64 = 1e-6;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InvalidResult {
    #[error("{0} contains non-finite values")]
    NonFinite(&'static str),
    #[error("{0} camera matrix must have positive focal lengths")]
    FocalLength(Camera),
    #[error("rotation is not a proper rotation matrix")]
    NotARotation,
    #[error("{field} must have shape {shape}")]
    Shape {
        field: &'static str,
        shape: &'static str,
    },
    #[error("{0} must be finite and not negative")]
    NegativeError(&'static str),
}

/// Calibration quality, classified from the joint RMS reprojection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationQuality {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl CalibrationQuality {
    pub fn from_rms(rms: f64) -> Self {
        if rms < 0.5 {
            CalibrationQuality::Excellent
        } else if rms < 1.0 {
            CalibrationQuality::Good
        } else if rms < 2.0 {
            CalibrationQuality::Acceptable
        } else {
            CalibrationQuality::Poor
        }
    }
}

impl fmt::Display for CalibrationQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationQuality::Excellent => "Excellent",
            CalibrationQuality::Good => "Good",
            CalibrationQuality::Acceptable => "Acceptable",
            CalibrationQuality::Poor => "Poor",
        };
        f.write_str(name)
    }
}

/// Unvalidated calibration values, as produced by the solvers.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParts {
    pub camera_matrix_left: Matrix3<f64>,
    pub distortion_left: [f64; 5],
    pub camera_matrix_right: Matrix3<f64>,
    pub distortion_right: [f64; 5],
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rms: f64,
    pub rms_left: f64,
    pub rms_right: f64,
    pub image_size: Resolution,
    pub sample_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Intrinsics, distortion and extrinsics of a calibrated stereo pair.
///
/// A point `X1` in left camera coordinates is `rotation * X1 + translation` in
/// right camera coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationRecord", into = "CalibrationRecord")]
pub struct CalibrationResult {
    parts: CalibrationParts,
}

impl CalibrationResult {
    /// Validates `parts`: every value finite, positive focal lengths, a
    /// proper rotation and non-negative error figures.
    pub fn new(parts: CalibrationParts) -> Result<Self, InvalidResult> {
        let matrices = [
            ("camera matrix 1", &parts.camera_matrix_left),
            ("camera matrix 2", &parts.camera_matrix_right),
            ("rotation", &parts.rotation),
            ("essential matrix", &parts.essential),
            ("fundamental matrix", &parts.fundamental),
        ];
        for (name, m) in matrices {
            if m.iter().any(|v| !v.is_finite()) {
                return Err(InvalidResult::NonFinite(name));
            }
        }
        if parts.distortion_left.iter().any(|v| !v.is_finite()) {
            return Err(InvalidResult::NonFinite("distortion 1"));
        }
        if parts.distortion_right.iter().any(|v| !v.is_finite()) {
            return Err(InvalidResult::NonFinite("distortion 2"));
        }
        if parts.translation.iter().any(|v| !v.is_finite()) {
            return Err(InvalidResult::NonFinite("translation"));
        }

        for (camera, k) in [
            (Camera::Left, &parts.camera_matrix_left),
            (Camera::Right, &parts.camera_matrix_right),
        ] {
            if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
                return Err(InvalidResult::FocalLength(camera));
            }
        }
        if !is_rotation(&parts.rotation, ROTATION_TOLERANCE) {
            return Err(InvalidResult::NotARotation);
        }
        for (name, value) in [
            ("rms error", parts.rms),
            ("rms error 1", parts.rms_left),
            ("rms error 2", parts.rms_right),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(InvalidResult::NegativeError(name));
            }
        }

        Ok(CalibrationResult { parts })
    }

    pub fn camera_matrix(&self, camera: Camera) -> &Matrix3<f64> {
        match camera {
            Camera::Left => &self.parts.camera_matrix_left,
            Camera::Right => &self.parts.camera_matrix_right,
        }
    }

    pub fn distortion(&self, camera: Camera) -> &[f64; 5] {
        match camera {
            Camera::Left => &self.parts.distortion_left,
            Camera::Right => &self.parts.distortion_right,
        }
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.parts.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.parts.translation
    }

    pub fn essential(&self) -> &Matrix3<f64> {
        &self.parts.essential
    }

    pub fn fundamental(&self) -> &Matrix3<f64> {
        &self.parts.fundamental
    }

    /// Joint RMS reprojection error of the stereo calibration.
    pub fn rms(&self) -> f64 {
        self.parts.rms
    }

    /// Single-camera RMS reprojection error.
    pub fn camera_rms(&self, camera: Camera) -> f64 {
        match camera {
            Camera::Left => self.parts.rms_left,
            Camera::Right => self.parts.rms_right,
        }
    }

    pub fn image_size(&self) -> Resolution {
        self.parts.image_size
    }

    pub fn sample_count(&self) -> usize {
        self.parts.sample_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.parts.created_at
    }

    /// Stereo baseline length, in board units.
    pub fn baseline(&self) -> f64 {
        self.parts.translation.norm()
    }

    pub fn quality(&self) -> CalibrationQuality {
        CalibrationQuality::from_rms(self.parts.rms)
    }

    pub fn parts(&self) -> &CalibrationParts {
        &self.parts
    }

    /// Lens model of one camera, usable for undistortion.
    pub fn camera_model(&self, camera: Camera) -> Result<RadTanModel, CameraModelError> {
        RadTanModel::from_camera_matrix(
            self.camera_matrix(camera),
            *self.distortion(camera),
            self.parts.image_size,
        )
    }

    /// Writes one camera as a YAML camera file, readable by
    /// [`crate::solver::PriorIntrinsicsCalibrator::from_yaml`].
    pub fn export_camera_yaml(&self, camera: Camera, path: &Path) -> Result<(), CameraModelError> {
        self.camera_model(camera)?.save_to_yaml(path)
    }
}

/// Persisted JSON layout of a [`CalibrationResult`]. Matrices are stored as
/// row-major nested arrays. Files written by the earlier desktop tool use
/// PascalCase keys (`CameraMatrix1`, `R`, `T`, `Error`, ...) and load through
/// the aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibrationRecord {
    #[serde(alias = "CameraMatrix1")]
    camera_matrix1: Vec<Vec<f64>>,
    #[serde(alias = "DistCoeffs1")]
    dist_coeffs1: Vec<f64>,
    #[serde(alias = "CameraMatrix2")]
    camera_matrix2: Vec<Vec<f64>>,
    #[serde(alias = "DistCoeffs2")]
    dist_coeffs2: Vec<f64>,
    #[serde(alias = "R")]
    rotation: Vec<Vec<f64>>,
    #[serde(alias = "T")]
    translation: Vec<f64>,
    #[serde(alias = "E")]
    essential: Vec<Vec<f64>>,
    #[serde(alias = "F")]
    fundamental: Vec<Vec<f64>>,
    #[serde(alias = "Error")]
    rms_error: f64,
    #[serde(default)]
    rms_error1: f64,
    #[serde(default)]
    rms_error2: f64,
    #[serde(default)]
    image_width: u32,
    #[serde(default)]
    image_height: u32,
    #[serde(alias = "ImagePairsCount")]
    image_pairs_count: usize,
    #[serde(alias = "CalibrationDate")]
    calibration_date: DateTime<Utc>,
}

fn matrix_rows(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|row| row.iter().copied().collect()).collect()
}

fn matrix_from_rows(field: &'static str, rows: &[Vec<f64>]) -> Result<Matrix3<f64>, InvalidResult> {
    if rows.len() != 3 || rows.iter().any(|row| row.len() != 3) {
        return Err(InvalidResult::Shape {
            field,
            shape: "3x3",
        });
    }
    Ok(Matrix3::from_fn(|r, c| rows[r][c]))
}

fn fixed<const N: usize>(
    field: &'static str,
    shape: &'static str,
    values: &[f64],
) -> Result<[f64; N], InvalidResult> {
    values
        .try_into()
        .map_err(|_| InvalidResult::Shape { field, shape })
}

impl TryFrom<CalibrationRecord> for CalibrationResult {
    type Error = InvalidResult;

    fn try_from(record: CalibrationRecord) -> Result<Self, Self::Error> {
        let translation: [f64; 3] = fixed("translation", "3", &record.translation)?;
        CalibrationResult::new(CalibrationParts {
            camera_matrix_left: matrix_from_rows("camera_matrix1", &record.camera_matrix1)?,
            distortion_left: fixed("dist_coeffs1", "5", &record.dist_coeffs1)?,
            camera_matrix_right: matrix_from_rows("camera_matrix2", &record.camera_matrix2)?,
            distortion_right: fixed("dist_coeffs2", "5", &record.dist_coeffs2)?,
            rotation: matrix_from_rows("rotation", &record.rotation)?,
            translation: Vector3::from(translation),
            essential: matrix_from_rows("essential", &record.essential)?,
            fundamental: matrix_from_rows("fundamental", &record.fundamental)?,
            rms: record.rms_error,
            rms_left: record.rms_error1,
            rms_right: record.rms_error2,
            image_size: Resolution::new(record.image_width, record.image_height),
            sample_count: record.image_pairs_count,
            created_at: record.calibration_date,
        })
    }
}

impl From<CalibrationResult> for CalibrationRecord {
    fn from(result: CalibrationResult) -> Self {
        let p = result.parts;
        CalibrationRecord {
            camera_matrix1: matrix_rows(&p.camera_matrix_left),
            dist_coeffs1: p.distortion_left.to_vec(),
            camera_matrix2: matrix_rows(&p.camera_matrix_right),
            dist_coeffs2: p.distortion_right.to_vec(),
            rotation: matrix_rows(&p.rotation),
            translation: p.translation.iter().copied().collect(),
            essential: matrix_rows(&p.essential),
            fundamental: matrix_rows(&p.fundamental),
            rms_error: p.rms,
            rms_error1: p.rms_left,
            rms_error2: p.rms_right,
            image_width: p.image_size.width,
            image_height: p.image_size.height,
            image_pairs_count: p.sample_count,
            calibration_date: p.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRig;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(CalibrationQuality::from_rms(0.0), CalibrationQuality::Excellent);
        assert_eq!(CalibrationQuality::from_rms(0.49), CalibrationQuality::Excellent);
        assert_eq!(CalibrationQuality::from_rms(0.5), CalibrationQuality::Good);
        assert_eq!(CalibrationQuality::from_rms(1.0), CalibrationQuality::Acceptable);
        assert_eq!(CalibrationQuality::from_rms(1.99), CalibrationQuality::Acceptable);
        assert_eq!(CalibrationQuality::from_rms(2.0), CalibrationQuality::Poor);
    }

    #[test]
    fn test_json_round_trip() {
        let result = SyntheticRig::default().calibration_result().unwrap();
        let json = serde_json::to_string_pretty(&result).unwrap();
        assert!(json.contains("\"camera_matrix1\""));
        assert!(json.contains("\"image_pairs_count\""));

        let loaded: CalibrationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, result);
    }

    #[test]
    fn test_loads_pascal_case_file() {
        let result = SyntheticRig::default().calibration_result().unwrap();
        let p = result.parts();
        let rows = |m: &Matrix3<f64>| serde_json::to_value(matrix_rows(m)).unwrap();
        let json = serde_json::json!({
            "CameraMatrix1": rows(&p.camera_matrix_left),
            "DistCoeffs1": p.distortion_left.to_vec(),
            "CameraMatrix2": rows(&p.camera_matrix_right),
            "DistCoeffs2": p.distortion_right.to_vec(),
            "R": rows(&p.rotation),
            "T": p.translation.iter().copied().collect::<Vec<f64>>(),
            "E": rows(&p.essential),
            "F": rows(&p.fundamental),
            "Error": 0.42,
            "ImagePairsCount": 17,
            "CalibrationDate": "2024-03-05T14:22:10.1234567+03:00",
        });

        let loaded: CalibrationResult = serde_json::from_value(json).unwrap();
        assert_relative_eq!(*loaded.rotation(), p.rotation);
        assert_relative_eq!(*loaded.translation(), p.translation);
        assert_relative_eq!(*loaded.fundamental(), p.fundamental);
        assert_relative_eq!(loaded.rms(), 0.42);
        assert_eq!(loaded.quality(), CalibrationQuality::Excellent);
        assert_eq!(loaded.sample_count(), 17);
        assert_eq!(loaded.image_size(), Resolution::new(0, 0));
        assert_eq!(
            loaded.created_at(),
            "2024-03-05T11:22:10.1234567Z".parse::<DateTime<Utc>>().unwrap()
        );

        // Saving again uses the crate's own keys
        let saved = serde_json::to_string(&loaded).unwrap();
        assert!(saved.contains("\"rms_error\":0.42"));
        assert!(!saved.contains("\"Error\""));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let rig = SyntheticRig::default();
        let base = rig.calibration_result().unwrap().parts().clone();

        let mut parts = base.clone();
        parts.rotation[(0, 0)] = 2.0;
        assert_eq!(CalibrationResult::new(parts), Err(InvalidResult::NotARotation));

        let mut parts = base.clone();
        parts.camera_matrix_right[(1, 1)] = -1.0;
        assert_eq!(
            CalibrationResult::new(parts),
            Err(InvalidResult::FocalLength(Camera::Right))
        );

        let mut parts = base.clone();
        parts.translation.y = f64::NAN;
        assert_eq!(
            CalibrationResult::new(parts),
            Err(InvalidResult::NonFinite("translation"))
        );

        let mut parts = base;
        parts.rms = -0.1;
        assert!(CalibrationResult::new(parts).is_err());
    }

    #[test]
    fn test_load_rejects_wrong_shapes() {
        let result = SyntheticRig::default().calibration_result().unwrap();
        let mut value = serde_json::to_value(&result).unwrap();
        value["dist_coeffs1"] = serde_json::json!([0.0, 0.0, 0.0]);
        let err = serde_json::from_value::<CalibrationResult>(value).unwrap_err();
        assert!(err.to_string().contains("dist_coeffs1"), "{err}");
    }

    #[test]
    fn test_export_camera_yaml() {
        let rig = SyntheticRig::default();
        let result = rig.calibration_result().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("cameras").join("right.yaml");

        result.export_camera_yaml(Camera::Right, &path).unwrap();
        let loaded = RadTanModel::load_from_yaml(&path).unwrap();
        assert_relative_eq!(loaded.camera_matrix(), rig.right.camera_matrix());
        assert_eq!(loaded.resolution, rig.image_size());
        assert_relative_eq!(result.baseline(), rig.translation.norm());
    }
}
