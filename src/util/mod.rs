use crate::camera::{CameraModel, CameraModelError};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Point count mismatch: {points_3d} 3D points, {points_2d} 2D points")]
    PointCountMismatch { points_3d: usize, points_2d: usize },
}

impl From<CameraModelError> for UtilError {
    fn from(err: CameraModelError) -> Self {
        UtilError::NumericalError(err.to_string())
    }
}

/// Summary statistics over per-point reprojection residuals, in pixels.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub count: usize,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {}, count: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median, self.count
        )
    }
}

impl ProjectionError {
    /// Computes the statistics of a set of residual norms.
    pub fn from_residuals(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted_errors = errors.to_vec();
        sorted_errors.sort_by(|a, b| a.total_cmp(b));
        let median = if sorted_errors.len() % 2 == 0 {
            let mid = sorted_errors.len() / 2;
            (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
        } else {
            sorted_errors[sorted_errors.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
            count: errors.len(),
        })
    }

    /// Pools two error sets as if their residuals had been collected together.
    pub fn combined_rmse(&self, other: &ProjectionError) -> f64 {
        let total = (self.count + other.count) as f64;
        if total == 0.0 {
            return 0.0;
        }
        let sum_squared =
            self.rmse.powi(2) * self.count as f64 + other.rmse.powi(2) * other.count as f64;
        (sum_squared / total).sqrt()
    }
}

/// Projects every 3D point (camera coordinates) through the model and
/// compares it with the observed pixel.
///
/// # Errors
///
/// * [`UtilError::PointCountMismatch`] when the inputs have different lengths.
/// * [`UtilError::NumericalError`] when a point cannot be projected, e.g. it lies
///   behind the camera.
pub fn compute_reprojection_error<T>(
    camera_model: &T,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
) -> Result<ProjectionError, UtilError>
where
    T: ?Sized + CameraModel,
{
    if points3d.len() != points2d.len() {
        return Err(UtilError::PointCountMismatch {
            points_3d: points3d.len(),
            points_2d: points2d.len(),
        });
    }

    let errors = points3d
        .iter()
        .zip(points2d)
        .map(|(point3d, point2d)| {
            let projected = camera_model.project(point3d)?;
            Ok((projected - point2d).norm())
        })
        .collect::<Result<Vec<f64>, UtilError>>()?;

    ProjectionError::from_residuals(&errors)
}
