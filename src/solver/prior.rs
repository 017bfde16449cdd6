//! Single-camera calibration with known intrinsics.
//!
//! Intrinsic estimation is left to external tooling. This calibrator takes a
//! camera model produced elsewhere (typically a YAML camera file), recovers
//! the board pose of every view (homography, then reprojection refinement)
//! and scores the model by its RMS reprojection error.

use super::optimization::{BoardPoseOptimizationCost, Optimizer};
use super::{check_views, MonoCalibration, MonoCalibrator, SolverError};
use crate::camera::{CameraModel, RadTanModel, Resolution};
use crate::util::ProjectionError;
use log::debug;
use nalgebra::{Vector2, Vector3};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PriorIntrinsicsCalibrator {
    model: RadTanModel,
}

impl PriorIntrinsicsCalibrator {
    pub fn new(model: RadTanModel) -> Self {
        PriorIntrinsicsCalibrator { model }
    }

    pub fn from_yaml(path: &Path) -> Result<Self, SolverError> {
        Ok(Self::new(RadTanModel::load_from_yaml(path)?))
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }
}

impl MonoCalibrator for PriorIntrinsicsCalibrator {
    fn calibrate(
        &self,
        object_points: &[Vec<Vector3<f64>>],
        image_points: &[Vec<Vector2<f64>>],
        image_size: Resolution,
    ) -> Result<MonoCalibration, SolverError> {
        let expected = self.model.resolution;
        if !expected.is_empty() && expected != image_size {
            return Err(SolverError::ResolutionMismatch {
                expected,
                actual: image_size,
            });
        }
        check_views(object_points, &[image_points])?;

        let mut model = self.model.clone();
        model.resolution = image_size;

        let mut poses = Vec::with_capacity(object_points.len());
        let mut per_view = Vec::with_capacity(object_points.len());
        for (object, image) in object_points.iter().zip(image_points) {
            let mut cost =
                BoardPoseOptimizationCost::new(model.clone(), object.clone(), image.clone());
            cost.linear_estimation()?;
            cost.optimize(false)?;
            per_view.push(cost.reprojection_error()?);
            poses.push(*cost.pose());
        }

        let rms = pooled_rms(&per_view);
        debug!(
            "Prior-intrinsics calibration over {} views: rms {rms:.4}",
            per_view.len()
        );

        Ok(MonoCalibration { model, poses, rms })
    }
}

pub(crate) fn pooled_rms(errors: &[ProjectionError]) -> f64 {
    let count: usize = errors.iter().map(|e| e.count).sum();
    if count == 0 {
        return 0.0;
    }
    let sum_squared: f64 = errors.iter().map(|e| e.rmse.powi(2) * e.count as f64).sum();
    (sum_squared / count as f64).sqrt()
}
