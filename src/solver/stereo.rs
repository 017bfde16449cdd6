//! Stereo extrinsics with fixed intrinsics.
//!
//! Each view gives a board pose in both cameras. The relative transforms
//! `T_r * T_l^-1` are averaged for a first estimate, then the extrinsics and
//! every left board pose are refined together against the reprojection error
//! of both cameras. `E`, `F` and the joint RMS error follow from the result.

use super::optimization::{Optimizer, StereoOptimizationCost};
use super::prior::pooled_rms;
use super::{check_views, SolverError, StereoCalibrator, StereoSolution};
use crate::camera::{RadTanModel, Resolution};
use crate::geometry::{essential_matrix, fundamental_matrix};
use log::debug;
use nalgebra::{Vector2, Vector3};

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedIntrinsicsStereoCalibrator;

impl StereoCalibrator for FixedIntrinsicsStereoCalibrator {
    fn calibrate(
        &self,
        object_points: &[Vec<Vector3<f64>>],
        left_points: &[Vec<Vector2<f64>>],
        right_points: &[Vec<Vector2<f64>>],
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
    ) -> Result<StereoSolution, SolverError> {
        check_views(object_points, &[left_points, right_points])?;

        let mut left = left.clone();
        left.resolution = image_size;
        let mut right = right.clone();
        right.resolution = image_size;

        let mut cost = StereoOptimizationCost::new(
            left.clone(),
            right.clone(),
            object_points.to_vec(),
            left_points.to_vec(),
            right_points.to_vec(),
        );
        cost.linear_estimation()?;
        let initial_rms = pooled_rms(&cost.reprojection_errors()?);
        cost.optimize(false)?;
        let rms = pooled_rms(&cost.reprojection_errors()?);

        let extrinsics = cost.extrinsics();
        let rotation = extrinsics.rotation.to_rotation_matrix().into_inner();
        let translation = extrinsics.translation.vector;

        let essential = essential_matrix(&rotation, &translation);
        let fundamental = fundamental_matrix(
            &essential,
            &left.camera_matrix(),
            &right.camera_matrix(),
        )?;

        debug!(
            "Stereo extrinsics from {} views: |T| = {:.4}, rms {initial_rms:.4} -> {rms:.4}",
            object_points.len(),
            translation.norm()
        );

        Ok(StereoSolution {
            rotation,
            translation,
            essential,
            fundamental,
            rms,
        })
    }
}
