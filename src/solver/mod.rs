//! Calibration solvers and the vision primitives they consume.
//!
//! Board detection and corner refinement come from outside the crate through
//! [`BoardDetector`] and [`CornerRefiner`]. Single-camera and joint stereo
//! calibration sit behind [`MonoCalibrator`] and [`StereoCalibrator`], with
//! native implementations in [`prior`] and [`stereo`]. Both start from closed-form
//! estimates and refine them through [`optimization`].
//!
//! All point lists are per calibration view: `object_points[i]` holds the
//! board corners of view `i` (board frame, `Z = 0`) and `image_points[i]` the
//! matching pixels.

use crate::camera::{undistort_points, CameraModelError, RadTanModel, Resolution};
use crate::geometry::{self, GeometryError};
use crate::util::UtilError;
use image::DynamicImage;
use nalgebra::{Isometry3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod optimization;
pub mod prior;
pub mod stereo;

pub use optimization::{BoardPoseOptimizationCost, Optimizer, StereoOptimizationCost};
pub use prior::PriorIntrinsicsCalibrator;
pub use stereo::FixedIntrinsicsStereoCalibrator;

#[derive(thiserror::Error, Debug)]
pub enum SolverError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Image size {actual} does not match camera resolution {expected}")]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Projection error: {0}")]
    Projection(#[from] UtilError),
    #[error("Solver failed: {0}")]
    Failed(String),
}

/// Chessboard geometry: inner-corner grid and square edge length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardPattern {
    /// Inner corners per row.
    pub columns: u32,
    /// Inner corners per column.
    pub rows: u32,
    pub square_size: f64,
}

impl Default for BoardPattern {
    fn default() -> Self {
        BoardPattern {
            columns: 9,
            rows: 6,
            square_size: 9.0,
        }
    }
}

impl BoardPattern {
    pub fn new(columns: u32, rows: u32, square_size: f64) -> Self {
        BoardPattern {
            columns,
            rows,
            square_size,
        }
    }

    pub fn corner_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Board-frame corner positions, row by row: `(x * square, y * square, 0)`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.rows)
            .flat_map(|y| {
                (0..self.columns).map(move |x| {
                    Vector3::new(
                        x as f64 * self.square_size,
                        y as f64 * self.square_size,
                        0.0,
                    )
                })
            })
            .collect()
    }
}

/// Finds the inner corners of a chessboard.
pub trait BoardDetector: Send + Sync {
    /// Returns the corners in the same row-by-row order as
    /// [`BoardPattern::object_points`], or `None` when the board is not found.
    fn detect(&self, image: &DynamicImage, pattern: &BoardPattern) -> Option<Vec<Vector2<f64>>>;
}

/// Sub-pixel corner refinement.
pub trait CornerRefiner: Send + Sync {
    fn refine(&self, image: &DynamicImage, corners: Vec<Vector2<f64>>) -> Vec<Vector2<f64>>;
}

/// Leaves corners where the detector put them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefinement;

impl CornerRefiner for NoRefinement {
    fn refine(&self, _image: &DynamicImage, corners: Vec<Vector2<f64>>) -> Vec<Vector2<f64>> {
        corners
    }
}

/// Result of calibrating one camera.
#[derive(Debug, Clone)]
pub struct MonoCalibration {
    pub model: RadTanModel,
    /// Board pose in the camera frame, one per view.
    pub poses: Vec<Isometry3<f64>>,
    pub rms: f64,
}

pub trait MonoCalibrator: Send + Sync {
    fn calibrate(
        &self,
        object_points: &[Vec<Vector3<f64>>],
        image_points: &[Vec<Vector2<f64>>],
        image_size: Resolution,
    ) -> Result<MonoCalibration, SolverError>;
}

/// Extrinsics of the right camera relative to the left one: a point `X1` in
/// left camera coordinates is `rotation * X1 + translation` in right camera
/// coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoSolution {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rms: f64,
}

/// Joint calibration of a stereo pair with the intrinsics of both cameras held fixed.
pub trait StereoCalibrator: Send + Sync {
    fn calibrate(
        &self,
        object_points: &[Vec<Vector3<f64>>],
        left_points: &[Vec<Vector2<f64>>],
        right_points: &[Vec<Vector2<f64>>],
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
    ) -> Result<StereoSolution, SolverError>;
}

/// Pose of a planar board in the camera frame from one view, by undistorting
/// the corners and decomposing the board-to-image homography.
pub fn board_pose(
    model: &RadTanModel,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
) -> Result<Isometry3<f64>, SolverError> {
    if object_points.iter().any(|p| p.z.abs() > 1e-9) {
        return Err(SolverError::InsufficientData(
            "board points must lie on the plane Z = 0".to_string(),
        ));
    }
    let normalized = undistort_points(model, image_points)?;
    let board: Vec<Vector2<f64>> = object_points.iter().map(|p| p.xy()).collect();
    let h = geometry::homography_dlt(&board, &normalized)?;
    Ok(geometry::planar_pose_from_homography(&Matrix3::identity(), &h)?)
}

pub(crate) fn check_views(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[&[Vec<Vector2<f64>>]],
) -> Result<(), SolverError> {
    if object_points.is_empty() {
        return Err(SolverError::InsufficientData("no views".to_string()));
    }
    for points in image_points {
        if points.len() != object_points.len() {
            return Err(SolverError::InsufficientData(format!(
                "{} views of object points but {} views of image points",
                object_points.len(),
                points.len()
            )));
        }
        for (view, (object, image)) in object_points.iter().zip(points.iter()).enumerate() {
            if object.len() != image.len() {
                return Err(SolverError::InsufficientData(format!(
                    "view {view} has {} object points and {} image points",
                    object.len(),
                    image.len()
                )));
            }
        }
    }
    Ok(())
}
