//! Nonlinear refinement of board poses and stereo extrinsics.
//!
//! Intrinsics and distortion stay fixed. Every pose is a 6-vector
//! `[rx, ry, rz, tx, ty, tz]` with the rotation as a rotation vector. Linear
//! estimates seed a `tiny_solver` Levenberg-Marquardt run that minimizes the
//! pixel reprojection error.

use super::{board_pose, SolverError};
use crate::camera::RadTanModel;
use crate::geometry::average_poses;
use crate::util::{compute_reprojection_error, ProjectionError};
use log::info;
use nalgebra::{DVector, Isometry3, Point3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Two-stage estimation: a closed-form start followed by iterative refinement.
pub trait Optimizer {
    fn linear_estimation(&mut self) -> Result<(), SolverError>;

    /// Refines the current estimate. Call [`Optimizer::linear_estimation`] first.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolverError>;
}

fn lift<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

fn pose_to_params(pose: &Isometry3<f64>) -> DVector<f64> {
    let w = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    DVector::from_vec(vec![w.x, w.y, w.z, t.x, t.y, t.z])
}

fn params_to_pose(params: &DVector<f64>) -> Result<Isometry3<f64>, SolverError> {
    if params.len() != 6 || params.iter().any(|v| !v.is_finite()) {
        return Err(SolverError::Failed(format!(
            "invalid pose parameters {:?}",
            params.as_slice()
        )));
    }
    Ok(Isometry3::new(
        Vector3::new(params[3], params[4], params[5]),
        Vector3::new(params[0], params[1], params[2]),
    ))
}

/// Applies the pose `[w | t]` to `p` (Rodrigues rotation, then translation).
fn transform<T: RealField>(params: &DVector<T>, p: &Vector3<T>) -> Vector3<T> {
    let w = Vector3::new(params[0].clone(), params[1].clone(), params[2].clone());
    let t = Vector3::new(params[3].clone(), params[4].clone(), params[5].clone());

    let theta2 = w.norm_squared();
    let rotated = if theta2 < lift(1e-16) {
        p + w.cross(p)
    } else {
        let theta = theta2.sqrt();
        let k = w / theta.clone();
        let (sin, cos) = theta.sin_cos();
        let along = k.dot(p) * (T::one() - cos.clone());
        p * cos + k.cross(p) * sin + k * along
    };
    rotated + t
}

/// Radial-tangential projection to pixels, generic over the scalar so the
/// solver can differentiate it.
fn project<T: RealField>(model: &RadTanModel, p: &Vector3<T>) -> Vector2<T> {
    let [k1, k2, p1, p2, k3] = model.distortions.map(lift::<T>);
    let two: T = lift(2.0);

    let x = p.x.clone() / p.z.clone();
    let y = p.y.clone() / p.z.clone();
    let xy = x.clone() * y.clone();
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

    let xd = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let yd = y.clone() * radial + p1 * (r2 + two.clone() * y.clone() * y) + two * p2 * xy;

    let intrinsics = &model.intrinsics;
    Vector2::new(
        lift::<T>(intrinsics.fx) * xd + lift(intrinsics.cx),
        lift::<T>(intrinsics.fy) * yd + lift(intrinsics.cy),
    )
}

/// Reprojection residuals of one board view in a single camera.
#[derive(Debug, Clone)]
struct BoardPoseCost {
    model: RadTanModel,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for BoardPoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let mut residuals = DVector::zeros(self.image_points.len() * 2);

        for (i, (object, observed)) in self.object_points.iter().zip(&self.image_points).enumerate()
        {
            let in_camera = transform(pose, &object.map(lift::<T>));
            let projected = project(&self.model, &in_camera);
            residuals[i * 2] = projected.x.clone() - lift(observed.x);
            residuals[i * 2 + 1] = projected.y.clone() - lift(observed.y);
        }
        residuals
    }
}

/// Reprojection residuals of one board view seen by both cameras. The
/// parameters are the shared extrinsics and the board pose in the left camera.
#[derive(Debug, Clone)]
struct StereoViewCost {
    left: RadTanModel,
    right: RadTanModel,
    object_points: Vec<Vector3<f64>>,
    left_points: Vec<Vector2<f64>>,
    right_points: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for StereoViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let extrinsics = &params[0];
        let board = &params[1];
        let n = self.object_points.len();
        let mut residuals = DVector::zeros(n * 4);

        for (i, object) in self.object_points.iter().enumerate() {
            let in_left = transform(board, &object.map(lift::<T>));
            let in_right = transform(extrinsics, &in_left);

            let left = project(&self.left, &in_left);
            let right = project(&self.right, &in_right);
            residuals[i * 2] = left.x.clone() - lift(self.left_points[i].x);
            residuals[i * 2 + 1] = left.y.clone() - lift(self.left_points[i].y);
            residuals[(n + i) * 2] = right.x.clone() - lift(self.right_points[i].x);
            residuals[(n + i) * 2 + 1] = right.y.clone() - lift(self.right_points[i].y);
        }
        residuals
    }
}

fn run_levenberg_marquardt(
    problem: &tiny_solver::Problem,
    initial_values: &HashMap<String, DVector<f64>>,
) -> Result<HashMap<String, DVector<f64>>, SolverError> {
    LevenbergMarquardtOptimizer::default()
        .optimize(problem, initial_values, None)
        .ok_or_else(|| SolverError::Failed("Levenberg-Marquardt optimization failed".to_string()))
}

fn take_pose(
    result: &HashMap<String, DVector<f64>>,
    key: &str,
) -> Result<Isometry3<f64>, SolverError> {
    let params = result
        .get(key)
        .ok_or_else(|| SolverError::Failed(format!("optimizer dropped variable {key}")))?;
    params_to_pose(params)
}

fn board_in_camera(pose: &Isometry3<f64>, object_points: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    object_points
        .iter()
        .map(|p| (pose * Point3::from(*p)).coords)
        .collect()
}

/// Board pose of a single view in one camera with fixed intrinsics.
#[derive(Debug, Clone)]
pub struct BoardPoseOptimizationCost {
    model: RadTanModel,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    pose: Isometry3<f64>,
}

impl BoardPoseOptimizationCost {
    pub fn new(
        model: RadTanModel,
        object_points: Vec<Vector3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) -> Self {
        BoardPoseOptimizationCost {
            model,
            object_points,
            image_points,
            pose: Isometry3::identity(),
        }
    }

    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    pub fn reprojection_error(&self) -> Result<ProjectionError, SolverError> {
        let in_camera = board_in_camera(&self.pose, &self.object_points);
        Ok(compute_reprojection_error(
            &self.model,
            &in_camera,
            &self.image_points,
        )?)
    }
}

impl Optimizer for BoardPoseOptimizationCost {
    fn linear_estimation(&mut self) -> Result<(), SolverError> {
        self.pose = board_pose(&self.model, &self.object_points, &self.image_points)?;
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), SolverError> {
        if self.object_points.len() != self.image_points.len() || self.object_points.is_empty() {
            return Err(SolverError::InsufficientData(format!(
                "{} object points and {} image points",
                self.object_points.len(),
                self.image_points.len()
            )));
        }

        let mut problem = tiny_solver::Problem::new();
        let cost = BoardPoseCost {
            model: self.model.clone(),
            object_points: self.object_points.clone(),
            image_points: self.image_points.clone(),
        };
        problem.add_residual_block(self.image_points.len() * 2, &["pose"], Box::new(cost), None);

        let mut initial_values = HashMap::new();
        initial_values.insert("pose".to_string(), pose_to_params(&self.pose));

        let result = run_levenberg_marquardt(&problem, &initial_values)?;
        self.pose = take_pose(&result, "pose")?;

        if verbose {
            info!("Board pose refined: t = {:?}", self.pose.translation.vector.as_slice());
        }
        Ok(())
    }
}

/// Right-from-left extrinsics and per-view board poses of a stereo pair with
/// both cameras' intrinsics held fixed.
#[derive(Debug, Clone)]
pub struct StereoOptimizationCost {
    left: RadTanModel,
    right: RadTanModel,
    object_points: Vec<Vec<Vector3<f64>>>,
    left_points: Vec<Vec<Vector2<f64>>>,
    right_points: Vec<Vec<Vector2<f64>>>,
    extrinsics: Isometry3<f64>,
    board_poses: Vec<Isometry3<f64>>,
}

impl StereoOptimizationCost {
    /// All three point lists hold one entry per view, with matching lengths.
    pub fn new(
        left: RadTanModel,
        right: RadTanModel,
        object_points: Vec<Vec<Vector3<f64>>>,
        left_points: Vec<Vec<Vector2<f64>>>,
        right_points: Vec<Vec<Vector2<f64>>>,
    ) -> Self {
        StereoOptimizationCost {
            left,
            right,
            object_points,
            left_points,
            right_points,
            extrinsics: Isometry3::identity(),
            board_poses: Vec::new(),
        }
    }

    /// Maps left camera coordinates to right camera coordinates.
    pub fn extrinsics(&self) -> &Isometry3<f64> {
        &self.extrinsics
    }

    /// Board pose of every view in the left camera frame.
    pub fn board_poses(&self) -> &[Isometry3<f64>] {
        &self.board_poses
    }

    /// Per-view reprojection errors, left and right camera interleaved.
    pub fn reprojection_errors(&self) -> Result<Vec<ProjectionError>, SolverError> {
        let mut errors = Vec::with_capacity(self.board_poses.len() * 2);
        for (view, pose) in self.board_poses.iter().enumerate() {
            let in_left = board_in_camera(pose, &self.object_points[view]);
            let in_right = board_in_camera(&(self.extrinsics * pose), &self.object_points[view]);
            errors.push(compute_reprojection_error(
                &self.left,
                &in_left,
                &self.left_points[view],
            )?);
            errors.push(compute_reprojection_error(
                &self.right,
                &in_right,
                &self.right_points[view],
            )?);
        }
        Ok(errors)
    }
}

impl Optimizer for StereoOptimizationCost {
    /// Averages the per-view relative transforms `T_r * T_l^-1` of independent
    /// homography poses.
    fn linear_estimation(&mut self) -> Result<(), SolverError> {
        let mut board_poses = Vec::with_capacity(self.object_points.len());
        let mut relative = Vec::with_capacity(self.object_points.len());
        for (view, object) in self.object_points.iter().enumerate() {
            let pose_left = board_pose(&self.left, object, &self.left_points[view])?;
            let pose_right = board_pose(&self.right, object, &self.right_points[view])?;
            relative.push(pose_right * pose_left.inverse());
            board_poses.push(pose_left);
        }

        self.extrinsics = average_poses(&relative)?;
        self.board_poses = board_poses;
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), SolverError> {
        if self.board_poses.len() != self.object_points.len() {
            return Err(SolverError::InsufficientData(
                "no initial board poses, run the linear estimation first".to_string(),
            ));
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert("extrinsics".to_string(), pose_to_params(&self.extrinsics));

        for (view, pose) in self.board_poses.iter().enumerate() {
            let key = format!("board_{view}");
            let cost = StereoViewCost {
                left: self.left.clone(),
                right: self.right.clone(),
                object_points: self.object_points[view].clone(),
                left_points: self.left_points[view].clone(),
                right_points: self.right_points[view].clone(),
            };
            problem.add_residual_block(
                self.object_points[view].len() * 4,
                &["extrinsics", key.as_str()],
                Box::new(cost),
                None,
            );
            initial_values.insert(key, pose_to_params(pose));
        }

        if verbose {
            info!(
                "Starting stereo refinement over {} views with tiny-solver Levenberg-Marquardt...",
                self.board_poses.len()
            );
        }

        let result = run_levenberg_marquardt(&problem, &initial_values)?;
        self.extrinsics = take_pose(&result, "extrinsics")?;
        self.board_poses = (0..self.board_poses.len())
            .map(|view| take_pose(&result, &format!("board_{view}")))
            .collect::<Result<_, _>>()?;

        if verbose {
            info!("Stereo refinement finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::synthetic::SyntheticRig;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn test_transform_matches_isometry() {
        let pose = Isometry3::new(Vector3::new(1.0, -2.0, 300.0), Vector3::new(0.2, -0.1, 0.3));
        let params = pose_to_params(&pose);
        let p = Vector3::new(10.0, 20.0, 0.0);

        let expected = (pose * Point3::from(p)).coords;
        assert_relative_eq!(transform(&params, &p), expected, epsilon = 1e-9);

        let identity = pose_to_params(&Isometry3::translation(0.0, 0.0, 5.0));
        assert_relative_eq!(transform(&identity, &p), p + Vector3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn test_generic_projection_matches_model() {
        let mut model = SyntheticRig::default().left;
        model.distortions = [-0.2, 0.05, 0.001, -0.002, 0.01];
        let p = Vector3::new(40.0, -25.0, 350.0);

        let expected = model.project(&p).unwrap();
        assert_relative_eq!(project(&model, &p), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_board_pose_refinement_recovers_pose() {
        let rig = SyntheticRig::default();
        let sample = rig.sample(3).unwrap();
        let mut cost = BoardPoseOptimizationCost::new(
            rig.left.clone(),
            sample.object_points().to_vec(),
            sample.left_points().to_vec(),
        );

        cost.linear_estimation().unwrap();
        // Start away from the answer so the solver has work to do
        cost.pose = Isometry3::from_parts(
            Translation3::from(cost.pose.translation.vector + Vector3::new(3.0, -2.0, 10.0)),
            cost.pose.rotation * UnitQuaternion::from_euler_angles(0.02, 0.01, -0.02),
        );
        cost.optimize(false).unwrap();

        let expected = rig.board_pose(3);
        assert_relative_eq!(
            cost.pose().translation.vector,
            expected.translation.vector,
            epsilon = 1e-6
        );
        assert!(cost.reprojection_error().unwrap().rmse < 1e-6);
    }

    #[test]
    fn test_optimize_requires_initial_poses() {
        let rig = SyntheticRig::default();
        let samples = rig.samples(2);
        let mut cost = StereoOptimizationCost::new(
            rig.left.clone(),
            rig.right.clone(),
            samples.iter().map(|s| s.object_points().to_vec()).collect(),
            samples.iter().map(|s| s.left_points().to_vec()).collect(),
            samples.iter().map(|s| s.right_points().to_vec()).collect(),
        );
        assert!(matches!(
            cost.optimize(false),
            Err(SolverError::InsufficientData(_))
        ));
    }
}
