//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct, the lens model used by both
//! cameras of a stereo rig. It adheres to the [`CameraModel`] trait defined in
//! the parent `camera` module ([`crate::camera`]).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// This struct holds the intrinsic parameters (focal length, principal point),
/// image resolution, and a set of 5 distortion coefficients that define
/// the radial and tangential distortion characteristics of the camera lens.
///
/// The distortion coefficients are typically denoted as:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use stereo_rig_tools::camera::{Intrinsics, RadTanModel, Resolution};
///
/// let model = RadTanModel::new(
///     Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     Resolution::new(640, 480),
///     [0.1, -0.05, 0.001, 0.001, 0.02],
/// )
/// .unwrap();
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.distortions[0], 0.1); // k1
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

/// On-disk layout of a camera YAML file.
#[derive(Serialize, Deserialize)]
struct CameraYaml {
    cam0: CameraYamlEntry,
}

#[derive(Serialize, Deserialize)]
struct CameraYamlEntry {
    #[serde(default = "default_camera_model_name")]
    camera_model: String,
    intrinsics: Vec<f64>,
    distortion: Vec<f64>,
    resolution: Vec<u32>,
}

fn default_camera_model_name() -> String {
    "rad_tan".to_string()
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`], validating the parameters.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    /// * [`CameraModelError::DistortionMustBeFinite`]
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 5],
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from a camera matrix and a distortion vector.
    pub fn from_camera_matrix(
        k: &Matrix3<f64>,
        distortions: [f64; 5],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        Self::new(Intrinsics::from_camera_matrix(k), resolution, distortions)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    /// Applies radial and tangential distortion to a point on the normalized
    /// image plane.
    pub fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let x = point.x;
        let y = point.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Maps a normalized image point to pixels without applying distortion.
    pub fn to_ideal_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.intrinsics.fx * point.x + self.intrinsics.cx,
            self.intrinsics.fy * point.y + self.intrinsics.cy,
        )
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates, applying distortion.
    ///
    /// Points outside the image bounds are still projected; stereo reprojection
    /// scores them like any other point.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero
    ///   or behind the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let distorted = self.distort(&normalized);

        Ok(self.to_ideal_pixel(&distorted))
    }

    /// Removes intrinsics and distortion from a pixel.
    ///
    /// This method iteratively solves for the undistorted normalized image
    /// coordinates that, when distorted, produce the input `point_2d`, using
    /// Newton's method on the distortion Jacobian.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: If the Jacobian is singular or the
    ///   iteration does not converge.
    fn undistort(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        // Target point on the normalized plane, still distorted
        let target = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );

        let mut point = target;

        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 100;

        for iteration in 0..MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            let error = self.distort(&point) - target;
            if error.norm() < EPS {
                break;
            }

            // d(radial)/dx = (k1 + 2 k2 r^2 + 3 k3 r^4) * 2x, same for y
            let dr_dx = 2.0 * x;
            let dr_dy = 2.0 * y;
            let d_radial_dx = (k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4) * dr_dx;
            let d_radial_dy = (k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4) * dr_dy;

            let j00 = radial + x * d_radial_dx + 2.0 * p1 * y + p2 * (dr_dx + 4.0 * x);
            let j01 = x * d_radial_dy + 2.0 * p1 * x + p2 * dr_dy;
            let j10 = y * d_radial_dx + p1 * dr_dx + 2.0 * p2 * y;
            let j11 = radial + y * d_radial_dy + p1 * (dr_dy + 4.0 * y) + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);

            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;
            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                break;
            }

            if iteration == MAX_ITERATIONS - 1 {
                return Err(CameraModelError::NumericalError(format!(
                    "Undistortion did not converge after {MAX_ITERATIONS} iterations."
                )));
            }
        }

        Ok(point)
    }

    /// Loads RadTan camera parameters from a YAML file.
    ///
    /// The file has a `cam0` block with `intrinsics` (fx, fy, cx, cy),
    /// `resolution` (width, height) and `distortion` (k1, k2, p1, p2, k3).
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: If there's an issue reading the file.
    /// * [`CameraModelError::YamlError`]: If the YAML content is malformed.
    /// * [`CameraModelError::InvalidParams`]: If a block has the wrong number of values.
    /// * Errors from `validate_params` if the loaded parameters are invalid.
    fn load_from_yaml(path: &Path) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let doc: CameraYaml = serde_yaml::from_str(&contents)?;
        let cam = doc.cam0;

        if cam.camera_model != "rad_tan" && cam.camera_model != "pinhole-radtan" {
            return Err(CameraModelError::InvalidParams(format!(
                "Unsupported camera_model '{}'",
                cam.camera_model
            )));
        }

        let [fx, fy, cx, cy]: [f64; 4] = cam.intrinsics.as_slice().try_into().map_err(|_| {
            CameraModelError::InvalidParams(format!(
                "Expected 4 intrinsic parameters in YAML, found {}",
                cam.intrinsics.len()
            ))
        })?;

        let [width, height]: [u32; 2] = cam.resolution.as_slice().try_into().map_err(|_| {
            CameraModelError::InvalidParams(format!(
                "Expected width and height in YAML, found {} values",
                cam.resolution.len()
            ))
        })?;

        let distortions: [f64; 5] = cam.distortion.as_slice().try_into().map_err(|_| {
            CameraModelError::InvalidParams(format!(
                "Expected 5 distortion parameters in YAML, found {}",
                cam.distortion.len()
            ))
        })?;

        Self::new(
            Intrinsics { fx, fy, cx, cy },
            Resolution { width, height },
            distortions,
        )
    }

    /// Saves the camera model's parameters to a YAML file readable by
    /// [`RadTanModel::load_from_yaml()`].
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::YamlError`]: If there's an issue serializing the data to YAML format.
    /// * [`CameraModelError::IOError`]: If there's an issue creating or writing to the file.
    fn save_to_yaml(&self, path: &Path) -> Result<(), CameraModelError> {
        let doc = CameraYaml {
            cam0: CameraYamlEntry {
                camera_model: default_camera_model_name(),
                intrinsics: vec![
                    self.intrinsics.fx,
                    self.intrinsics.fy,
                    self.intrinsics.cx,
                    self.intrinsics.cy,
                ],
                distortion: self.distortions.to_vec(),
                resolution: vec![self.resolution.width, self.resolution.height],
            },
        };

        let yaml_string = serde_yaml::to_string(&doc)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, yaml_string)?;

        Ok(())
    }

    /// Validates the intrinsic parameters and distortion coefficients.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    /// Coefficients in the order `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel::new(
            Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            Resolution::new(752, 480),
            [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_radtan_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rad_tan.yaml");
        fs::write(
            &path,
            "cam0:\n  camera_model: rad_tan\n  intrinsics: [461.629, 460.152, 362.680, 246.049]\n  \
             distortion: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0]\n  \
             resolution: [752, 480]\n",
        )
        .unwrap();

        let model = RadTanModel::load_from_yaml(&path).unwrap();
        assert_eq!(model, sample_model());
    }

    #[test]
    fn test_radtan_load_rejects_short_distortion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(
            &path,
            "cam0:\n  intrinsics: [500.0, 500.0, 320.0, 240.0]\n  distortion: [0.1, 0.0]\n  resolution: [640, 480]\n",
        )
        .unwrap();

        let err = RadTanModel::load_from_yaml(&path).unwrap_err();
        assert!(matches!(err, CameraModelError::InvalidParams(_)));
    }

    #[test]
    fn test_radtan_save_to_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("nested").join("rad_tan_saved.yaml");

        let model = sample_model();
        model.save_to_yaml(&output_path).unwrap();
        let saved_model = RadTanModel::load_from_yaml(&output_path).unwrap();

        assert_eq!(model, saved_model);
    }

    #[test]
    fn test_radtan_project_undistort() {
        let model = sample_model();

        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let point_2d = model.project(&point_3d).unwrap();

        let normalized = model.undistort(&point_2d).unwrap();
        assert_relative_eq!(normalized.x, 0.25, epsilon = 1e-9);
        assert_relative_eq!(normalized.y, -0.15, epsilon = 1e-9);

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-9);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();

        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 1.0),
            Vector3::new(-0.5, 0.0, 1.0),
            Vector3::new(0.0, 0.5, 1.0),
            Vector3::new(0.0, -0.5, 1.0),
            Vector3::new(0.3, 0.4, 1.0),
            Vector3::new(-0.3, -0.4, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for (i, original_point) in test_points.iter().enumerate() {
            let pixel_point = model.project(original_point).unwrap();
            let ray_direction = model.unproject(&pixel_point).unwrap();

            let dot_product = original_point.normalize().dot(&ray_direction);
            assert!(
                dot_product > 0.999_999,
                "Test point {i}: direction mismatch, dot product {dot_product}"
            );
        }
    }

    #[test]
    fn test_radtan_zero_distortion_is_pinhole() {
        let model = RadTanModel::new(
            Intrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution::new(640, 480),
            [0.0; 5],
        )
        .unwrap();

        let pixel = model.project(&Vector3::new(0.1, -0.05, 1.0)).unwrap();
        assert_relative_eq!(pixel, Vector2::new(400.0, 200.0), epsilon = 1e-12);
        assert!(model.project(&Vector3::new(0.0, 0.0, -1.0)).is_err());
    }
}
