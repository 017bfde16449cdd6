//! Two-view geometry on the normalized image plane.
//!
//! Triangulation, homogeneous-point handling and the epipolar matrices of a
//! calibrated stereo pair. Planar homographies and pose helpers live in
//! [`planar`].

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3, Vector4};

pub mod planar;

pub use planar::{average_poses, homography_dlt, planar_pose_from_homography};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("need at least {needed} points, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("mismatched point counts: {0} vs {1}")]
    MismatchedLengths(usize, usize),
    #[error("homogeneous scale {0:e} is too close to zero")]
    DegenerateScale(f64),
    #[error("point lies behind camera {camera} (depth {depth})")]
    BehindCamera { camera: usize, depth: f64 },
    #[error("degenerate configuration: {0}")]
    Degenerate(String),
    #[error("svd failed: {0}")]
    SvdFailed(&'static str),
}

/// Cross-product matrix `[v]x`, so that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// `[R | t]` as a 3x4 projection matrix on the normalized image plane.
pub fn projection_matrix(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    p.set_column(3, translation);
    p
}

/// Essential matrix `E = [t]x R`.
pub fn essential_matrix(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

/// Fundamental matrix `F = K2^-T E K1^-1`, mapping left pixels to right epipolar lines.
pub fn fundamental_matrix(
    essential: &Matrix3<f64>,
    k_left: &Matrix3<f64>,
    k_right: &Matrix3<f64>,
) -> Result<Matrix3<f64>, GeometryError> {
    let k1_inv = k_left
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("left camera matrix is singular".to_string()))?;
    let k2_inv = k_right
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("right camera matrix is singular".to_string()))?;
    Ok(k2_inv.transpose() * essential * k1_inv)
}

/// Linear two-view triangulation using DLT.
///
/// `p1` and `p2` are projection matrices, `x1` and `x2` the corresponding
/// points in the same (normalized) image space. The homogeneous solution is
/// returned as-is: its scale component may be negative or close to zero, see
/// [`resolve_homogeneous`].
pub fn triangulate_dlt(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Result<Vector4<f64>, GeometryError> {
    let mut a = Matrix4::<f64>::zeros();
    a.row_mut(0).copy_from(&(p1.row(2) * x1.x - p1.row(0)));
    a.row_mut(1).copy_from(&(p1.row(2) * x1.y - p1.row(1)));
    a.row_mut(2).copy_from(&(p2.row(2) * x2.x - p2.row(0)));
    a.row_mut(3).copy_from(&(p2.row(2) * x2.y - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(GeometryError::SvdFailed("triangulation"))?;
    let smallest = svd.singular_values.imin();

    Ok(v_t.row(smallest).transpose())
}

/// Converts a homogeneous point to Euclidean coordinates.
///
/// A homogeneous point and its negation are the same projective point, so a
/// negative scale is flipped before dividing. A scale whose magnitude is at or
/// below `min_scale` marks a point at (or near) infinity and is rejected.
pub fn resolve_homogeneous(
    point: &Vector4<f64>,
    min_scale: f64,
) -> Result<Vector3<f64>, GeometryError> {
    let w = point.w;
    if !w.is_finite() || w.abs() <= min_scale {
        return Err(GeometryError::DegenerateScale(w));
    }

    let point = if w < 0.0 { -point } else { *point };
    Ok(point.xyz() / point.w)
}

/// Projects a point through `p`, returning the normalized image point and its depth.
pub fn project_normalized(p: &Matrix3x4<f64>, point: &Vector3<f64>) -> (Vector2<f64>, f64) {
    let x = p * point.push(1.0);
    (Vector2::new(x.x / x.z, x.y / x.z), x.z)
}

/// Whether `r` is orthonormal with determinant +1, within `tolerance`.
pub fn is_rotation(r: &Matrix3<f64>, tolerance: f64) -> bool {
    let orthogonality = (r.transpose() * r - Matrix3::identity()).norm();
    orthogonality <= tolerance && (r.determinant() - 1.0).abs() <= tolerance
}
