//! Plane-induced homographies and planar pose recovery.
//!
//! The homography `H` maps board points on the plane `Z = 0` to image points:
//! `x' ~ H x`. With image points on the normalized plane the camera matrix
//! passed to [`planar_pose_from_homography`] is the identity.

use super::GeometryError;
use nalgebra::{
    DMatrix, Isometry3, Matrix3, Quaternion, Rotation3, Translation3, UnitQuaternion, Vector2,
    Vector3, Vector4,
};

/// Hartley normalization: zero mean, average distance `sqrt(2)` from the origin.
///
/// Returns the normalized points and the similarity transform that produced them.
pub fn normalize_points_2d(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        s, 0.0, -s * centroid.x, //
        0.0, s, -s * centroid.y, //
        0.0, 0.0, 1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * s).collect();
    Some((normalized, t))
}

/// Estimate `H` such that `image ~ H * world` using the normalized DLT.
///
/// The returned homography is scaled so that `H[2,2] == 1` when possible.
pub fn homography_dlt(
    world: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    let n = world.len();
    if image.len() != n {
        return Err(GeometryError::MismatchedLengths(n, image.len()));
    }
    if n < 4 {
        return Err(GeometryError::TooFewPoints { needed: 4, got: n });
    }

    let degenerate = || GeometryError::Degenerate("coincident points in homography".to_string());
    let (world_n, t_w) = normalize_points_2d(world).ok_or_else(degenerate)?;
    let (image_n, t_i) = normalize_points_2d(image).ok_or_else(degenerate)?;

    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (pw, pi)) in world_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (pw.x, pw.y, pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Null vector of A: right singular vector of the smallest singular value.
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("homography"))?;
    let smallest = svd.singular_values.imin();
    let h_vec = v_t.row(smallest);

    let h_n = Matrix3::from_fn(|r, c| h_vec[3 * r + c]);
    let t_i_inv = t_i
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("normalization is singular".to_string()))?;
    let mut h = t_i_inv * h_n * t_w;

    let scale = h[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h /= scale;
    }
    Ok(h)
}

/// Decompose a homography into the pose of a planar board (`Z = 0`) in the
/// camera frame, given camera matrix `k`.
///
/// The rotation is projected onto SO(3) and the board is placed in front of
/// the camera (`t.z > 0`).
pub fn planar_pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<Isometry3<f64>, GeometryError> {
    let degenerate = || GeometryError::Degenerate("homography has no planar pose".to_string());

    let k_inv = k
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("camera matrix is singular".to_string()))?;

    let k_inv_h1 = k_inv * h.column(0);
    let k_inv_h2 = k_inv * h.column(1);
    let k_inv_h3 = k_inv * h.column(2);

    let norm1 = k_inv_h1.norm();
    let norm2 = k_inv_h2.norm();
    if norm1 <= 1e-12 || norm2 <= 1e-12 {
        return Err(degenerate());
    }
    let lambda = 2.0 / (norm1 + norm2);

    let mut r1 = k_inv_h1 * lambda;
    let mut r2 = k_inv_h2 * lambda;
    let mut t = k_inv_h3 * lambda;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(degenerate());
    }

    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // Closest rotation (polar decomposition)
    let svd = r.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed("planar pose"))?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed("planar pose"))?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    Ok(isometry_from_parts(&r_orth, &t))
}

/// Builds an isometry from a rotation matrix and a translation.
pub fn isometry_from_parts(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Isometry3<f64> {
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
    Isometry3::from_parts(Translation3::from(*translation), q)
}

/// Averages rigid transforms: arithmetic mean of translations, normalized
/// mean of hemisphere-aligned quaternions for rotations.
pub fn average_poses(poses: &[Isometry3<f64>]) -> Result<Isometry3<f64>, GeometryError> {
    let Some(first) = poses.first() else {
        return Err(GeometryError::TooFewPoints { needed: 1, got: 0 });
    };

    let n = poses.len() as f64;
    let t_avg = poses
        .iter()
        .fold(Vector3::zeros(), |acc, iso| acc + iso.translation.vector)
        / n;

    let q0 = first.rotation.coords;
    let acc = poses.iter().fold(Vector4::zeros(), |acc, iso| {
        let coords = iso.rotation.coords;
        if q0.dot(&coords) < 0.0 {
            acc - coords
        } else {
            acc + coords
        }
    });

    let rotation = if acc.norm_squared() == 0.0 {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_quaternion(Quaternion::from_vector(acc / n))
    };

    Ok(Isometry3::from_parts(Translation3::from(t_avg), rotation))
}
