use nalgebra::{Vector2, Vector3};

/// One accepted calibration view: board corners in the board frame and their
/// pixels in the left and right image.
///
/// Samples are immutable once captured.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSample {
    object_points: Vec<Vector3<f64>>,
    left_points: Vec<Vector2<f64>>,
    right_points: Vec<Vector2<f64>>,
}

impl CorrespondenceSample {
    pub fn new(
        object_points: Vec<Vector3<f64>>,
        left_points: Vec<Vector2<f64>>,
        right_points: Vec<Vector2<f64>>,
    ) -> Self {
        CorrespondenceSample {
            object_points,
            left_points,
            right_points,
        }
    }

    pub fn object_points(&self) -> &[Vector3<f64>] {
        &self.object_points
    }

    pub fn left_points(&self) -> &[Vector2<f64>] {
        &self.left_points
    }

    pub fn right_points(&self) -> &[Vector2<f64>] {
        &self.right_points
    }

    /// Every channel holds the same number of points.
    pub fn is_consistent(&self) -> bool {
        self.object_points.len() == self.left_points.len()
            && self.object_points.len() == self.right_points.len()
    }
}
