//! Per-frame marker triangulation.
//!
//! For every marker id seen by both cameras the corner centroids are
//! undistorted, triangulated with the stereo extrinsics and checked for
//! degenerate geometry. Results carry a reprojection score and a smoothed
//! distance. A degenerate marker only drops out of the current frame.

use super::{
    Confidence, LocalizationError, MarkerDetector, MarkerId, MarkerLocalization,
    MarkerObservation, MarkerTrack,
};
use crate::calibration::{CalibrationHandle, CalibrationResult, Camera};
use crate::camera::{CameraModel, RadTanModel};
use crate::config::LocalizationConfig;
use crate::device::StereoFrame;
use crate::events::{EventBus, RigEvent};
use crate::geometry::{
    project_normalized, projection_matrix, resolve_homogeneous, triangulate_dlt, GeometryError,
};
use image::DynamicImage;
use log::debug;
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3, Vector4};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Calibration data prepared once per frame.
struct StereoGeometry {
    left: RadTanModel,
    right: RadTanModel,
    p_left: Matrix3x4<f64>,
    p_right: Matrix3x4<f64>,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl StereoGeometry {
    fn new(calibration: &CalibrationResult) -> Result<Self, LocalizationError> {
        Ok(StereoGeometry {
            left: calibration.camera_model(Camera::Left)?,
            right: calibration.camera_model(Camera::Right)?,
            p_left: projection_matrix(&Matrix3::identity(), &Vector3::zeros()),
            p_right: projection_matrix(calibration.rotation(), calibration.translation()),
            rotation: *calibration.rotation(),
            translation: *calibration.translation(),
        })
    }
}

struct Triangulated {
    position: Vector3<f64>,
    reprojection_error: f64,
    distance: f64,
}

/// Normalized-plane residual expressed in ideal-image pixels.
fn pixel_residual(model: &RadTanModel, residual: &Vector2<f64>) -> f64 {
    Vector2::new(
        residual.x * model.intrinsics.fx,
        residual.y * model.intrinsics.fy,
    )
    .norm()
}

pub struct MarkerLocalizationEngine {
    config: LocalizationConfig,
    calibration: CalibrationHandle,
    detector: Arc<dyn MarkerDetector>,
    events: EventBus,
    tracks: HashMap<MarkerId, MarkerTrack>,
}

impl MarkerLocalizationEngine {
    pub fn new(
        config: LocalizationConfig,
        calibration: CalibrationHandle,
        detector: Arc<dyn MarkerDetector>,
        events: EventBus,
    ) -> Self {
        MarkerLocalizationEngine {
            config,
            calibration,
            detector,
            events,
            tracks: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }

    /// Smoothing history of one marker, if it has been seen this session.
    pub fn track(&self, id: MarkerId) -> Option<&MarkerTrack> {
        self.tracks.get(&id)
    }

    pub fn reset_tracks(&mut self) {
        self.tracks.clear();
    }

    /// Detects markers in a synchronized pair and localizes them with the
    /// active calibration.
    pub fn process_pair(
        &mut self,
        left: &DynamicImage,
        right: &DynamicImage,
    ) -> Result<Vec<MarkerLocalization>, LocalizationError> {
        let calibration = self
            .calibration
            .current()
            .ok_or(LocalizationError::NotCalibrated)?;
        let left_markers = self.detector.detect(left);
        let right_markers = self.detector.detect(right);
        self.localize(&calibration, &left_markers, &right_markers)
    }

    pub fn process_stereo(
        &mut self,
        frame: &StereoFrame,
    ) -> Result<Vec<MarkerLocalization>, LocalizationError> {
        self.process_pair(&frame.left.image, &frame.right.image)
    }

    /// Localizes already detected markers. Results are ordered by marker id.
    pub fn localize(
        &mut self,
        calibration: &CalibrationResult,
        left: &[MarkerObservation],
        right: &[MarkerObservation],
    ) -> Result<Vec<MarkerLocalization>, LocalizationError> {
        let geometry = StereoGeometry::new(calibration)?;

        let mut left_by_id = BTreeMap::new();
        for marker in left {
            left_by_id.entry(marker.id).or_insert(marker);
        }
        let mut right_by_id = HashMap::new();
        for marker in right {
            right_by_id.entry(marker.id).or_insert(marker);
        }

        let mut results = Vec::new();
        for (id, left_marker) in left_by_id {
            let Some(right_marker) = right_by_id.get(&id) else {
                continue;
            };
            let triangulated =
                match self.triangulate(&geometry, &left_marker.center(), &right_marker.center()) {
                    Ok(triangulated) => triangulated,
                    Err(err) => {
                        debug!("Skipping marker {id} this frame: {err}");
                        continue;
                    }
                };

            let confidence = if triangulated.reprojection_error > self.config.reprojection_threshold
            {
                Confidence::Low
            } else {
                Confidence::High
            };

            let capacity = self.config.history_capacity;
            let deviation = self.config.outlier_deviation;
            let update = self
                .tracks
                .entry(id)
                .or_insert_with(|| MarkerTrack::new(capacity, deviation))
                .push(triangulated.distance);
            if !update.accepted {
                debug!(
                    "Marker {id}: distance {:.3} rejected as outlier, keeping {:.3}",
                    triangulated.distance, update.smoothed
                );
            }

            let localization = MarkerLocalization {
                marker_id: id,
                distance: update.smoothed,
                raw_distance: triangulated.distance,
                position: triangulated.position,
                reprojection_error: triangulated.reprojection_error,
                confidence,
                outlier_rejected: !update.accepted,
            };
            self.events
                .publish(RigEvent::MarkerLocalized(localization.clone()));
            results.push(localization);
        }

        Ok(results)
    }

    fn triangulate(
        &self,
        geometry: &StereoGeometry,
        left_pixel: &Vector2<f64>,
        right_pixel: &Vector2<f64>,
    ) -> Result<Triangulated, LocalizationError> {
        let x_left = geometry.left.undistort(left_pixel)?;
        let x_right = geometry.right.undistort(right_pixel)?;

        let homogeneous = triangulate_dlt(&geometry.p_left, &geometry.p_right, &x_left, &x_right)?;
        self.locate(geometry, &homogeneous, &x_left, &x_right)
    }

    /// Turns a homogeneous triangulation into a scored 3D point. A vector and
    /// its negation give the same result.
    fn locate(
        &self,
        geometry: &StereoGeometry,
        homogeneous: &Vector4<f64>,
        x_left: &Vector2<f64>,
        x_right: &Vector2<f64>,
    ) -> Result<Triangulated, LocalizationError> {
        let position = resolve_homogeneous(homogeneous, self.config.min_homogeneous_scale)?;

        let (reprojected_left, depth_left) = project_normalized(&geometry.p_left, &position);
        let (reprojected_right, depth_right) = project_normalized(&geometry.p_right, &position);
        if depth_left <= 0.0 {
            return Err(GeometryError::BehindCamera {
                camera: 0,
                depth: depth_left,
            }
            .into());
        }
        if depth_right <= 0.0 {
            return Err(GeometryError::BehindCamera {
                camera: 1,
                depth: depth_right,
            }
            .into());
        }
        let below = self.config.min_depth.is_some_and(|min| depth_left < min);
        let above = self.config.max_depth.is_some_and(|max| depth_left > max);
        if below || above {
            return Err(LocalizationError::OutOfRange { depth: depth_left });
        }

        let reprojection_error = (pixel_residual(&geometry.left, &(reprojected_left - x_left))
            + pixel_residual(&geometry.right, &(reprojected_right - x_right)))
            / 2.0;

        let in_right = geometry.rotation * position + geometry.translation;
        let distance = (position.norm() + in_right.norm()) / 2.0;

        Ok(Triangulated {
            position,
            reprojection_error,
            distance,
        })
    }
}
