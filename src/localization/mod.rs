//! Stereo localization of fiducial markers.
//!
//! Markers seen by both cameras are triangulated with the active calibration
//! and their distance is smoothed over the last few frames per marker id.

use crate::camera::CameraModelError;
use crate::geometry::GeometryError;
use image::DynamicImage;
use nalgebra::{Vector2, Vector3};

pub mod engine;
pub mod track;

pub use engine::MarkerLocalizationEngine;
pub use track::{MarkerTrack, TrackUpdate};

pub type MarkerId = u32;

/// One decoded marker in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerObservation {
    pub id: MarkerId,
    pub corners: [Vector2<f64>; 4],
}

impl MarkerObservation {
    pub fn new(id: MarkerId, corners: [Vector2<f64>; 4]) -> Self {
        MarkerObservation { id, corners }
    }

    /// Centroid of the four corners.
    pub fn center(&self) -> Vector2<f64> {
        self.corners.iter().sum::<Vector2<f64>>() / 4.0
    }
}

/// Finds and decodes markers in an image.
pub trait MarkerDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Vec<MarkerObservation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    /// Reprojection error above the configured threshold.
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerLocalization {
    pub marker_id: MarkerId,
    /// Smoothed distance from the rig.
    pub distance: f64,
    /// Distance measured in this frame alone.
    pub raw_distance: f64,
    /// Triangulated position in left camera coordinates.
    pub position: Vector3<f64>,
    /// Mean reprojection error over both cameras, in pixels.
    pub reprojection_error: f64,
    pub confidence: Confidence,
    /// The raw distance was an outlier and did not enter the smoothing history.
    pub outlier_rejected: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum LocalizationError {
    #[error("No active calibration")]
    NotCalibrated,
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Depth {depth:.3} outside the accepted range")]
    OutOfRange { depth: f64 },
}
