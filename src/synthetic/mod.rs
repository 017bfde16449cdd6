//! Synthetic stand-ins for the hardware and vision collaborators.
//!
//! [`SyntheticRig`] is a stereo pair with known intrinsics and extrinsics that
//! renders exact chessboard and marker observations. The scripted detectors
//! replay queued detections, and [`FakeBackend`] provides in-memory capture
//! devices that count how often they were opened and released.

use crate::calibration::{CalibrationParts, CalibrationResult, CorrespondenceSample, InvalidResult};
use crate::camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
use crate::device::{CameraId, CaptureDevice, CaptureError, DeviceBackend};
use crate::geometry::{essential_matrix, fundamental_matrix};
use crate::localization::{MarkerDetector, MarkerId, MarkerObservation};
use crate::solver::{BoardDetector, BoardPattern};
use chrono::Utc;
use image::{DynamicImage, GrayImage, Luma};
use nalgebra::{
    Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A stereo rig with exactly known calibration.
///
/// A point `X` in left camera coordinates is `rotation * X + translation` in
/// right camera coordinates.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    pub left: RadTanModel,
    pub right: RadTanModel,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub pattern: BoardPattern,
}

impl Default for SyntheticRig {
    fn default() -> Self {
        let resolution = Resolution::new(640, 480);
        SyntheticRig {
            left: RadTanModel {
                intrinsics: Intrinsics {
                    fx: 800.0,
                    fy: 800.0,
                    cx: 320.0,
                    cy: 240.0,
                },
                resolution,
                distortions: [0.0; 5],
            },
            right: RadTanModel {
                intrinsics: Intrinsics {
                    fx: 810.0,
                    fy: 805.0,
                    cx: 328.0,
                    cy: 236.0,
                },
                resolution,
                distortions: [0.0; 5],
            },
            rotation: *Rotation3::from_euler_angles(0.01, -0.03, 0.005).matrix(),
            translation: Vector3::new(-120.0, 0.8, 1.5),
            pattern: BoardPattern::default(),
        }
    }
}

impl SyntheticRig {
    pub fn image_size(&self) -> Resolution {
        self.left.resolution
    }

    /// Board pose in the left camera frame for view `index`. Views differ in
    /// tilt, offset and distance, and keep the board in front of both cameras.
    pub fn board_pose(&self, index: usize) -> Isometry3<f64> {
        let i = index as f64;
        let rotation = UnitQuaternion::from_euler_angles(
            0.35 * (1.3 * i + 0.4).sin(),
            0.35 * (0.7 * i + 1.1).cos(),
            0.15 * (2.1 * i).sin(),
        );
        let columns = f64::from(self.pattern.columns.saturating_sub(1));
        let rows = f64::from(self.pattern.rows.saturating_sub(1));
        let half_board = Vector3::new(columns, rows, 0.0) * self.pattern.square_size / 2.0;
        // Aim the board centre between the two cameras
        let centre = Vector3::new(
            60.0 + 10.0 * (0.9 * i).sin(),
            12.0 * (1.1 * i).cos(),
            380.0 + 25.0 * (index % 5) as f64,
        );
        let translation = centre - rotation * half_board;
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }

    /// Projects a left-camera point into both images.
    pub fn project_pair(
        &self,
        point: &Vector3<f64>,
    ) -> Result<(Vector2<f64>, Vector2<f64>), CameraModelError> {
        let in_right = self.rotation * point + self.translation;
        Ok((self.left.project(point)?, self.right.project(&in_right)?))
    }

    /// One exact correspondence sample for view `index`.
    pub fn sample(&self, index: usize) -> Result<CorrespondenceSample, CameraModelError> {
        let pose = self.board_pose(index);
        let object = self.pattern.object_points();
        let mut left = Vec::with_capacity(object.len());
        let mut right = Vec::with_capacity(object.len());
        for p in &object {
            let (l, r) = self.project_pair(&(pose * Point3::from(*p)).coords)?;
            left.push(l);
            right.push(r);
        }
        Ok(CorrespondenceSample::new(object, left, right))
    }

    /// The first `count` views that project cleanly into both cameras.
    pub fn samples(&self, count: usize) -> Vec<CorrespondenceSample> {
        (0..count * 4)
            .filter_map(|index| self.sample(index).ok())
            .take(count)
            .collect()
    }

    /// The rig's true calibration, as if solved without error.
    pub fn calibration_result(&self) -> Result<CalibrationResult, InvalidResult> {
        let k_left = self.left.camera_matrix();
        let k_right = self.right.camera_matrix();
        let essential = essential_matrix(&self.rotation, &self.translation);
        // A singular camera matrix has no finite fundamental matrix
        let fundamental = fundamental_matrix(&essential, &k_left, &k_right)
            .map_err(|_| InvalidResult::NonFinite("fundamental matrix"))?;

        CalibrationResult::new(CalibrationParts {
            camera_matrix_left: k_left,
            distortion_left: self.left.distortions,
            camera_matrix_right: k_right,
            distortion_right: self.right.distortions,
            rotation: self.rotation,
            translation: self.translation,
            essential,
            fundamental,
            rms: 0.0,
            rms_left: 0.0,
            rms_right: 0.0,
            image_size: self.image_size(),
            sample_count: 0,
            created_at: Utc::now(),
        })
    }

    /// Observations of a marker centred on `point` (left camera coordinates).
    /// The corners sit `half_size` pixels around the projected centre, so
    /// their centroid is exactly the projection.
    pub fn marker_observations(
        &self,
        id: MarkerId,
        point: &Vector3<f64>,
        half_size: f64,
    ) -> Result<(MarkerObservation, MarkerObservation), CameraModelError> {
        let (left, right) = self.project_pair(point)?;
        let square = |c: Vector2<f64>| {
            [
                Vector2::new(c.x - half_size, c.y - half_size),
                Vector2::new(c.x + half_size, c.y - half_size),
                Vector2::new(c.x + half_size, c.y + half_size),
                Vector2::new(c.x - half_size, c.y + half_size),
            ]
        };
        Ok((
            MarkerObservation::new(id, square(left)),
            MarkerObservation::new(id, square(right)),
        ))
    }
}

/// Board detector that replays queued results, one per `detect` call.
#[derive(Debug, Default)]
pub struct ScriptedBoardDetector {
    script: Mutex<VecDeque<Option<Vec<Vector2<f64>>>>>,
}

impl ScriptedBoardDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the results for the next left and right frame.
    pub fn push(&self, left: Option<Vec<Vector2<f64>>>, right: Option<Vec<Vector2<f64>>>) {
        let mut script = lock(&self.script);
        script.push_back(left);
        script.push_back(right);
    }

    pub fn push_sample(&self, sample: &CorrespondenceSample) {
        self.push(
            Some(sample.left_points().to_vec()),
            Some(sample.right_points().to_vec()),
        );
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

impl BoardDetector for ScriptedBoardDetector {
    fn detect(&self, _image: &DynamicImage, _pattern: &BoardPattern) -> Option<Vec<Vector2<f64>>> {
        lock(&self.script).pop_front().flatten()
    }
}

/// Marker detector that replays queued results; an empty queue detects nothing.
#[derive(Debug, Default)]
pub struct ScriptedMarkerDetector {
    script: Mutex<VecDeque<Vec<MarkerObservation>>>,
}

impl ScriptedMarkerDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the markers for the next left and right frame.
    pub fn push(&self, left: Vec<MarkerObservation>, right: Vec<MarkerObservation>) {
        let mut script = lock(&self.script);
        script.push_back(left);
        script.push_back(right);
    }
}

impl MarkerDetector for ScriptedMarkerDetector {
    fn detect(&self, _image: &DynamicImage) -> Vec<MarkerObservation> {
        lock(&self.script).pop_front().unwrap_or_default()
    }
}

/// Behaviour of one in-memory capture device.
#[derive(Debug, Clone)]
pub struct FakeDeviceSpec {
    ready_after: u32,
    empty_frames: bool,
    open_delay: Duration,
    native_resolution: Resolution,
}

impl FakeDeviceSpec {
    /// A device that reports ready on poll number `polls + 1`.
    pub fn ready_after(polls: u32) -> Self {
        FakeDeviceSpec {
            ready_after: polls,
            empty_frames: false,
            open_delay: Duration::ZERO,
            native_resolution: Resolution::new(1280, 720),
        }
    }

    /// A device that opens and reports ready but only delivers empty frames.
    pub fn empty_frames() -> Self {
        FakeDeviceSpec {
            empty_frames: true,
            ..Self::ready_after(0)
        }
    }

    /// Blocks inside `open` for `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_native_resolution(mut self, resolution: Resolution) -> Self {
        self.native_resolution = resolution;
        self
    }
}

struct FakeDevice {
    spec: FakeDeviceSpec,
    polls: AtomicU32,
    resolution: Resolution,
    frame: u8,
    released: Arc<AtomicUsize>,
}

impl CaptureDevice for FakeDevice {
    fn is_open(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst) + 1 > self.spec.ready_after
    }

    fn read(&mut self) -> Result<DynamicImage, CaptureError> {
        if self.spec.empty_frames {
            return Ok(DynamicImage::new_luma8(0, 0));
        }
        self.frame = self.frame.wrapping_add(1);
        let image = GrayImage::from_pixel(
            self.resolution.width,
            self.resolution.height,
            Luma([self.frame]),
        );
        Ok(DynamicImage::ImageLuma8(image))
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CaptureError> {
        if resolution.is_empty() {
            return Err(CaptureError::UnsupportedResolution(resolution));
        }
        self.resolution = resolution;
        Ok(())
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory device backend. Clones share devices and counters.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    devices: Arc<Mutex<HashMap<CameraId, FakeDeviceSpec>>>,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, id: CameraId, spec: FakeDeviceSpec) {
        lock(&self.devices).insert(id, spec);
    }

    pub fn remove_device(&self, id: CameraId) {
        lock(&self.devices).remove(&id);
    }

    /// Devices opened successfully so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Devices released so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for FakeBackend {
    fn open(&self, id: CameraId) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let spec = lock(&self.devices).get(&id).cloned();
        let spec = spec.ok_or_else(|| CaptureError::OpenFailed(id, "no such device".to_string()))?;
        if !spec.open_delay.is_zero() {
            std::thread::sleep(spec.open_delay);
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            resolution: spec.native_resolution,
            spec,
            polls: AtomicU32::new(0),
            frame: 0,
            released: Arc::clone(&self.released),
        }))
    }

    fn device_name(&self, id: CameraId) -> String {
        format!("Synthetic camera {id}")
    }
}
