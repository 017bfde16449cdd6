//! Capture devices and the camera session lifecycle.
//!
//! The hardware itself sits behind [`DeviceBackend`] and [`CaptureDevice`].
//! [`CameraSessionManager`] owns the opened devices and drives the
//! connect / disconnect state machine for every camera id.

use crate::camera::Resolution;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod cancel;
pub mod session;

pub use cancel::CancelToken;
pub use session::{CameraSessionManager, SessionError};

pub type CameraId = u32;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("device {0} could not be opened: {1}")]
    OpenFailed(CameraId, String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("resolution {0} is not supported")]
    UnsupportedResolution(Resolution),
    #[error("device is closed")]
    Closed,
}

/// One opened capture device.
pub trait CaptureDevice: Send {
    /// Whether the device reports itself ready for reading.
    fn is_open(&self) -> bool;

    /// Grabs the current frame. An empty image means the device produced no data.
    fn read(&mut self) -> Result<DynamicImage, CaptureError>;

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CaptureError>;

    fn resolution(&self) -> Resolution;

    /// Releases the native resource. Called exactly once, by [`DeviceGuard`].
    fn release(&mut self);
}

/// Opens capture devices by id.
pub trait DeviceBackend: Send + Sync {
    fn open(&self, id: CameraId) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    fn device_name(&self, id: CameraId) -> String {
        format!("Camera {id}")
    }
}

/// Owns an opened device and releases it when dropped.
pub struct DeviceGuard {
    camera_id: CameraId,
    device: Box<dyn CaptureDevice>,
}

impl DeviceGuard {
    pub fn new(camera_id: CameraId, device: Box<dyn CaptureDevice>) -> Self {
        DeviceGuard { camera_id, device }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn device(&self) -> &dyn CaptureDevice {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut dyn CaptureDevice {
        self.device.as_mut()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.device.release();
        debug!("Released capture device for camera {}", self.camera_id);
    }
}

impl fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("camera_id", &self.camera_id)
            .field("resolution", &self.device.resolution())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Snapshot of one camera's session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraHandle {
    pub id: CameraId,
    pub state: ConnectionState,
    pub resolution: Resolution,
    pub capture_active: bool,
}

impl CameraHandle {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// A device found by probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: CameraId,
    pub name: String,
    pub available: bool,
    pub connected: bool,
    pub resolution: Option<Resolution>,
}

/// One frame pulled from a camera.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub camera_id: CameraId,
    pub image: Arc<DynamicImage>,
    pub timestamp: DateTime<Utc>,
}

impl FrameSample {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image.width(), self.image.height())
    }

    pub fn is_empty(&self) -> bool {
        self.resolution().is_empty()
    }
}

/// Left and right frames pulled for the same instant.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub left: FrameSample,
    pub right: FrameSample,
}

impl StereoFrame {
    pub fn new(left: FrameSample, right: FrameSample) -> Self {
        StereoFrame { left, right }
    }

    /// Both frames carry image data.
    pub fn is_valid(&self) -> bool {
        !self.left.is_empty() && !self.right.is_empty()
    }

    /// Capture time of the pair, the later of the two frame timestamps.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.left.timestamp.max(self.right.timestamp)
    }
}

pub(crate) fn image_is_empty(image: &DynamicImage) -> bool {
    image.width() == 0 || image.height() == 0
}
