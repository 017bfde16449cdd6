//! Stereo Rig Tools Library
//!
//! Calibrate a two-camera rig from chessboard observations and localize
//! fiducial markers with the result. The library covers:
//! - Camera sessions: async connect with retry, timeout and cancellation
//! - Correspondence collection from synchronized frame pairs
//! - Stereo calibration with a persisted, validated result
//! - Marker triangulation with outlier-rejecting distance smoothing
//!
//! Low-level vision (corner and marker detection, intrinsic estimation) and
//! capture hardware plug in through traits. The [`synthetic`] module provides
//! in-memory implementations for tests and demos.

pub mod calibration;
pub mod camera;
pub mod config;
pub mod device;
pub mod events;
pub mod geometry;
pub mod localization;
pub mod solver;
pub mod synthetic;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};

pub use calibration::{
    CalibrationError, CalibrationHandle, CalibrationOrchestrator, CalibrationOutcome,
    CalibrationQuality, CalibrationResult, CalibrationSolvers, Camera, CorrespondenceCollector,
    CorrespondenceSample, JsonFileStore,
};
pub use config::RigConfig;
pub use device::{CameraSessionManager, ConnectionState, FrameSample, SessionError, StereoFrame};
pub use events::{EventBus, RigEvent};
pub use localization::{Confidence, MarkerLocalization, MarkerLocalizationEngine};
pub use solver::BoardPattern;
