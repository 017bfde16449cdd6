//! Stereo calibration: sample collection, the calibration run and the
//! persisted result.
//!
//! Chessboard pairs go through a [`CorrespondenceCollector`], whose samples
//! feed a [`CalibrationOrchestrator`]. The orchestrator produces an immutable
//! [`CalibrationResult`], saves it through a [`CalibrationStore`] and publishes
//! it as the active calibration.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod collector;
pub mod orchestrator;
pub mod result;
pub mod sample;
pub mod store;

pub use collector::{AcceptOutcome, CollectorError, CorrespondenceCollector};
pub use orchestrator::{
    CalibrationComputeError, CalibrationError, CalibrationHandle, CalibrationInputError,
    CalibrationOrchestrator, CalibrationOutcome, CalibrationSolvers, QualityWarning,
};
pub use result::{CalibrationParts, CalibrationQuality, CalibrationResult, InvalidResult};
pub use sample::CorrespondenceSample;
pub use store::{CalibrationStore, JsonFileStore, MemoryStore, PersistenceError};

/// One side of the stereo rig. The left camera is camera 1 and defines the
/// rig coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Camera {
    Left,
    Right,
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Camera::Left => f.write_str("left"),
            Camera::Right => f.write_str("right"),
        }
    }
}
