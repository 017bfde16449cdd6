//! Runs stereo calibration over collected samples and manages the active result.
//!
//! The active result lives behind a [`CalibrationHandle`]: readers clone the
//! `Arc` they find there and keep using it, while a finished calibration swaps
//! in a new one. A failed attempt never touches the active result.

use super::result::{CalibrationParts, CalibrationQuality, CalibrationResult, InvalidResult};
use super::sample::CorrespondenceSample;
use super::store::{CalibrationStore, PersistenceError};
use super::Camera;
use crate::camera::{RadTanModel, Resolution};
use crate::config::CalibrationConfig;
use crate::events::{EventBus, RigEvent};
use crate::solver::{
    FixedIntrinsicsStereoCalibrator, MonoCalibrator, PriorIntrinsicsCalibrator, SolverError,
    StereoCalibrator,
};
use chrono::Utc;
use log::{info, warn};
use std::sync::{Arc, RwLock};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationInputError {
    #[error("{got} samples collected, at least {needed} are required")]
    TooFewSamples { needed: usize, got: usize },
    #[error("sample {index} has {object} object points but {left} left and {right} right image points")]
    InconsistentSample {
        index: usize,
        object: usize,
        left: usize,
        right: usize,
    },
    #[error("sample {index} uses a different board than the first sample")]
    MixedPatterns { index: usize },
    #[error("image size {0} is empty")]
    EmptyImageSize(Resolution),
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationComputeError {
    #[error("{camera} camera calibration failed: {source}")]
    Mono {
        camera: Camera,
        #[source]
        source: SolverError,
    },
    #[error("stereo calibration failed: {0}")]
    Stereo(#[source] SolverError),
    #[error("calibration produced an invalid result: {0}")]
    InvalidResult(#[from] InvalidResult),
    #[error("calibration task failed: {0}")]
    Task(String),
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid calibration input: {0}")]
    Input(#[from] CalibrationInputError),
    #[error("Calibration failed: {0}")]
    Compute(#[from] CalibrationComputeError),
    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("No active calibration")]
    NotCalibrated,
}

/// Non-fatal findings of a successful calibration.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityWarning {
    /// A single-camera RMS error reached the configured warning level.
    HighCameraRms { camera: Camera, rms: f64 },
    /// Fewer samples than recommended were used.
    FewSamples { count: usize, recommended: usize },
}

#[derive(Debug)]
pub struct CalibrationOutcome {
    pub result: Arc<CalibrationResult>,
    pub quality: CalibrationQuality,
    pub warnings: Vec<QualityWarning>,
    /// Set when the result is active but could not be saved.
    pub persist_error: Option<PersistenceError>,
}

/// Shared, read-mostly access to the active calibration.
#[derive(Debug, Clone, Default)]
pub struct CalibrationHandle {
    active: Arc<RwLock<Option<Arc<CalibrationResult>>>>,
}

impl CalibrationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that starts out with `result` active.
    pub fn with_result(result: Arc<CalibrationResult>) -> Self {
        let handle = Self::new();
        handle.replace(result);
        handle
    }

    pub fn current(&self) -> Option<Arc<CalibrationResult>> {
        match self.active.read() {
            Ok(active) => active.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.current().is_some()
    }

    pub(crate) fn replace(&self, result: Arc<CalibrationResult>) {
        let mut active = match self.active.write() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = Some(result);
    }
}

/// The solvers a calibration run uses.
#[derive(Clone)]
pub struct CalibrationSolvers {
    pub left: Arc<dyn MonoCalibrator>,
    pub right: Arc<dyn MonoCalibrator>,
    pub stereo: Arc<dyn StereoCalibrator>,
}

impl CalibrationSolvers {
    /// Fixed intrinsics for both cameras with the linear stereo solver.
    pub fn with_prior_intrinsics(left: RadTanModel, right: RadTanModel) -> Self {
        CalibrationSolvers {
            left: Arc::new(PriorIntrinsicsCalibrator::new(left)),
            right: Arc::new(PriorIntrinsicsCalibrator::new(right)),
            stereo: Arc::new(FixedIntrinsicsStereoCalibrator),
        }
    }
}

struct OrchestratorInner {
    config: CalibrationConfig,
    solvers: CalibrationSolvers,
    store: Arc<dyn CalibrationStore>,
    handle: CalibrationHandle,
    events: EventBus,
}

#[derive(Clone)]
pub struct CalibrationOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl CalibrationOrchestrator {
    pub fn new(
        config: CalibrationConfig,
        solvers: CalibrationSolvers,
        store: Arc<dyn CalibrationStore>,
        events: EventBus,
    ) -> Self {
        CalibrationOrchestrator {
            inner: Arc::new(OrchestratorInner {
                config,
                solvers,
                store,
                handle: CalibrationHandle::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.inner.config
    }

    pub fn handle(&self) -> CalibrationHandle {
        self.inner.handle.clone()
    }

    pub fn active(&self) -> Option<Arc<CalibrationResult>> {
        self.inner.handle.current()
    }

    fn check_input(
        &self,
        samples: &[CorrespondenceSample],
        image_size: Resolution,
    ) -> Result<(), CalibrationInputError> {
        let needed = self.inner.config.min_samples;
        if samples.len() < needed {
            return Err(CalibrationInputError::TooFewSamples {
                needed,
                got: samples.len(),
            });
        }
        if image_size.is_empty() {
            return Err(CalibrationInputError::EmptyImageSize(image_size));
        }
        for (index, sample) in samples.iter().enumerate() {
            if !sample.is_consistent() {
                return Err(CalibrationInputError::InconsistentSample {
                    index,
                    object: sample.object_points().len(),
                    left: sample.left_points().len(),
                    right: sample.right_points().len(),
                });
            }
            if sample.object_points() != samples[0].object_points() {
                return Err(CalibrationInputError::MixedPatterns { index });
            }
        }
        Ok(())
    }

    /// Calibrates the rig from `samples` and makes the result active.
    ///
    /// Input and solver errors leave the active result as it was. A failed
    /// save is reported in [`CalibrationOutcome::persist_error`]; the new
    /// result is active regardless.
    pub fn calibrate(
        &self,
        samples: &[CorrespondenceSample],
        image_size: Resolution,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        self.check_input(samples, image_size)?;

        let config = &self.inner.config;
        let mut warnings = Vec::new();
        if samples.len() < config.recommended_samples {
            info!(
                "Calibrating with {} samples, {} or more are recommended",
                samples.len(),
                config.recommended_samples
            );
            warnings.push(QualityWarning::FewSamples {
                count: samples.len(),
                recommended: config.recommended_samples,
            });
        }

        let object: Vec<_> = samples.iter().map(|s| s.object_points().to_vec()).collect();
        let left_points: Vec<_> = samples.iter().map(|s| s.left_points().to_vec()).collect();
        let right_points: Vec<_> = samples.iter().map(|s| s.right_points().to_vec()).collect();

        let solvers = &self.inner.solvers;
        let left = solvers
            .left
            .calibrate(&object, &left_points, image_size)
            .map_err(|source| CalibrationComputeError::Mono {
                camera: Camera::Left,
                source,
            })?;
        let right = solvers
            .right
            .calibrate(&object, &right_points, image_size)
            .map_err(|source| CalibrationComputeError::Mono {
                camera: Camera::Right,
                source,
            })?;

        for (camera, rms) in [(Camera::Left, left.rms), (Camera::Right, right.rms)] {
            if rms >= config.rms_warning {
                warn!(
                    "{camera} camera RMS error {rms:.3} px is at or above {:.3}",
                    config.rms_warning
                );
                warnings.push(QualityWarning::HighCameraRms { camera, rms });
            }
        }

        let stereo = solvers
            .stereo
            .calibrate(
                &object,
                &left_points,
                &right_points,
                &left.model,
                &right.model,
                image_size,
            )
            .map_err(CalibrationComputeError::Stereo)?;

        let result = CalibrationResult::new(CalibrationParts {
            camera_matrix_left: left.model.camera_matrix(),
            distortion_left: left.model.distortions,
            camera_matrix_right: right.model.camera_matrix(),
            distortion_right: right.model.distortions,
            rotation: stereo.rotation,
            translation: stereo.translation,
            essential: stereo.essential,
            fundamental: stereo.fundamental,
            rms: stereo.rms,
            rms_left: left.rms,
            rms_right: right.rms,
            image_size,
            sample_count: samples.len(),
            created_at: Utc::now(),
        })
        .map_err(CalibrationComputeError::from)?;
        let result = Arc::new(result);
        let quality = result.quality();

        let persist_error = match self.inner.store.save(&result) {
            Ok(()) => None,
            Err(err) => {
                warn!("Failed to save calibration: {err}");
                Some(err)
            }
        };

        self.inner.handle.replace(Arc::clone(&result));
        info!(
            "Stereo calibration completed: {} samples, rms {:.4} ({quality}), baseline {:.3}",
            result.sample_count(),
            result.rms(),
            result.baseline()
        );
        self.inner
            .events
            .publish(RigEvent::CalibrationCompleted(Arc::clone(&result)));

        Ok(CalibrationOutcome {
            result,
            quality,
            warnings,
            persist_error,
        })
    }

    /// Runs [`calibrate`](Self::calibrate) on the blocking thread pool.
    pub async fn calibrate_in_background(
        &self,
        samples: Vec<CorrespondenceSample>,
        image_size: Resolution,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        let orchestrator = self.clone();
        tokio::task::spawn_blocking(move || orchestrator.calibrate(&samples, image_size))
            .await
            .map_err(|err| CalibrationComputeError::Task(err.to_string()))?
    }

    /// Activates the stored calibration, if there is a valid one.
    ///
    /// Load failures are logged and leave the rig uncalibrated.
    pub fn restore(&self) -> Option<Arc<CalibrationResult>> {
        match self.inner.store.load() {
            Ok(Some(result)) => {
                let result = Arc::new(result);
                info!(
                    "Restored calibration from {} ({} samples, rms {:.4})",
                    result.created_at(),
                    result.sample_count(),
                    result.rms()
                );
                self.inner.handle.replace(Arc::clone(&result));
                Some(result)
            }
            Ok(None) => {
                info!("No stored calibration, starting uncalibrated");
                None
            }
            Err(err) => {
                warn!("Could not restore calibration: {err}");
                None
            }
        }
    }

    /// Saves the active result again, e.g. after a failed automatic save.
    pub fn save_active(&self) -> Result<(), CalibrationError> {
        let result = self.active().ok_or(CalibrationError::NotCalibrated)?;
        self.inner.store.save(&result)?;
        Ok(())
    }
}
