//! Rig configuration, loaded from YAML.
//!
//! Every field has a default, so a config file only needs the values it
//! changes.

use crate::camera::Resolution;
use crate::solver::BoardPattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub session: SessionConfig,
    pub pattern: BoardPattern,
    pub calibration: CalibrationConfig,
    pub localization: LocalizationConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause before opening a device, giving a just-released device time to settle.
    pub settle_delay_ms: u64,
    pub ready_poll_attempts: u32,
    pub ready_poll_interval_ms: u64,
    /// Deadline for the whole connect sequence.
    pub connect_timeout_ms: u64,
    pub default_resolution: Resolution,
    pub capture_rate_hz: f64,
    /// Ids `0..probe_limit` are tried when looking for devices.
    pub probe_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            settle_delay_ms: 200,
            ready_poll_attempts: 5,
            ready_poll_interval_ms: 200,
            connect_timeout_ms: 10_000,
            default_resolution: Resolution::new(640, 480),
            capture_rate_hz: 10.0,
            probe_limit: 10,
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Time between frame pulls at the configured capture rate. A rate that is
    /// not a positive finite number falls back to 10 Hz.
    pub fn capture_interval(&self) -> Duration {
        let fallback = Duration::from_millis(100);
        if !self.capture_rate_hz.is_finite() {
            return fallback;
        }
        Duration::try_from_secs_f64(self.capture_rate_hz.recip()).unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_samples: usize,
    /// Below this count calibration still runs but an info message is logged.
    pub recommended_samples: usize,
    /// Single-camera RMS error at or above which a quality warning is raised.
    pub rms_warning: f64,
    pub result_path: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            min_samples: 10,
            recommended_samples: 15,
            rms_warning: 1.0,
            result_path: PathBuf::from("calibration_result.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Mean reprojection error (pixels) above which a result is low-confidence.
    pub reprojection_threshold: f64,
    /// Relative deviation from the track mean that marks a sample as an outlier.
    pub outlier_deviation: f64,
    pub history_capacity: usize,
    /// Homogeneous scale magnitude at or below which a point is degenerate.
    pub min_homogeneous_scale: f64,
    pub min_depth: Option<f64>,
    pub max_depth: Option<f64>,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            reprojection_threshold: 3.0,
            outlier_deviation: 0.2,
            history_capacity: 5,
            min_homogeneous_scale: 1e-9,
            min_depth: None,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory for archived calibration pairs. Archiving is off when unset.
    pub directory: Option<PathBuf>,
    pub session: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            directory: None,
            session: "session".to_string(),
        }
    }
}

impl RigConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: RigConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_yaml(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn save_to_yaml(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.session.ready_poll_attempts == 0 {
            return invalid("session.ready_poll_attempts must be at least 1");
        }
        if !(self.session.capture_rate_hz > 0.0 && self.session.capture_rate_hz.is_finite()) {
            return invalid("session.capture_rate_hz must be positive");
        }
        if self.pattern.columns < 2 || self.pattern.rows < 2 {
            return invalid("pattern needs at least 2x2 inner corners");
        }
        if !(self.pattern.square_size > 0.0 && self.pattern.square_size.is_finite()) {
            return invalid("pattern.square_size must be positive");
        }
        if self.calibration.min_samples == 0 {
            return invalid("calibration.min_samples must be at least 1");
        }
        if self.localization.history_capacity == 0 {
            return invalid("localization.history_capacity must be at least 1");
        }
        if !(self.localization.outlier_deviation > 0.0) {
            return invalid("localization.outlier_deviation must be positive");
        }
        if !(self.localization.min_homogeneous_scale >= 0.0) {
            return invalid("localization.min_homogeneous_scale must not be negative");
        }
        if let (Some(min), Some(max)) = (self.localization.min_depth, self.localization.max_depth) {
            if min >= max {
                return invalid("localization.min_depth must be below max_depth");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RigConfig::default();
        assert_eq!(config.session.settle_delay(), Duration::from_millis(200));
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.capture_interval(), Duration::from_millis(100));
        assert_eq!(config.session.default_resolution, Resolution::new(640, 480));
        assert_eq!(config.pattern.columns, 9);
        assert_eq!(config.pattern.rows, 6);
        assert_eq!(config.calibration.min_samples, 10);
        assert_eq!(config.localization.history_capacity, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capture_interval_falls_back_on_bad_rate() {
        let fallback = Duration::from_millis(100);
        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY, 1e-320] {
            let session = SessionConfig {
                capture_rate_hz: rate,
                ..SessionConfig::default()
            };
            assert_eq!(session.capture_interval(), fallback, "rate {rate}");
        }

        let session = SessionConfig {
            capture_rate_hz: 25.0,
            ..SessionConfig::default()
        };
        assert_eq!(session.capture_interval(), Duration::from_millis(40));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "pattern:\n  square_size: 25.0\nlocalization:\n  reprojection_threshold: 1.5\n";
        let config = RigConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pattern.square_size, 25.0);
        assert_eq!(config.pattern.columns, 9);
        assert_eq!(config.localization.reprojection_threshold, 1.5);
        assert_eq!(config.localization.outlier_deviation, 0.2);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let yaml = "localization:\n  history_capacity: 0\n";
        assert!(matches!(
            RigConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RigConfig::from_yaml_str("session: [1, 2"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.yaml");

        let mut config = RigConfig::default();
        config.archive.directory = Some(dir.path().join("archive"));
        config.localization.max_depth = Some(5000.0);
        config.save_to_yaml(&path).unwrap();

        assert_eq!(RigConfig::load_from_yaml(&path).unwrap(), config);
    }
}
