//! Persistence of the active calibration.

use super::result::CalibrationResult;
use log::debug;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize calibration: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid calibration record: {0}")]
    InvalidRecord(String),
}

/// Storage for the calibration snapshot.
pub trait CalibrationStore: Send + Sync {
    fn save(&self, result: &CalibrationResult) -> Result<(), PersistenceError>;

    /// `Ok(None)` means nothing has been saved yet.
    fn load(&self) -> Result<Option<CalibrationResult>, PersistenceError>;
}

/// Stores the calibration as pretty-printed JSON in a single file.
///
/// Saving writes a sibling temporary file and renames it over the target, so
/// a reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "calibration".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CalibrationStore for JsonFileStore {
    fn save(&self, result: &CalibrationResult) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(result)?;
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }

        debug!("Saved calibration to {}", self.path.display());
        Ok(())
    }

    fn load(&self) -> Result<Option<CalibrationResult>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(result) => Ok(Some(result)),
            // Shape and validation failures come back as data errors
            Err(err) if err.is_data() => Err(PersistenceError::InvalidRecord(err.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps the last saved result in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<CalibrationResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CalibrationStore for MemoryStore {
    fn save(&self, result: &CalibrationResult) -> Result<(), PersistenceError> {
        let mut saved = match self.saved.lock() {
            Ok(saved) => saved,
            Err(poisoned) => poisoned.into_inner(),
        };
        *saved = Some(result.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<CalibrationResult>, PersistenceError> {
        let saved = match self.saved.lock() {
            Ok(saved) => saved,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(saved.clone())
    }
}
