use std::path::PathBuf;
use thiserror::Error;

use crate::calibration::CalibrationError;
use crate::media::MediaError;

/// Rejected stitch settings. Raised before any source is opened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("panorama dimensions must be positive (got {width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("panorama width must be even so both lenses get equal halves (got {0})")]
    OddWidth(u32),
    #[error("rotation must be 0, 90, 180 or 270 degrees (got {0})")]
    Rotation(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Two queued inputs that would be written to the same output file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "{} and {} would both be written to {}",
    first.display(),
    second.display(),
    output.display()
)]
pub struct OutputCollision {
    pub first: PathBuf,
    pub second: PathBuf,
    pub output: PathBuf,
}

/// Failure that ends one job. Sibling batch jobs are unaffected.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] MediaError),
    #[error("processing failed for {path} at frame {frame}: {reason}")]
    Processing {
        path: PathBuf,
        frame: u64,
        reason: String,
    },
    #[error("could not finalize output {path}: {source}")]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SettingsError> for JobError {
    fn from(err: SettingsError) -> Self {
        JobError::Config(ConfigError::Settings(err))
    }
}

impl From<CalibrationError> for JobError {
    fn from(err: CalibrationError) -> Self {
        JobError::Config(ConfigError::Calibration(err))
    }
}
