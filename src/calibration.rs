//! Lens calibration profile and its JSON file format.
//!
//! A profile always resolves to a usable `(k1, k2)` pair: a missing file means
//! defaults, a malformed file is an error for the command line and a soft
//! fallback for interactive callers (see [`CalibrationProfile::load_lenient`]).

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_K1: f64 = -0.28;
pub const DEFAULT_K2: f64 = 0.05;
pub const DEFAULT_CAMERA_MODEL: &str = "Samsung Gear 360";
const DEFAULT_NOTES: &str = "Default distortion coefficients for Gear 360. Adjust if needed.";

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("malformed calibration file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid calibration {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("cannot access calibration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    #[serde(default = "default_camera_model")]
    pub camera_model: String,
    #[serde(default = "default_k1")]
    pub distortion_k1: f64,
    #[serde(default = "default_k2")]
    pub distortion_k2: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_resolution: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_camera_model() -> String {
    DEFAULT_CAMERA_MODEL.to_string()
}

fn default_k1() -> f64 {
    DEFAULT_K1
}

fn default_k2() -> f64 {
    DEFAULT_K2
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            camera_model: default_camera_model(),
            distortion_k1: DEFAULT_K1,
            distortion_k2: DEFAULT_K2,
            video_resolution: None,
            notes: None,
        }
    }
}

impl CalibrationProfile {
    /// Profile with explicit coefficients. Non-finite values are rejected.
    pub fn with_coefficients(k1: f64, k2: f64) -> Result<Self, CalibrationError> {
        let profile = Self {
            distortion_k1: k1,
            distortion_k2: k2,
            ..Self::default()
        };
        profile.validate(Path::new("<inline>"))?;
        Ok(profile)
    }

    /// Default coefficients annotated with the probed input resolution, as
    /// written by the `calibrate` command.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        Self {
            video_resolution: Some((width, height)),
            notes: Some(DEFAULT_NOTES.to_string()),
            ..Self::default()
        }
    }

    pub fn coefficients(&self) -> (f64, f64) {
        (self.distortion_k1, self.distortion_k2)
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                CalibrationError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                CalibrationError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let profile: CalibrationProfile =
            serde_json::from_str(&text).map_err(|source| CalibrationError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        profile.validate(path)?;
        info!(
            path = %path.display(),
            k1 = profile.distortion_k1,
            k2 = profile.distortion_k2,
            "loaded calibration"
        );
        Ok(profile)
    }

    /// Command-line policy: no path or a missing file yields defaults, anything
    /// unreadable or malformed is a hard error.
    pub fn load_strict(path: Option<&Path>) -> Result<Self, CalibrationError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match Self::load(path) {
            Err(CalibrationError::NotFound { path }) => {
                warn!(path = %path.display(), "calibration file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Interactive policy: every failure falls back to defaults. The error, if
    /// any, is handed back so the caller can surface it.
    pub fn load_lenient(path: Option<&Path>) -> (Self, Option<CalibrationError>) {
        let Some(path) = path else {
            return (Self::default(), None);
        };
        match Self::load(path) {
            Ok(profile) => (profile, None),
            Err(err) => {
                warn!("{err}; using default coefficients");
                (Self::default(), Some(err))
            }
        }
    }

    /// Writes the profile as pretty-printed JSON, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| {
            CalibrationError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, json + "\n").map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "calibration saved");
        Ok(())
    }

    fn validate(&self, path: &Path) -> Result<(), CalibrationError> {
        if !self.distortion_k1.is_finite() || !self.distortion_k2.is_finite() {
            return Err(CalibrationError::Invalid {
                path: path.to_path_buf(),
                reason: format!(
                    "distortion coefficients must be finite (k1={}, k2={})",
                    self.distortion_k1, self.distortion_k2
                ),
            });
        }
        Ok(())
    }
}
