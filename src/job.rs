use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{JobError, SettingsError};
use crate::image_ops::Rotation;

pub const DEFAULT_PANO_WIDTH: u32 = 3840;
pub const DEFAULT_PANO_HEIGHT: u32 = 1920;

/// Output geometry shared by every frame of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StitchSettings {
    pub pano_width: u32,
    pub pano_height: u32,
    pub rotation: Rotation,
}

impl Default for StitchSettings {
    fn default() -> Self {
        Self {
            pano_width: DEFAULT_PANO_WIDTH,
            pano_height: DEFAULT_PANO_HEIGHT,
            rotation: Rotation::None,
        }
    }
}

impl StitchSettings {
    pub fn new(
        pano_width: u32,
        pano_height: u32,
        rotation_degrees: u32,
    ) -> Result<Self, SettingsError> {
        let settings = Self {
            pano_width,
            pano_height,
            rotation: Rotation::from_degrees(rotation_degrees)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pano_width == 0 || self.pano_height == 0 {
            return Err(SettingsError::ZeroDimension {
                width: self.pano_width,
                height: self.pano_height,
            });
        }
        if self.pano_width % 2 != 0 {
            return Err(SettingsError::OddWidth(self.pano_width));
        }
        Ok(())
    }

    /// Size of one corrected hemisphere before assembly.
    pub fn hemisphere_dimensions(&self) -> (u32, u32) {
        (self.pano_width / 2, self.pano_height)
    }

    /// Size of every written frame, after rotation.
    pub fn output_dimensions(&self) -> (u32, u32) {
        self.rotation.output_dimensions(self.pano_width, self.pano_height)
    }
}

/// One input video and where its panorama goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub settings: StitchSettings,
}

impl VideoJob {
    pub fn new(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        settings: StitchSettings,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            settings,
        }
    }
}

/// Shared stop flag. Clones observe the same flag; once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOutcome {
    /// Original audio copied into the final output.
    Muxed,
    /// No muxer configured; output is video-only.
    NotRequested,
    /// Muxer tool missing; output is video-only.
    SkippedUnavailable,
    /// Muxer ran and failed; the video-only stream was kept as the output.
    FallbackVideoOnly,
}

impl fmt::Display for AudioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioOutcome::Muxed => "muxed",
            AudioOutcome::NotRequested => "none",
            AudioOutcome::SkippedUnavailable => "skipped (tool unavailable)",
            AudioOutcome::FallbackVideoOnly => "fallback (mux failed)",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum JobStatus {
    Completed { audio: AudioOutcome },
    Cancelled,
    Failed(JobError),
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Completed { .. } => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed(_) => "failed",
        }
    }
}

/// Terminal record of one pipeline run.
#[derive(Debug)]
pub struct JobReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: JobStatus,
    pub frames_processed: u64,
    pub frames_total: Option<u64>,
    pub elapsed: Duration,
    pub warnings: Vec<String>,
}

impl JobReport {
    pub fn average_fps(&self) -> f64 {
        crate::progress::average_rate(self.frames_processed, self.elapsed)
    }

    /// One line suitable for logs and the CLI summary.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} -> {}: {} frames={} elapsed={} fps={:.2}",
            self.input.display(),
            self.output.display(),
            self.status.label(),
            self.frames_processed,
            crate::progress::format_duration(self.elapsed),
            self.average_fps(),
        );
        match &self.status {
            JobStatus::Completed { audio } => line.push_str(&format!(" audio=\"{audio}\"")),
            JobStatus::Failed(err) => line.push_str(&format!(" error=\"{err}\"")),
            JobStatus::Cancelled => {}
        }
        if !self.warnings.is_empty() {
            line.push_str(&format!(" warnings={}", self.warnings.len()));
        }
        line
    }
}

pub const OUTPUT_SUFFIX: &str = "_stitched";

/// `<dir>/<stem>_stitched.<ext>` for an input path; the extension is kept.
pub fn stitched_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{stem}{OUTPUT_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{OUTPUT_SUFFIX}"),
    };
    output_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = StitchSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.hemisphere_dimensions(), (1920, 1920));
        assert_eq!(settings.output_dimensions(), (3840, 1920));
    }

    #[test]
    fn settings_validation() {
        assert_eq!(
            StitchSettings::new(0, 1920, 0),
            Err(SettingsError::ZeroDimension { width: 0, height: 1920 })
        );
        assert_eq!(StitchSettings::new(3841, 1920, 0), Err(SettingsError::OddWidth(3841)));
        assert_eq!(StitchSettings::new(3840, 1920, 45), Err(SettingsError::Rotation(45)));

        let rotated = StitchSettings::new(3840, 1920, 90).expect("valid");
        assert_eq!(rotated.output_dimensions(), (1920, 3840));
        assert_eq!(rotated.hemisphere_dimensions(), (1920, 1920));
    }

    #[test]
    fn cancellation_is_shared_and_sticky() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn output_name_keeps_extension() {
        let out = stitched_output_path(Path::new("/in/trip.MOV"), Path::new("/out"));
        assert_eq!(out, PathBuf::from("/out/trip_stitched.MOV"));
        let bare = stitched_output_path(Path::new("clip"), Path::new("o"));
        assert_eq!(bare, PathBuf::from("o/clip_stitched"));
        let dotted = stitched_output_path(Path::new("a.b.mp4"), Path::new("."));
        assert_eq!(dotted, PathBuf::from("./a.b_stitched.mp4"));
    }
}
