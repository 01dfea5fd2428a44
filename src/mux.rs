use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

use crate::media::tool_command;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("audio remux tool {} is not available", tool.display())]
    Unavailable { tool: PathBuf },
    #[error("audio remux into {} exited with {status}: {stderr}", output.display())]
    Failed {
        output: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("audio remux into {} could not run: {source}", output.display())]
    Io {
        output: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copies the original's audio track next to a video-only stream.
///
/// Implementations must leave both inputs untouched and either produce
/// `output` or report an error; the caller owns the fallback policy.
pub trait AudioMuxer: Send + Sync {
    fn mux(&self, video_only: &Path, original: &Path, output: &Path) -> Result<(), MuxError>;
}

/// Audio codec used when re-encoding the original track.
pub const AUDIO_CODEC: &str = "aac";

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    pub ffmpeg: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegMuxer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl AudioMuxer for FfmpegMuxer {
    fn mux(&self, video_only: &Path, original: &Path, output: &Path) -> Result<(), MuxError> {
        let result = tool_command(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(video_only)
            .arg("-i")
            .arg(original)
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg(AUDIO_CODEC)
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("1:a:0?")
            .arg("-shortest")
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let out = match result {
            Ok(out) => out,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(MuxError::Unavailable {
                    tool: self.ffmpeg.clone(),
                })
            }
            Err(source) => {
                return Err(MuxError::Io {
                    output: output.to_path_buf(),
                    source,
                })
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(MuxError::Failed {
                output: output.to_path_buf(),
                status: out.status.to_string(),
                stderr: tail,
            });
        }
        debug!(output = %output.display(), "audio remuxed");
        Ok(())
    }
}
