//! Frame loop for one video: decode, split, undistort, assemble, encode.
//!
//! A run walks `Idle -> Opening -> Running`, passes through `Muxing` when an
//! audio muxer is configured, and ends in exactly one of `Completed`,
//! `Cancelled` or `Failed`. Encoded frames are staged in a temporary file
//! beside the destination, and so is the muxer's result; the destination only
//! appears once the run succeeds, either as the audio-muxed result or as the
//! video-only stream when muxing is unavailable or fails.
//!
//! A read, write or mux error raised while cancellation is pending is taken
//! as the cancellation itself: the run ends `Cancelled` and nothing is kept.

use image::RgbImage;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, info_span, warn, Level};

use crate::calibration::CalibrationProfile;
use crate::defish::DistortionCorrector;
use crate::error::JobError;
use crate::image_ops::{assemble, split, HeightMismatch};
use crate::job::{
    AudioOutcome, CancellationToken, JobReport, JobStatus, StitchSettings, VideoJob,
};
use crate::media::{MediaError, MediaIo, SinkSpec};
use crate::mux::{AudioMuxer, MuxError};
use crate::progress::{ProgressSample, ThroughputTracker, DEFAULT_SAMPLE_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opening,
    Running,
    Muxing,
    Completed,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Cancelled | PipelineState::Failed
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Opening => "opening",
            PipelineState::Running => "running",
            PipelineState::Muxing => "muxing",
            PipelineState::Completed => "completed",
            PipelineState::Cancelled => "cancelled",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receives everything a run reports. All methods default to no-ops.
///
/// Calls happen on the thread driving the pipeline and must return quickly.
pub trait JobObserver: Send + Sync {
    fn on_state(&self, _state: PipelineState) {}

    fn on_progress(&self, _sample: &ProgressSample) {}

    fn on_log(&self, _level: Level, _message: &str) {}

    fn on_job_started(&self, _index: usize, _total: usize, _input: &Path) {}

    fn on_job_finished(&self, _index: usize, _report: &JobReport) {}
}

pub struct NullObserver;

impl JobObserver for NullObserver {}

/// Turns one combined dual-lens frame into one panorama frame.
pub struct FrameStitcher {
    corrector: DistortionCorrector,
    settings: StitchSettings,
}

impl FrameStitcher {
    pub fn new(profile: &CalibrationProfile, settings: StitchSettings) -> Self {
        Self {
            corrector: DistortionCorrector::new(profile),
            settings,
        }
    }

    pub fn stitch(&mut self, frame: &RgbImage) -> Result<RgbImage, HeightMismatch> {
        let (out_w, out_h) = self.settings.hemisphere_dimensions();
        let (first, second) = split(frame);
        let first = self.corrector.correct(&first, out_w, out_h);
        let second = self.corrector.correct(&second, out_w, out_h);
        assemble(&first, &second, self.settings.rotation)
    }
}

enum Finish {
    Completed(AudioOutcome),
    Cancelled,
}

#[derive(Default)]
struct RunStats {
    frames: u64,
    frames_total: Option<u64>,
}

pub struct VideoPipeline {
    profile: CalibrationProfile,
    io: Arc<dyn MediaIo>,
    muxer: Option<Arc<dyn AudioMuxer>>,
    observer: Arc<dyn JobObserver>,
    cancel: CancellationToken,
    sample_interval: Duration,
    state: PipelineState,
    warnings: Vec<String>,
}

impl VideoPipeline {
    pub fn new(profile: CalibrationProfile, io: Arc<dyn MediaIo>) -> Self {
        Self {
            profile,
            io,
            muxer: None,
            observer: Arc::new(NullObserver),
            cancel: CancellationToken::new(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            state: PipelineState::Idle,
            warnings: Vec::new(),
        }
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn AudioMuxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Runs `job` to a terminal state. Failures are reported, never raised.
    pub fn run(mut self, job: &VideoJob) -> JobReport {
        let span = info_span!("job", input = %job.input.display());
        let _entered = span.enter();
        let started = Instant::now();
        let mut stats = RunStats::default();

        let status = match self.execute(job, &mut stats) {
            Ok(Finish::Completed(audio)) => {
                self.transition(PipelineState::Completed);
                JobStatus::Completed { audio }
            }
            Ok(Finish::Cancelled) => {
                self.log(
                    Level::INFO,
                    format!("cancelled after {} frames, no output written", stats.frames),
                );
                self.transition(PipelineState::Cancelled);
                JobStatus::Cancelled
            }
            Err(err) => {
                self.log(Level::ERROR, format!("{} failed: {err}", job.input.display()));
                self.transition(PipelineState::Failed);
                JobStatus::Failed(err)
            }
        };

        JobReport {
            input: job.input.clone(),
            output: job.output.clone(),
            status,
            frames_processed: stats.frames,
            frames_total: stats.frames_total,
            elapsed: started.elapsed(),
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn execute(&mut self, job: &VideoJob, stats: &mut RunStats) -> Result<Finish, JobError> {
        job.settings.validate()?;
        self.transition(PipelineState::Opening);

        let mut source = self.io.open_source(&job.input)?;
        let info = source.info().clone();
        stats.frames_total = info.frame_count;

        let (out_w, out_h) = job.settings.output_dimensions();
        self.log(
            Level::INFO,
            format!(
                "input {}x{} @ {} fps, {} frames; output {}x{} rotation {}",
                info.width,
                info.height,
                info.frame_rate,
                info.frame_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                out_w,
                out_h,
                job.settings.rotation,
            ),
        );

        let staging = staging_file(&job.output)?;
        let mut sink = self.io.create_sink(
            staging.path(),
            &SinkSpec {
                width: out_w,
                height: out_h,
                frame_rate: info.frame_rate,
            },
        )?;
        let mut stitcher = FrameStitcher::new(&self.profile, job.settings);

        self.transition(PipelineState::Running);
        let mut tracker =
            ThroughputTracker::new(info.frame_count, self.sample_interval, Instant::now());

        loop {
            if self.cancel.is_cancelled() {
                // sink and staging file are dropped here, abandoning the encode
                return Ok(Finish::Cancelled);
            }
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    return self.unless_cancelled(processing_error(&job.input, stats.frames, err))
                }
            };
            let pano = stitcher
                .stitch(&frame)
                .map_err(|err| processing_error(&job.input, stats.frames, err))?;
            if let Err(err) = sink.write_frame(&pano) {
                return self.unless_cancelled(processing_error(&job.output, stats.frames, err));
            }
            stats.frames += 1;

            if let Some(sample) = tracker.record(stats.frames, Instant::now()) {
                self.observer.on_progress(&sample);
            }
        }

        if let Err(err) = sink.finish() {
            return self.unless_cancelled(processing_error(&job.output, stats.frames, err));
        }
        drop(source);
        if let Some(sample) = tracker.finish(stats.frames, Instant::now()) {
            self.observer.on_progress(&sample);
        }
        if stats.frames == 0 {
            self.log(Level::WARN, "source produced no frames".to_string());
        } else if let Some(total) = stats.frames_total.filter(|&t| t != stats.frames) {
            debug!(expected = total, decoded = stats.frames, "frame count differs from container");
        }

        self.finalize(job, staging)
    }

    fn finalize(&mut self, job: &VideoJob, staging: NamedTempFile) -> Result<Finish, JobError> {
        let Some(muxer) = self.muxer.clone() else {
            persist(staging, &job.output)?;
            return Ok(Finish::Completed(AudioOutcome::NotRequested));
        };

        self.transition(PipelineState::Muxing);
        let muxed = staging_file(&job.output)?;
        let audio = match muxer.mux(staging.path(), &job.input, muxed.path()) {
            Ok(()) => {
                persist(muxed, &job.output)?;
                debug!(output = %job.output.display(), "audio muxed");
                return Ok(Finish::Completed(AudioOutcome::Muxed));
            }
            Err(MuxError::Unavailable { tool }) => {
                self.log(
                    Level::WARN,
                    format!("{} not found, writing video without audio", tool.display()),
                );
                AudioOutcome::SkippedUnavailable
            }
            Err(err) if self.cancel.is_cancelled() => {
                debug!("audio mux interrupted: {err}");
                return Ok(Finish::Cancelled);
            }
            Err(err) => {
                self.log(
                    Level::WARN,
                    format!("audio mux failed, keeping video-only output: {err}"),
                );
                AudioOutcome::FallbackVideoOnly
            }
        };
        drop(muxed);
        persist(staging, &job.output)?;
        Ok(Finish::Completed(audio))
    }

    /// A tool dying while cancellation is pending ends the run as cancelled.
    fn unless_cancelled(&self, err: JobError) -> Result<Finish, JobError> {
        if self.cancel.is_cancelled() {
            debug!("{err} after cancellation was requested");
            Ok(Finish::Cancelled)
        } else {
            Err(err)
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
        self.observer.on_state(next);
    }

    fn log(&mut self, level: Level, message: String) {
        if level == Level::ERROR {
            error!("{message}");
        } else if level == Level::WARN {
            warn!("{message}");
            self.warnings.push(message.clone());
        } else if level == Level::INFO {
            info!("{message}");
        } else {
            debug!("{message}");
        }
        self.observer.on_log(level, &message);
    }
}

fn processing_error(path: &Path, frame: u64, err: impl fmt::Display) -> JobError {
    JobError::Processing {
        path: path.to_path_buf(),
        frame,
        reason: err.to_string(),
    }
}

/// Hidden temp file in the destination directory, with the destination's extension
/// so encoders and muxers pick the same container.
fn staging_file(output: &Path) -> Result<NamedTempFile, MediaError> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let suffix = output
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(".dualfish-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| MediaError::Create {
            path: output.to_path_buf(),
            reason: format!("cannot stage output in {}: {e}", dir.display()),
        })
}

fn persist(staging: NamedTempFile, output: &Path) -> Result<(), JobError> {
    staging
        .persist(output)
        .map(|_| ())
        .map_err(|e| JobError::Finalize {
            path: output.to_path_buf(),
            source: e.error,
        })
}
