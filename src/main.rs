use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dualfish::batch::{BatchOrchestrator, BatchQueue};
use dualfish::calibration::CalibrationProfile;
use dualfish::job::{
    CancellationToken, JobReport, JobStatus, StitchSettings, VideoJob, DEFAULT_PANO_HEIGHT,
    DEFAULT_PANO_WIDTH,
};
use dualfish::media::{EncoderSettings, FfmpegIo, MediaIo};
use dualfish::mux::{AudioMuxer, FfmpegMuxer};
use dualfish::pipeline::{FrameStitcher, VideoPipeline};
use dualfish::progress::{ProgressConfig, ProgressMode, ProgressOutcome, ProgressReporter};
use dualfish::util;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Conventional exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "dualfish",
    version,
    about = "Convert dual-fisheye 360 camera video into panoramic video"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Clone)]
struct ToolArgs {
    /// ffmpeg executable used for decoding, encoding and audio remux.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe executable used to read stream metadata.
    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
}

#[derive(Args, Clone)]
struct StitchArgs {
    /// Calibration JSON. Built-in coefficients are used when omitted.
    #[arg(short, long)]
    calibration: Option<PathBuf>,

    /// Panorama width in pixels (must be even).
    #[arg(short, long, default_value_t = DEFAULT_PANO_WIDTH)]
    width: u32,

    /// Panorama height in pixels.
    #[arg(short = 't', long, default_value_t = DEFAULT_PANO_HEIGHT)]
    height: u32,

    /// Clockwise rotation of the panorama: 0, 90, 180 or 270.
    #[arg(long, default_value_t = 0)]
    rotate: u32,
}

#[derive(Args, Clone)]
struct EncodeArgs {
    /// Video codec passed to ffmpeg.
    #[arg(long, default_value = "mpeg4")]
    codec: String,

    /// ffmpeg -q:v value, lower is better.
    #[arg(long, default_value_t = 2)]
    quality: u32,

    /// Encoder thread count override. Default: all cores.
    #[arg(long)]
    threads: Option<usize>,

    /// Do not copy the original audio track into the output.
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    #[command(flatten)]
    tools: ToolArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a calibration file for a video using default coefficients
    Calibrate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = "calibration.json")]
        output: PathBuf,

        /// Also save the first frame as a PNG for reference.
        #[arg(long)]
        sample: Option<PathBuf>,

        #[command(flatten)]
        tools: ToolArgs,
    },

    /// Convert one dual-fisheye video into a panorama video
    Stitch {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        stitch: StitchArgs,

        #[command(flatten)]
        encode: EncodeArgs,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Convert several videos into <stem>_stitched.<ext> files, one after another
    Batch {
        /// Video files or directories containing .mp4/.mov/.avi files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long)]
        output_dir: PathBuf,

        /// Descend into subdirectories of directory inputs.
        #[arg(long, default_value_t = false)]
        recursive: bool,

        #[command(flatten)]
        stitch: StitchArgs,

        #[command(flatten)]
        encode: EncodeArgs,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Stitch a single frame to a PNG to check calibration and rotation
    Preview {
        #[arg(short, long)]
        input: PathBuf,

        /// PNG file to write.
        #[arg(short, long)]
        output: PathBuf,

        /// Zero-based frame index. Default: the middle frame.
        #[arg(long)]
        frame: Option<u64>,

        #[command(flatten)]
        stitch: StitchArgs,

        #[command(flatten)]
        tools: ToolArgs,
    },
}

impl ToolArgs {
    fn media_io(&self, encoder: EncoderSettings) -> FfmpegIo {
        FfmpegIo {
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            encoder,
        }
    }
}

impl StitchArgs {
    fn settings(&self) -> Result<StitchSettings> {
        StitchSettings::new(self.width, self.height, self.rotate).context("invalid stitch settings")
    }

    fn profile(&self) -> Result<CalibrationProfile> {
        CalibrationProfile::load_strict(self.calibration.as_deref())
            .context("failed to load calibration")
    }
}

impl EncodeArgs {
    fn media_io(&self) -> FfmpegIo {
        let mut encoder = EncoderSettings {
            codec: self.codec.clone(),
            quality: self.quality,
            ..EncoderSettings::default()
        };
        if let Some(threads) = self.threads {
            encoder.threads = threads;
        }
        self.tools.media_io(encoder)
    }

    fn muxer(&self) -> Option<Arc<dyn AudioMuxer>> {
        if self.no_audio {
            None
        } else {
            Some(Arc::new(FfmpegMuxer::new(self.tools.ffmpeg.clone())))
        }
    }
}

fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Calibrate {
            input,
            output,
            sample,
            tools,
        } => {
            util::ensure_ffmpeg_available(&tools.ffmpeg).context("ffmpeg not found")?;
            run_calibrate(&input, &output, sample.as_deref(), &tools)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Stitch {
            input,
            output,
            stitch,
            encode,
            progress,
        } => {
            let settings = stitch.settings()?;
            let profile = stitch.profile()?;
            util::ensure_ffmpeg_available(&encode.tools.ffmpeg).context("ffmpeg not found")?;
            if input == output {
                bail!("output {} would overwrite the input", output.display());
            }
            run_stitch(
                VideoJob::new(input, output, settings),
                profile,
                &encode,
                ProgressConfig::new(progress),
            )
        }

        Commands::Batch {
            inputs,
            output_dir,
            recursive,
            stitch,
            encode,
            progress,
        } => {
            let settings = stitch.settings()?;
            let profile = stitch.profile()?;
            util::ensure_ffmpeg_available(&encode.tools.ffmpeg).context("ffmpeg not found")?;

            let inputs = util::discover_inputs(&inputs, recursive)?;
            if inputs.is_empty() {
                bail!("no video files found in the given inputs");
            }
            let queue = BatchQueue::from_inputs(inputs, &output_dir, settings)?;
            std::fs::create_dir_all(&output_dir).with_context(|| {
                format!("failed to create output directory {}", output_dir.display())
            })?;
            run_batch(queue, profile, &encode, ProgressConfig::new(progress))
        }

        Commands::Preview {
            input,
            output,
            frame,
            stitch,
            tools,
        } => {
            let settings = stitch.settings()?;
            let profile = stitch.profile()?;
            util::ensure_ffmpeg_available(&tools.ffmpeg).context("ffmpeg not found")?;
            run_preview(&input, &output, frame, profile, settings, &tools)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn install_ctrlc() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        if !handler_token.is_cancelled() {
            eprintln!("cancelling after the current frame...");
        }
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(token)
}

fn run_calibrate(
    input: &Path,
    output: &Path,
    sample: Option<&Path>,
    tools: &ToolArgs,
) -> Result<()> {
    let io = tools.media_io(EncoderSettings::default());
    let mut source = io
        .open_source(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let frame = source
        .read_frame()
        .with_context(|| format!("failed to read the first frame of {}", input.display()))?
        .with_context(|| format!("{} contains no video frames", input.display()))?;

    let profile = CalibrationProfile::for_resolution(frame.width(), frame.height());
    profile
        .save(output)
        .with_context(|| format!("failed to write calibration {}", output.display()))?;
    info!(path = %output.display(), "calibration written");

    if let Some(sample) = sample {
        frame
            .save(sample)
            .with_context(|| format!("failed to write sample frame {}", sample.display()))?;
        info!(path = %sample.display(), "sample frame written");
    }

    println!(
        "Calibration summary: input={} output={} resolution={}x{} k1={} k2={} model=\"{}\"",
        input.display(),
        output.display(),
        frame.width(),
        frame.height(),
        profile.distortion_k1,
        profile.distortion_k2,
        profile.camera_model,
    );
    Ok(())
}

fn run_stitch(
    job: VideoJob,
    profile: CalibrationProfile,
    encode: &EncodeArgs,
    progress: ProgressConfig,
) -> Result<ExitCode> {
    let cancel = install_ctrlc()?;
    let reporter = ProgressReporter::new("stitch", progress);

    let mut pipeline = VideoPipeline::new(profile, Arc::new(encode.media_io()))
        .with_observer(Arc::new(reporter.handle()))
        .with_cancellation(cancel);
    if let Some(muxer) = encode.muxer() {
        pipeline = pipeline.with_muxer(muxer);
    }

    let report = pipeline.run(&job);
    let outcome = reporter.finish(report.status.label());
    print_job_summary("Stitch summary", &report);
    print_progress_warnings(&outcome);

    match report.status {
        JobStatus::Completed { .. } => Ok(ExitCode::SUCCESS),
        JobStatus::Cancelled => {
            warn!("stitch cancelled, {} was not written", job.output.display());
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        JobStatus::Failed(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to stitch {}", job.input.display()))),
    }
}

fn run_batch(
    queue: BatchQueue,
    profile: CalibrationProfile,
    encode: &EncodeArgs,
    progress: ProgressConfig,
) -> Result<ExitCode> {
    let cancel = install_ctrlc()?;
    let reporter = ProgressReporter::new("batch", progress);

    let mut orchestrator = BatchOrchestrator::new(profile, Arc::new(encode.media_io()))
        .with_observer(Arc::new(reporter.handle()))
        .with_cancellation(cancel);
    if let Some(muxer) = encode.muxer() {
        orchestrator = orchestrator.with_muxer(muxer);
    }

    let summary = orchestrator.run(&queue);
    let outcome = reporter.finish(summary.summary_line());
    for report in &summary.reports {
        print_job_summary("Job summary", report);
    }
    print_progress_warnings(&outcome);
    println!("{}", summary.summary_line());
    if summary.skipped > 0 {
        println!("  skipped: {} job(s) not started", summary.skipped);
    }

    if summary.failed > 0 {
        Ok(ExitCode::FAILURE)
    } else if summary.cancelled {
        Ok(ExitCode::from(EXIT_CANCELLED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn run_preview(
    input: &Path,
    output: &Path,
    frame: Option<u64>,
    profile: CalibrationProfile,
    settings: StitchSettings,
    tools: &ToolArgs,
) -> Result<()> {
    let io = tools.media_io(EncoderSettings::default());
    let mut source = io
        .open_source(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let target = frame.unwrap_or_else(|| source.info().frame_count.map_or(0, |n| n / 2));

    let mut index = 0u64;
    let picked = loop {
        match source
            .read_frame()
            .with_context(|| format!("failed to read {}", input.display()))?
        {
            Some(f) if index == target => break f,
            Some(_) => index += 1,
            None => bail!(
                "frame {} is beyond the end of {} ({} frames)",
                target,
                input.display(),
                index
            ),
        }
    };
    drop(source);

    let mut stitcher = FrameStitcher::new(&profile, settings);
    let pano = stitcher
        .stitch(&picked)
        .with_context(|| format!("failed to stitch frame {target}"))?;
    pano.save(output)
        .with_context(|| format!("failed to write preview {}", output.display()))?;

    println!(
        "Preview summary: input={} frame={} output={} size={}x{} rotation={}",
        input.display(),
        target,
        output.display(),
        pano.width(),
        pano.height(),
        settings.rotation,
    );
    Ok(())
}

fn print_job_summary(label: &str, report: &JobReport) {
    println!("{}: {}", label, report.summary_line());
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_progress_warnings(outcome: &ProgressOutcome) {
    for warning in &outcome.warnings {
        println!("  warning: {}", warning);
    }
}
