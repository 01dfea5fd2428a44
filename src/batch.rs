use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::calibration::CalibrationProfile;
use crate::error::OutputCollision;
use crate::job::{
    stitched_output_path, CancellationToken, JobReport, JobStatus, StitchSettings, VideoJob,
};
use crate::media::MediaIo;
use crate::mux::AudioMuxer;
use crate::pipeline::{JobObserver, NullObserver, VideoPipeline};
use crate::progress::DEFAULT_SAMPLE_INTERVAL;

/// Ordered list of jobs. Run order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct BatchQueue {
    jobs: Vec<VideoJob>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// One job per input, each written to `output_dir` as `<stem>_stitched.<ext>`.
    ///
    /// Inputs sharing a file name (say from different subdirectories) map to
    /// the same output and are rejected before anything runs.
    pub fn from_inputs<I>(
        inputs: I,
        output_dir: &Path,
        settings: StitchSettings,
    ) -> Result<Self, OutputCollision>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut queue = Self::new();
        for input in inputs {
            let output = stitched_output_path(&input, output_dir);
            queue.push(VideoJob::new(input, output, settings))?;
        }
        Ok(queue)
    }

    /// Appends `job` unless an earlier job already writes to its output.
    pub fn push(&mut self, job: VideoJob) -> Result<(), OutputCollision> {
        if let Some(earlier) = self.jobs.iter().find(|j| j.output == job.output) {
            return Err(OutputCollision {
                first: earlier.input.clone(),
                second: job.input,
                output: job.output,
            });
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn jobs(&self) -> &[VideoJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Jobs never started because the batch was cancelled first.
    pub skipped: usize,
    pub reports: Vec<JobReport>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Batch summary: succeeded={} failed={} cancelled={}",
            self.succeeded, self.failed, self.cancelled
        )
    }
}

/// Runs queued jobs one after another; a failed job never stops the rest.
pub struct BatchOrchestrator {
    profile: CalibrationProfile,
    io: Arc<dyn MediaIo>,
    muxer: Option<Arc<dyn AudioMuxer>>,
    observer: Arc<dyn JobObserver>,
    cancel: CancellationToken,
    sample_interval: Duration,
}

impl BatchOrchestrator {
    pub fn new(profile: CalibrationProfile, io: Arc<dyn MediaIo>) -> Self {
        Self {
            profile,
            io,
            muxer: None,
            observer: Arc::new(NullObserver),
            cancel: CancellationToken::new(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
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

    fn pipeline(&self) -> VideoPipeline {
        let pipeline = VideoPipeline::new(self.profile.clone(), Arc::clone(&self.io))
            .with_observer(Arc::clone(&self.observer))
            .with_cancellation(self.cancel.clone())
            .with_sample_interval(self.sample_interval);
        match &self.muxer {
            Some(muxer) => pipeline.with_muxer(Arc::clone(muxer)),
            None => pipeline,
        }
    }

    pub fn run(&self, queue: &BatchQueue) -> BatchSummary {
        let total = queue.len();
        let mut summary = BatchSummary::default();

        for (index, job) in queue.jobs().iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                summary.skipped = total - index;
                break;
            }

            info!(
                job = index + 1,
                total,
                input = %job.input.display(),
                output = %job.output.display(),
                "starting job"
            );
            self.observer.on_job_started(index, total, &job.input);

            let report = self.pipeline().run(job);
            match &report.status {
                JobStatus::Completed { .. } => summary.succeeded += 1,
                JobStatus::Failed(err) => {
                    warn!(input = %job.input.display(), "job failed: {err}");
                    summary.failed += 1;
                }
                JobStatus::Cancelled => summary.cancelled = true,
            }
            info!("{}", report.summary_line());
            self.observer.on_job_finished(index, &report);
            summary.reports.push(report);

            if summary.cancelled {
                summary.skipped = total - index - 1;
                break;
            }
        }

        info!("{}", summary.summary_line());
        summary
    }
}
