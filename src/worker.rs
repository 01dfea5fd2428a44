//! Runs a job or a batch on a dedicated thread for interactive front ends.
//!
//! The worker talks to its consumer through a bounded channel and never waits
//! on it. As the channel fills, progress and log messages are dropped first;
//! state changes and per-job start/finish messages keep a reserved band of
//! slots and are dropped only once that band is used up. The last slot always
//! stays free so the closing [`WorkerMessage::Finished`] gets through.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Level;

use crate::batch::{BatchOrchestrator, BatchQueue, BatchSummary};
use crate::calibration::{CalibrationError, CalibrationProfile};
use crate::job::{CancellationToken, JobReport, JobStatus, VideoJob};
use crate::media::MediaIo;
use crate::mux::AudioMuxer;
use crate::pipeline::{JobObserver, PipelineState, VideoPipeline};
use crate::progress::{ProgressSample, DEFAULT_SAMPLE_INTERVAL};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    State(PipelineState),
    Progress(ProgressSample),
    Log {
        level: Level,
        message: String,
    },
    JobStarted {
        index: usize,
        total: usize,
        input: PathBuf,
    },
    JobFinished {
        index: usize,
        input: PathBuf,
        succeeded: bool,
        summary: String,
    },
    Finished {
        succeeded: usize,
        failed: usize,
        cancelled: bool,
    },
}

/// What a worker needs besides the work itself.
#[derive(Clone)]
pub struct WorkerConfig {
    pub profile: CalibrationProfile,
    pub io: Arc<dyn MediaIo>,
    pub muxer: Option<Arc<dyn AudioMuxer>>,
    pub capacity: usize,
    pub sample_interval: Duration,
    pub cancel: CancellationToken,
}

impl WorkerConfig {
    pub fn new(profile: CalibrationProfile, io: Arc<dyn MediaIo>) -> Self {
        Self {
            profile,
            io,
            muxer: None,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Interactive loading: an unreadable calibration file falls back to the
    /// built-in coefficients and the error is returned for display.
    pub fn from_calibration_file(
        path: Option<&Path>,
        io: Arc<dyn MediaIo>,
    ) -> (Self, Option<CalibrationError>) {
        let (profile, err) = CalibrationProfile::load_lenient(path);
        (Self::new(profile, io), err)
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn AudioMuxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }
}

pub struct WorkerHandle<T> {
    messages: Receiver<WorkerMessage>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    thread: JoinHandle<T>,
}

impl<T> WorkerHandle<T> {
    /// Drain with `try_iter` on a timer; the worker never waits for it.
    pub fn messages(&self) -> &Receiver<WorkerMessage> {
        &self.messages
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Messages discarded because the channel was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn join(self) -> thread::Result<T> {
        self.thread.join()
    }
}

struct ChannelObserver {
    tx: Sender<WorkerMessage>,
    capacity: usize,
    lifecycle_reserve: usize,
    dropped: Arc<AtomicU64>,
}

impl ChannelObserver {
    fn new(tx: Sender<WorkerMessage>, capacity: usize, dropped: Arc<AtomicU64>) -> Self {
        Self {
            tx,
            capacity,
            lifecycle_reserve: (capacity / 4).max(1),
            dropped,
        }
    }

    /// Progress and log lines; the first to go under pressure.
    fn post(&self, message: WorkerMessage) {
        self.post_with_headroom(message, 1 + self.lifecycle_reserve);
    }

    /// State changes and job boundaries.
    fn post_lifecycle(&self, message: WorkerMessage) {
        self.post_with_headroom(message, 1);
    }

    fn post_with_headroom(&self, message: WorkerMessage, headroom: usize) {
        if self.tx.len() + headroom >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.send_now(message);
    }

    fn send_now(&self, message: WorkerMessage) {
        match self.tx.try_send(message) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn finished(&self, succeeded: usize, failed: usize, cancelled: bool) {
        self.send_now(WorkerMessage::Finished {
            succeeded,
            failed,
            cancelled,
        });
    }
}

impl JobObserver for ChannelObserver {
    fn on_state(&self, state: PipelineState) {
        self.post_lifecycle(WorkerMessage::State(state));
    }

    fn on_progress(&self, sample: &ProgressSample) {
        self.post(WorkerMessage::Progress(sample.clone()));
    }

    fn on_log(&self, level: Level, message: &str) {
        self.post(WorkerMessage::Log {
            level,
            message: message.to_string(),
        });
    }

    fn on_job_started(&self, index: usize, total: usize, input: &Path) {
        self.post_lifecycle(WorkerMessage::JobStarted {
            index,
            total,
            input: input.to_path_buf(),
        });
    }

    fn on_job_finished(&self, index: usize, report: &JobReport) {
        self.post_lifecycle(WorkerMessage::JobFinished {
            index,
            input: report.input.clone(),
            succeeded: report.status.is_success(),
            summary: report.summary_line(),
        });
    }
}

type Channel = (Arc<ChannelObserver>, Receiver<WorkerMessage>, Arc<AtomicU64>);

fn channel(config: &WorkerConfig) -> Channel {
    let capacity = config.capacity.max(2);
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let observer = Arc::new(ChannelObserver::new(tx, capacity, Arc::clone(&dropped)));
    (observer, rx, dropped)
}

pub fn spawn_job(config: WorkerConfig, job: VideoJob) -> io::Result<WorkerHandle<JobReport>> {
    let (observer, messages, dropped) = channel(&config);
    let cancel = config.cancel.clone();

    let thread = thread::Builder::new()
        .name("dualfish-job".to_string())
        .spawn(move || {
            let mut pipeline = VideoPipeline::new(config.profile, config.io)
                .with_observer(observer.clone())
                .with_cancellation(config.cancel)
                .with_sample_interval(config.sample_interval);
            if let Some(muxer) = config.muxer {
                pipeline = pipeline.with_muxer(muxer);
            }

            observer.on_job_started(0, 1, &job.input);
            let report = pipeline.run(&job);
            observer.on_job_finished(0, &report);
            let (succeeded, failed) = match report.status {
                JobStatus::Completed { .. } => (1, 0),
                JobStatus::Failed(_) => (0, 1),
                JobStatus::Cancelled => (0, 0),
            };
            observer.finished(
                succeeded,
                failed,
                matches!(report.status, JobStatus::Cancelled),
            );
            report
        })?;

    Ok(WorkerHandle {
        messages,
        cancel,
        dropped,
        thread,
    })
}

pub fn spawn_batch(
    config: WorkerConfig,
    queue: BatchQueue,
) -> io::Result<WorkerHandle<BatchSummary>> {
    let (observer, messages, dropped) = channel(&config);
    let cancel = config.cancel.clone();

    let thread = thread::Builder::new()
        .name("dualfish-batch".to_string())
        .spawn(move || {
            let mut orchestrator = BatchOrchestrator::new(config.profile, config.io)
                .with_observer(observer.clone())
                .with_cancellation(config.cancel)
                .with_sample_interval(config.sample_interval);
            if let Some(muxer) = config.muxer {
                orchestrator = orchestrator.with_muxer(muxer);
            }

            let summary = orchestrator.run(&queue);
            observer.finished(summary.succeeded, summary.failed, summary.cancelled);
            summary
        })?;

    Ok(WorkerHandle {
        messages,
        cancel,
        dropped,
        thread,
    })
}
