use clap::ValueEnum;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::pipeline::{JobObserver, PipelineState};

const MAX_STORED_WARNINGS: usize = 32;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// One throughput observation for a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub frames_done: u64,
    /// `None` when the source could not report a frame count.
    pub frames_total: Option<u64>,
    pub elapsed: Duration,
    pub fps: f64,
    pub eta: Option<Duration>,
}

impl ProgressSample {
    /// Percentage complete, or `None` when the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        match self.frames_total {
            Some(total) if total > 0 => {
                Some((self.frames_done.min(total) as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

/// Turns a frame counter into rate-limited [`ProgressSample`]s.
///
/// A sample is produced when at least `interval` has passed since the last
/// one, on the frame that reaches the known total, and once more at
/// [`finish`](Self::finish) if the final count was not already reported.
#[derive(Debug)]
pub struct ThroughputTracker {
    started: Instant,
    last_emit: Instant,
    last_frames: Option<u64>,
    frames_total: Option<u64>,
    interval: Duration,
}

impl ThroughputTracker {
    pub fn new(frames_total: Option<u64>, interval: Duration, now: Instant) -> Self {
        Self {
            started: now,
            last_emit: now,
            last_frames: None,
            frames_total: frames_total.filter(|&t| t > 0),
            interval,
        }
    }

    pub fn record(&mut self, frames_done: u64, now: Instant) -> Option<ProgressSample> {
        let reached_total = self.frames_total == Some(frames_done);
        if !reached_total && now.duration_since(self.last_emit) < self.interval {
            return None;
        }
        Some(self.emit(frames_done, now))
    }

    pub fn finish(&mut self, frames_done: u64, now: Instant) -> Option<ProgressSample> {
        if self.last_frames == Some(frames_done) {
            return None;
        }
        Some(self.emit(frames_done, now))
    }

    fn emit(&mut self, frames_done: u64, now: Instant) -> ProgressSample {
        self.last_emit = now;
        self.last_frames = Some(frames_done);
        let elapsed = now.duration_since(self.started);
        let fps = average_rate(frames_done, elapsed);
        ProgressSample {
            frames_done,
            frames_total: self.frames_total,
            elapsed,
            fps,
            eta: self
                .frames_total
                .and_then(|total| compute_eta(total, frames_done, fps)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        self.mode.resolve(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

impl ProgressMode {
    fn resolve(self, stderr_is_tty: bool) -> ResolvedProgressMode {
        match self {
            ProgressMode::Auto => {
                if stderr_is_tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub frames_done: u64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Terminal renderer for job progress. The handle is a [`JobObserver`].
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

struct ProgressInner {
    label: String,
    mode: ResolvedProgressMode,
    idle_threshold: Duration,
    plain_interval: Duration,
    state: Mutex<ReporterState>,
    rich: Option<RichUi>,
    stop: AtomicBool,
    finalized: AtomicBool,
}

struct RichUi {
    _multi: MultiProgress,
    overall: ProgressBar,
    stage: ProgressBar,
}

#[derive(Debug)]
struct ReporterState {
    started: Instant,
    stage: String,
    job: Option<String>,
    sample: Option<ProgressSample>,
    last_progress: Instant,
    last_plain_emit: Instant,
    last_idle_warn: Option<Instant>,
    /// Frames from jobs already finished in this session.
    finished_frames: u64,
    frames_done: u64,
    warnings: Vec<String>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();

        let rich = if mode == ResolvedProgressMode::Rich {
            Some(RichUi::new(&label))
        } else {
            None
        };

        let inner = Arc::new(ProgressInner {
            label,
            mode,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            state: Mutex::new(ReporterState {
                started: now,
                stage: "starting".to_string(),
                job: None,
                sample: None,
                last_progress: now,
                last_plain_emit: now.checked_sub(config.plain_interval).unwrap_or(now),
                last_idle_warn: None,
                finished_frames: 0,
                frames_done: 0,
                warnings: Vec::new(),
            }),
            rich,
            stop: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        let ticker_inner = Arc::clone(&inner);
        let ticker = thread::spawn(move || {
            while !ticker_inner.stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(250));
                ticker_inner.tick_once();
            }
        });

        Self {
            handle: ProgressHandle { inner },
            ticker: Some(ticker),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.shutdown_ticker();
        self.handle.inner.finalize(Some(final_message.into()))
    }

    fn shutdown_ticker(&mut self) {
        self.handle.inner.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown_ticker();
        let _ = self.handle.inner.finalize(None);
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        {
            let mut state = self.inner.lock();
            state.stage = stage.into();
        }
        self.inner.render(true);
    }

    /// Starts a new job section; totals keep accumulating across jobs.
    pub fn begin_job(&self, job: impl Into<String>) {
        {
            let mut state = self.inner.lock();
            let now = Instant::now();
            let job = job.into();
            state.stage = job.clone();
            state.job = Some(job);
            state.sample = None;
            state.finished_frames = state.frames_done;
            state.last_progress = now;
            state.last_idle_warn = None;
        }
        self.inner.render(true);
    }

    pub fn update(&self, sample: &ProgressSample) {
        {
            let mut state = self.inner.lock();
            let now = Instant::now();
            let advanced = state
                .sample
                .as_ref()
                .map_or(true, |prev| sample.frames_done > prev.frames_done);
            if advanced {
                state.last_progress = now;
                state.frames_done = state.finished_frames + sample.frames_done;
            }
            state.sample = Some(sample.clone());
        }
        self.inner.render(false);
    }
}

impl JobObserver for ProgressHandle {
    fn on_state(&self, state: PipelineState) {
        let job = self.inner.lock().job.clone();
        match job {
            Some(job) => self.set_stage(format!("{job} ({state})")),
            None => self.set_stage(state.to_string()),
        }
    }

    fn on_progress(&self, sample: &ProgressSample) {
        self.update(sample);
    }

    fn on_job_started(&self, index: usize, total: usize, input: &Path) {
        self.begin_job(format!("job {}/{}: {}", index + 1, total, input.display()));
    }
}

impl ProgressInner {
    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick_once(&self) {
        if self.mode == ResolvedProgressMode::Quiet {
            return;
        }

        let (plain_due, idle_warning) = {
            let mut state = self.lock();
            let now = Instant::now();

            let plain_due = now.duration_since(state.last_plain_emit) >= self.plain_interval;
            if plain_due {
                state.last_plain_emit = now;
            }

            let done = state
                .sample
                .as_ref()
                .and_then(|s| s.frames_total.map(|t| s.frames_done >= t))
                .unwrap_or(false);
            let idle_due = idle_warning_due(
                now,
                state.last_progress,
                state.last_idle_warn,
                self.idle_threshold,
                done,
            );
            let idle_warning = if idle_due {
                state.last_idle_warn = Some(now);
                let msg = format!(
                    "IDLE WARNING: no frame progress for {}s (stage={})",
                    now.duration_since(state.last_progress).as_secs(),
                    state.stage,
                );
                push_warning_locked(&mut state, &msg);
                Some(msg)
            } else {
                None
            };
            (plain_due, idle_warning)
        };

        if self.mode == ResolvedProgressMode::Rich {
            self.render_rich();
        } else if plain_due {
            self.render_plain();
        }

        if let Some(msg) = idle_warning {
            self.emit_message("WARN", &msg);
        }
    }

    fn render(&self, force_plain: bool) {
        match self.mode {
            ResolvedProgressMode::Rich => self.render_rich(),
            ResolvedProgressMode::Plain => {
                let due = {
                    let mut state = self.lock();
                    let now = Instant::now();
                    let due = force_plain
                        || now.duration_since(state.last_plain_emit) >= self.plain_interval;
                    if due {
                        state.last_plain_emit = now;
                    }
                    due
                };
                if due {
                    self.render_plain();
                }
            }
            ResolvedProgressMode::Quiet => {}
        }
    }

    fn render_rich(&self) {
        let Some(rich) = &self.rich else {
            return;
        };
        let (stage, sample, elapsed) = {
            let state = self.lock();
            (state.stage.clone(), state.sample.clone(), state.started.elapsed())
        };

        match sample.as_ref().and_then(|s| s.frames_total) {
            Some(total) => rich.overall.set_length(total),
            None => rich.overall.set_length(0),
        }
        if let Some(sample) = &sample {
            rich.overall.set_position(sample.frames_done);
            rich.overall.set_message(format!(
                "{:.1} fps ETA {}",
                sample.fps,
                format_eta(sample.eta)
            ));
        }
        rich.stage.set_message(format!(
            "{} | elapsed {}",
            stage,
            format_duration(elapsed)
        ));
    }

    fn render_plain(&self) {
        let (stage, sample, elapsed) = {
            let state = self.lock();
            (state.stage.clone(), state.sample.clone(), state.started.elapsed())
        };
        let Some(sample) = sample else {
            eprintln!(
                "[PROGRESS] {} elapsed={} stage={}",
                self.label,
                format_duration(elapsed),
                stage
            );
            return;
        };
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} frames={} / {} ({}) fps={:.1} ETA={}",
            self.label,
            format_duration(sample.elapsed),
            stage,
            sample.frames_done,
            sample
                .frames_total
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string()),
            format_percent(sample.percent()),
            sample.fps,
            format_eta(sample.eta),
        );
    }

    fn emit_message(&self, level: &str, message: &str) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[{}] {}: {}", level, self.label, message);
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.stage
                        .println(format!("[{}] {}: {}", level, self.label, message));
                } else {
                    eprintln!("[{}] {}: {}", level, self.label, message);
                }
            }
        }
    }

    fn finalize(&self, final_message: Option<String>) -> ProgressOutcome {
        if !self.finalized.swap(true, Ordering::Relaxed) {
            match self.mode {
                ResolvedProgressMode::Quiet => {}
                ResolvedProgressMode::Plain => {
                    self.render_plain();
                    if let Some(msg) = final_message.as_deref() {
                        eprintln!("[DONE] {}: {}", self.label, msg);
                    }
                }
                ResolvedProgressMode::Rich => {
                    if let Some(rich) = &self.rich {
                        self.render_rich();
                        rich.overall.finish();
                        match final_message {
                            Some(msg) => rich.stage.finish_with_message(msg),
                            None => rich.stage.finish_and_clear(),
                        }
                    }
                }
            }
        }
        self.outcome()
    }

    fn outcome(&self) -> ProgressOutcome {
        let state = self.lock();
        ProgressOutcome {
            elapsed: state.started.elapsed(),
            frames_done: state.frames_done,
            warning_count: state.warnings.len(),
            warnings: state.warnings.clone(),
        }
    }
}

impl RichUi {
    fn new(label: &str) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(0));
        let stage = multi.add(ProgressBar::new_spinner());

        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} frames | {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        overall.set_style(style);
        overall.set_message(format!("{} starting", label));

        let stage_style = ProgressStyle::with_template("{spinner:.yellow} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("|/-\\ ");
        stage.set_style(stage_style);
        stage.enable_steady_tick(Duration::from_millis(120));
        stage.set_message("starting");

        Self {
            _multi: multi,
            overall,
            stage,
        }
    }
}

fn push_warning_locked(state: &mut ReporterState, message: &str) {
    if state.warnings.len() >= MAX_STORED_WARNINGS {
        state.warnings.remove(0);
    }
    state.warnings.push(message.to_string());
}

pub fn average_rate(frames: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return 0.0;
    }
    frames as f64 / secs
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_duration)
        .unwrap_or_else(|| "--:--".to_string())
}

pub fn format_percent(percent: Option<f64>) -> String {
    percent
        .map(|p| format!("{:.1}%", p))
        .unwrap_or_else(|| "--.-%".to_string())
}

fn compute_eta(total_frames: u64, frames_done: u64, fps: f64) -> Option<Duration> {
    if fps <= f64::EPSILON || frames_done >= total_frames {
        return None;
    }
    let remaining = total_frames.saturating_sub(frames_done) as f64;
    Some(Duration::from_secs_f64((remaining / fps).max(0.0)))
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    done: bool,
) -> bool {
    if done {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    match last_idle_warn {
        Some(last_warn) => now.duration_since(last_warn) >= idle_threshold,
        None => true,
    }
}
