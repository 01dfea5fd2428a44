//! In-memory media backend and recording observer for unit tests.

use image::RgbImage;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::Level;

use crate::image_ops::gradient_frame;
use crate::job::{CancellationToken, JobReport};
use crate::media::{FrameRate, FrameSink, FrameSource, MediaError, MediaIo, SinkSpec, SourceInfo};
use crate::mux::{AudioMuxer, MuxError};
use crate::pipeline::{JobObserver, PipelineState};
use crate::progress::ProgressSample;

#[derive(Clone)]
pub(crate) struct Clip {
    pub frames: Vec<RgbImage>,
    pub report_count: bool,
    pub fail_at: Option<u64>,
    pub cancel_after: Option<(u64, CancellationToken)>,
    pub interrupt_at: Option<(u64, CancellationToken)>,
}

impl Clip {
    pub fn gradient(count: usize, width: u32, height: u32) -> Self {
        Self {
            frames: (0..count).map(|_| gradient_frame(width, height)).collect(),
            report_count: true,
            fail_at: None,
            cancel_after: None,
            interrupt_at: None,
        }
    }

    pub fn without_count(mut self) -> Self {
        self.report_count = false;
        self
    }

    pub fn failing_at(mut self, frame: u64) -> Self {
        self.fail_at = Some(frame);
        self
    }

    pub fn cancelling_after(mut self, frames: u64, token: CancellationToken) -> Self {
        self.cancel_after = Some((frames, token));
        self
    }

    /// Cancels and then fails the read of `frame`, like a decoder killed by Ctrl-C.
    pub fn interrupted_at(mut self, frame: u64, token: CancellationToken) -> Self {
        self.interrupt_at = Some((frame, token));
        self
    }
}

/// Serves registered clips; sinks write a small text file describing what they got.
#[derive(Default)]
pub(crate) struct MemoryIo {
    clips: Mutex<HashMap<PathBuf, Clip>>,
    pub sinks: Arc<Mutex<Vec<SinkRecord>>>,
    sink_interrupt: Option<(u64, CancellationToken)>,
}

#[derive(Debug, Clone)]
pub(crate) struct SinkRecord {
    pub path: PathBuf,
    pub spec: SinkSpec,
    pub frames: u64,
    pub finished: bool,
}

impl MemoryIo {
    pub fn with_clip(self, path: impl Into<PathBuf>, clip: Clip) -> Self {
        self.clips
            .lock()
            .expect("clips lock")
            .insert(path.into(), clip);
        self
    }

    /// Sinks cancel and then fail once `frames` frames have been written.
    pub fn with_sink_interrupted_after(mut self, frames: u64, token: CancellationToken) -> Self {
        self.sink_interrupt = Some((frames, token));
        self
    }

    pub fn sink_records(&self) -> Vec<SinkRecord> {
        self.sinks.lock().expect("sinks lock").clone()
    }
}

impl MediaIo for MemoryIo {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        let clip = self
            .clips
            .lock()
            .expect("clips lock")
            .get(path)
            .cloned()
            .ok_or_else(|| MediaError::Open {
                path: path.to_path_buf(),
                reason: "no such file".to_string(),
            })?;
        let (width, height) = clip.frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        Ok(Box::new(MemorySource {
            path: path.to_path_buf(),
            info: SourceInfo {
                width,
                height,
                frame_rate: FrameRate::new(30, 1),
                frame_count: clip.report_count.then_some(clip.frames.len() as u64),
            },
            clip,
            next: 0,
        }))
    }

    fn create_sink(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn FrameSink>, MediaError> {
        fs::File::create(path).map_err(|e| MediaError::Create {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let index = {
            let mut sinks = self.sinks.lock().expect("sinks lock");
            sinks.push(SinkRecord {
                path: path.to_path_buf(),
                spec: spec.clone(),
                frames: 0,
                finished: false,
            });
            sinks.len() - 1
        };
        Ok(Box::new(MemorySink {
            records: Arc::clone(&self.sinks),
            index,
            interrupt: self.sink_interrupt.clone(),
        }))
    }
}

struct MemorySource {
    path: PathBuf,
    info: SourceInfo,
    clip: Clip,
    next: usize,
}

impl FrameSource for MemorySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        if let Some((after, token)) = &self.clip.cancel_after {
            if self.next as u64 >= *after {
                token.cancel();
            }
        }
        if let Some((at, token)) = &self.clip.interrupt_at {
            if self.next as u64 == *at {
                token.cancel();
                return Err(MediaError::Read {
                    path: self.path.clone(),
                    frame: *at,
                    reason: "ffmpeg exited with signal 2 (SIGINT)".to_string(),
                });
            }
        }
        if self.clip.fail_at == Some(self.next as u64) {
            return Err(MediaError::Read {
                path: self.path.clone(),
                frame: self.next as u64,
                reason: "corrupt packet".to_string(),
            });
        }
        let frame = self.clip.frames.get(self.next).cloned();
        if frame.is_some() {
            self.next += 1;
        }
        Ok(frame)
    }
}

struct MemorySink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
    index: usize,
    interrupt: Option<(u64, CancellationToken)>,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        let mut records = self.records.lock().expect("sinks lock");
        let record = &mut records[self.index];
        if let Some((after, token)) = &self.interrupt {
            if record.frames >= *after {
                token.cancel();
                return Err(MediaError::Write {
                    path: record.path.clone(),
                    frame: record.frames,
                    reason: "Broken pipe (os error 32)".to_string(),
                });
            }
        }
        if frame.dimensions() != (record.spec.width, record.spec.height) {
            return Err(MediaError::Write {
                path: record.path.clone(),
                frame: record.frames,
                reason: "wrong frame size".to_string(),
            });
        }
        record.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        let mut records = self.records.lock().expect("sinks lock");
        let record = &mut records[self.index];
        record.finished = true;
        fs::write(
            &record.path,
            format!(
                "video {}x{} frames={}\n",
                record.spec.width, record.spec.height, record.frames
            ),
        )
        .map_err(|e| MediaError::Write {
            path: record.path.clone(),
            frame: record.frames,
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxBehaviour {
    Copy,
    Unavailable,
    Fail,
}

pub(crate) struct FakeMuxer {
    behaviour: MuxBehaviour,
    cancel_on_call: Option<CancellationToken>,
    pub calls: AtomicUsize,
}

impl FakeMuxer {
    pub fn new(behaviour: MuxBehaviour) -> Self {
        Self {
            behaviour,
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Cancels `token` as soon as the mux starts, like Ctrl-C during the remux.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AudioMuxer for FakeMuxer {
    fn mux(&self, video_only: &Path, _original: &Path, output: &Path) -> Result<(), MuxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        match self.behaviour {
            MuxBehaviour::Copy => {
                let io_err = |source| MuxError::Io {
                    output: output.to_path_buf(),
                    source,
                };
                fs::copy(video_only, output).map_err(io_err)?;
                let mut file = fs::OpenOptions::new()
                    .append(true)
                    .open(output)
                    .map_err(io_err)?;
                file.write_all(b"audio\n").map_err(io_err)
            }
            MuxBehaviour::Unavailable => Err(MuxError::Unavailable {
                tool: PathBuf::from("ffmpeg"),
            }),
            MuxBehaviour::Fail => {
                let _ = fs::write(output, b"partial");
                Err(MuxError::Failed {
                    output: output.to_path_buf(),
                    status: "exit status: 1".to_string(),
                    stderr: "no audio decoder".to_string(),
                })
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub states: Mutex<Vec<PipelineState>>,
    pub samples: Mutex<Vec<ProgressSample>>,
    pub logs: Mutex<Vec<(Level, String)>>,
    pub started: Mutex<Vec<(usize, usize, PathBuf)>>,
    pub finished: Mutex<Vec<(usize, String)>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<PipelineState> {
        self.states.lock().expect("lock").clone()
    }

    pub fn samples(&self) -> Vec<ProgressSample> {
        self.samples.lock().expect("lock").clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.logs
            .lock()
            .expect("lock")
            .iter()
            .filter(|(level, _)| *level == Level::WARN)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl JobObserver for RecordingObserver {
    fn on_state(&self, state: PipelineState) {
        self.states.lock().expect("lock").push(state);
    }

    fn on_progress(&self, sample: &ProgressSample) {
        self.samples.lock().expect("lock").push(sample.clone());
    }

    fn on_log(&self, level: Level, message: &str) {
        self.logs.lock().expect("lock").push((level, message.to_string()));
    }

    fn on_job_started(&self, index: usize, total: usize, input: &Path) {
        self.started
            .lock()
            .expect("lock")
            .push((index, total, input.to_path_buf()));
    }

    fn on_job_finished(&self, index: usize, report: &JobReport) {
        self.finished
            .lock()
            .expect("lock")
            .push((index, report.status.label().to_string()));
    }
}
