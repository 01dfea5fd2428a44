use image::RgbImage;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("could not open video {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
    #[error("could not create output video {}: {reason}", path.display())]
    Create { path: PathBuf, reason: String },
    #[error("failed to read frame {frame} from {}: {reason}", path.display())]
    Read {
        path: PathBuf,
        frame: u64,
        reason: String,
    },
    #[error("failed to write frame {frame} to {}: {reason}", path.display())]
    Write {
        path: PathBuf,
        frame: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Parses ffprobe's `30000/1001` or a plain integer. Zero rates are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (num, den) = match raw.split_once('/') {
            Some((n, d)) => (n.parse().ok()?, d.parse().ok()?),
            None => (raw.parse().ok()?, 1),
        };
        if num == 0 || den == 0 {
            return None;
        }
        Some(Self { num, den })
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// `None` when the container does not report a usable count.
    pub frame_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

pub trait FrameSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Next frame in source order, `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;
}

pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError>;

    /// Flushes and closes the output. Dropping without `finish` abandons it.
    fn finish(&mut self) -> Result<(), MediaError>;
}

/// Opens decoders and encoders for a pipeline run.
pub trait MediaIo: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError>;

    fn create_sink(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn FrameSink>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub codec: String,
    /// Passed as `-q:v`; lower is better.
    pub quality: u32,
    /// Encoder threads, 0 lets ffmpeg decide.
    pub threads: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "mpeg4".to_string(),
            quality: 2,
            threads: num_cpus::get().max(1),
        }
    }
}

/// ffmpeg/ffprobe subprocess backend speaking raw rgb24 over pipes.
#[derive(Debug, Clone)]
pub struct FfmpegIo {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub encoder: EncoderSettings,
}

impl Default for FfmpegIo {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            encoder: EncoderSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

impl FfmpegIo {
    pub fn probe(&self, path: &Path) -> Result<SourceInfo, MediaError> {
        let open_err = |reason: String| MediaError::Open {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(open_err("no such file".to_string()));
        }

        let out = tool_command(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,r_frame_rate,avg_frame_rate,nb_frames")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .map_err(|e| open_err(format!("failed to run {}: {e}", self.ffprobe.display())))?;
        if !out.status.success() {
            return Err(open_err(format!(
                "ffprobe exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_probe(&out.stdout).map_err(open_err)
    }
}

fn parse_probe(stdout: &[u8]) -> Result<SourceInfo, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|e| format!("unreadable ffprobe output: {e}"))?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| "no video stream".to_string())?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no dimensions".to_string()),
    };
    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(FrameRate::parse)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(FrameRate::parse))
        .unwrap_or_default();
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok())
        .filter(|&n| n > 0);

    Ok(SourceInfo {
        width,
        height,
        frame_rate,
        frame_count,
    })
}

impl MediaIo for FfmpegIo {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        let info = self.probe(path)?;

        let mut child = tool_command(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-noautorotate")
            .arg("-i")
            .arg(path)
            .arg("-map")
            .arg("0:v:0")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MediaError::Open {
                path: path.to_path_buf(),
                reason: format!("spawn ffmpeg decode: {e}"),
            })?;

        let stderr = child.stderr.take().map(spawn_stderr_collector);
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(MediaError::Open {
                path: path.to_path_buf(),
                reason: "ffmpeg stdout missing".to_string(),
            });
        };

        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = %info.frame_rate,
            frames = ?info.frame_count,
            "decoder started"
        );

        Ok(Box::new(FfmpegSource {
            path: path.to_path_buf(),
            frame_bytes: info.width as usize * info.height as usize * 3,
            info,
            child,
            stdout: BufReader::with_capacity(4 * 1024 * 1024, stdout),
            stderr,
            frames_read: 0,
            exhausted: false,
        }))
    }

    fn create_sink(&self, path: &Path, spec: &SinkSpec) -> Result<Box<dyn FrameSink>, MediaError> {
        let create_err = |reason: String| MediaError::Create {
            path: path.to_path_buf(),
            reason,
        };
        if spec.width == 0 || spec.height == 0 {
            return Err(create_err(format!(
                "invalid output size {}x{}",
                spec.width, spec.height
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(create_err(format!(
                    "directory {} does not exist",
                    parent.display()
                )));
            }
        }

        let mut cmd = tool_command(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{}x{}", spec.width, spec.height))
            .arg("-r")
            .arg(spec.frame_rate.to_string())
            .arg("-i")
            .arg("pipe:0")
            .arg("-an")
            .arg("-c:v")
            .arg(&self.encoder.codec)
            .arg("-q:v")
            .arg(self.encoder.quality.to_string())
            .arg("-pix_fmt")
            .arg("yuv420p");
        if self.encoder.threads > 0 {
            cmd.arg("-threads").arg(self.encoder.threads.to_string());
        }
        cmd.arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| create_err(format!("spawn ffmpeg encode: {e}")))?;
        let stderr = child.stderr.take().map(spawn_stderr_collector);
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            return Err(create_err("ffmpeg stdin missing".to_string()));
        };

        Ok(Box::new(FfmpegSink {
            path: path.to_path_buf(),
            frame_bytes: spec.width as usize * spec.height as usize * 3,
            spec: spec.clone(),
            child,
            stdin: Some(BufWriter::with_capacity(8 * 1024 * 1024, stdin)),
            stderr,
            frames_written: 0,
        }))
    }
}

struct FfmpegSource {
    path: PathBuf,
    info: SourceInfo,
    frame_bytes: usize,
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<Vec<String>>>,
    frames_read: u64,
    exhausted: bool,
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        if self.exhausted {
            return Ok(None);
        }
        let read_err = |frame: u64, reason: String| MediaError::Read {
            path: self.path.clone(),
            frame,
            reason,
        };

        let mut buf = vec![0u8; self.frame_bytes];
        let n = read_exact_or_eof(&mut self.stdout, &mut buf)
            .map_err(|e| read_err(self.frames_read, e.to_string()))?;
        if n < self.frame_bytes {
            self.exhausted = true;
            if n > 0 {
                debug!(path = %self.path.display(), bytes = n, "dropping truncated trailing frame");
            }
            let status = self
                .child
                .wait()
                .map_err(|e| read_err(self.frames_read, e.to_string()))?;
            let tail = self.stderr.take().map(join_stderr).unwrap_or_default();
            if !status.success() {
                return Err(read_err(
                    self.frames_read,
                    format!("ffmpeg decode exited with {status}: {tail}"),
                ));
            }
            return Ok(None);
        }

        self.frames_read += 1;
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| read_err(self.frames_read, "frame buffer size mismatch".to_string()))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if !self.exhausted {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct FfmpegSink {
    path: PathBuf,
    spec: SinkSpec,
    frame_bytes: usize,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<Vec<String>>>,
    frames_written: u64,
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        let write_err = |reason: String| MediaError::Write {
            path: self.path.clone(),
            frame: self.frames_written,
            reason,
        };
        if frame.dimensions() != (self.spec.width, self.spec.height)
            || frame.as_raw().len() != self.frame_bytes
        {
            return Err(write_err(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.spec.width,
                self.spec.height
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(write_err("encoder already finished".to_string()));
        };
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| write_err(e.to_string()))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        let write_err = |reason: String| MediaError::Write {
            path: self.path.clone(),
            frame: self.frames_written,
            reason,
        };
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().map_err(|e| write_err(e.to_string()))?;
        }
        let status = self.child.wait().map_err(|e| write_err(e.to_string()))?;
        let tail = self.stderr.take().map(join_stderr).unwrap_or_default();
        if !status.success() {
            return Err(write_err(format!("ffmpeg encode exited with {status}: {tail}")));
        }
        debug!(path = %self.path.display(), frames = self.frames_written, "encoder finished");
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn read_exact_or_eof(r: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0usize;
    while got < buf.len() {
        let n = r.read(&mut buf[got..])?;
        if n == 0 {
            return Ok(got);
        }
        got += n;
    }
    Ok(got)
}

/// Command for an external tool. On unix the child gets its own process group,
/// so a terminal Ctrl-C reaches only us and cancellation stays cooperative.
pub(crate) fn tool_command(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

pub(crate) fn spawn_stderr_collector(
    stderr: impl Read + Send + 'static,
) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = line.trim().to_string();
            if cleaned.is_empty() {
                continue;
            }
            lines.push_back(cleaned);
            if lines.len() > STDERR_TAIL_LINES {
                lines.pop_front();
            }
        }

        lines.into_iter().collect::<Vec<_>>()
    })
}

pub(crate) fn join_stderr(handle: JoinHandle<Vec<String>>) -> String {
    handle.join().unwrap_or_default().join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(FrameRate::parse("30000/1001"), Some(FrameRate::new(30000, 1001)));
        assert_eq!(FrameRate::parse("25"), Some(FrameRate::new(25, 1)));
        assert_eq!(FrameRate::parse("0/0"), None);
        assert_eq!(FrameRate::parse("abc"), None);
        assert!((FrameRate::new(30000, 1001).as_f64() - 29.97).abs() < 0.01);
        assert_eq!(FrameRate::new(24, 1).to_string(), "24/1");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tool_children_lead_their_own_process_group() {
        let Ok(out) = tool_command(Path::new("sh"))
            .arg("-c")
            .arg("cat /proc/$$/stat")
            .output()
        else {
            return;
        };
        let stat = String::from_utf8_lossy(&out.stdout);
        let pid = stat.split_whitespace().next().unwrap_or_default().to_string();
        // fields after the command name: state, ppid, pgrp
        let pgrp = stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.split_whitespace().nth(2))
            .unwrap_or_default();
        if pid.is_empty() {
            return;
        }
        assert_eq!(pgrp, pid, "{stat}");
    }

    #[test]
    fn probe_json_with_frame_count() {
        let json = br#"{"streams":[{"width":5792,"height":2896,"r_frame_rate":"30000/1001","avg_frame_rate":"30000/1001","nb_frames":"1800"}]}"#;
        let info = parse_probe(json).expect("parse");
        assert_eq!((info.width, info.height), (5792, 2896));
        assert_eq!(info.frame_rate, FrameRate::new(30000, 1001));
        assert_eq!(info.frame_count, Some(1800));
    }

    #[test]
    fn probe_json_without_count_is_unknown() {
        let json = br#"{"streams":[{"width":640,"height":320,"r_frame_rate":"0/0","avg_frame_rate":"24/1"}]}"#;
        let info = parse_probe(json).expect("parse");
        assert_eq!(info.frame_rate, FrameRate::new(24, 1));
        assert_eq!(info.frame_count, None);

        let zero = br#"{"streams":[{"width":640,"height":320,"nb_frames":"0"}]}"#;
        let info = parse_probe(zero).expect("parse");
        assert_eq!(info.frame_count, None);
        assert_eq!(info.frame_rate, FrameRate::default());
    }

    #[test]
    fn probe_without_video_stream_fails() {
        assert!(parse_probe(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe(br#"{}"#).is_err());
        assert!(parse_probe(b"garbage").is_err());
    }

    #[test]
    fn missing_input_is_open_error_with_path() {
        let io = FfmpegIo::default();
        let err = io
            .open_source(Path::new("/definitely/not/here.mp4"))
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, MediaError::Open { .. }));
        assert!(err.to_string().contains("/definitely/not/here.mp4"));
    }
}
