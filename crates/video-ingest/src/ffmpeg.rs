//! FFmpeg subprocess backend.
//!
//! Each opened device is an `ffmpeg` child process decoding the source into
//! raw BGR24 frames of a fixed size on its stdout. Opening waits a bounded
//! time for the first frame so that a missing device, unreadable file or
//! silent stream surfaces as an unopened handle (and is retried) rather than
//! as an immediate end of stream or an indefinite hang.
//!
//! Numeric device indices map to V4L2 on Linux and AVFoundation on macOS.
//! DirectShow addresses cameras by name, so on Windows pass `video=<name>`.

use std::{
    ffi::OsString,
    io::{self, Read},
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::{
    source::{CaptureBackend, CaptureDevice, SourceTarget},
    types::{CaptureError, Frame, FrameFormat, check_frame_size},
};

/// How long `open` waits for ffmpeg to deliver the first frame.
pub const DEFAULT_FIRST_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawns `ffmpeg` per opened source and reads scaled BGR24 frames from it.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    program: OsString,
    frame_size: (i32, i32),
    first_frame_timeout: Duration,
}

impl FfmpegBackend {
    /// Frames are scaled to `frame_size` (width, height).
    pub fn new(frame_size: (i32, i32)) -> Self {
        Self {
            program: OsString::from("ffmpeg"),
            frame_size,
            first_frame_timeout: DEFAULT_FIRST_FRAME_TIMEOUT,
        }
    }

    /// Use a specific `ffmpeg` executable instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_first_frame_timeout(mut self, timeout: Duration) -> Self {
        self.first_frame_timeout = timeout;
        self
    }

    /// Arguments passed to `ffmpeg` for `target`.
    pub(crate) fn command_args(&self, target: &SourceTarget) -> Result<Vec<String>, CaptureError> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .into_iter()
            .map(String::from)
            .collect();

        match target {
            SourceTarget::DeviceIndex(index) => {
                let (format, input) = device_input(*index)?;
                args.extend(["-f".into(), format.into(), "-i".into(), input]);
            }
            SourceTarget::Uri(uri) => {
                if let Some(index) = parse_device_index(uri) {
                    let (format, input) = device_input(index)?;
                    args.extend(["-f".into(), format.into(), "-i".into(), input]);
                } else if cfg!(target_os = "windows") && uri.starts_with("video=") {
                    args.extend(["-f".into(), "dshow".into(), "-i".into(), uri.clone()]);
                } else {
                    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
                        args.extend(["-rtsp_transport".into(), "tcp".into()]);
                    }
                    args.extend(["-i".into(), uri.clone()]);
                }
            }
        }

        args.extend([
            "-an".into(),
            "-vf".into(),
            format!("scale={}:{}", self.frame_size.0, self.frame_size.1),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-f".into(),
            "rawvideo".into(),
            "-".into(),
        ]);
        Ok(args)
    }
}

impl CaptureBackend for FfmpegBackend {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        check_frame_size(self.frame_size)?;
        let args = self.command_args(target)?;
        debug!("Launching {:?} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                uri: target.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let mut device = FfmpegDevice {
            child: Some(child),
            stdout: None,
            frame_size: self.frame_size,
            pending: None,
        };
        match stdout {
            Some(stdout) => device.prime(stdout, self.first_frame_timeout),
            None => device.release(),
        }
        Ok(Box::new(device))
    }
}

struct FfmpegDevice {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    frame_size: (i32, i32),
    pending: Option<Frame>,
}

impl FfmpegDevice {
    /// Wait up to `timeout` for the first frame so `is_opened` reflects
    /// whether ffmpeg could actually decode the source. The read runs on a
    /// helper thread; on timeout the child is killed, which unblocks it.
    fn prime(&mut self, mut stdout: ChildStdout, timeout: Duration) {
        let frame_size = self.frame_size;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("ffmpeg-first-frame".into())
            .spawn(move || {
                let first = read_frame(&mut stdout, frame_size);
                let _ = tx.send((stdout, first));
            });
        if let Err(err) = spawned {
            warn!("failed to start first-frame reader: {err}");
            self.release();
            return;
        }

        match rx.recv_timeout(timeout) {
            Ok((stdout, Ok(Some(frame)))) => {
                self.stdout = Some(stdout);
                self.pending = Some(frame);
            }
            Ok((_, Ok(None))) => {
                debug!("ffmpeg produced no frames; treating source as unavailable");
                self.release();
            }
            Ok((_, Err(err))) => {
                warn!("ffmpeg failed before the first frame: {err}");
                self.release();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("ffmpeg produced no frame within {timeout:?}; giving up on this attempt");
                self.release();
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("first-frame reader exited without a result");
                self.release();
            }
        }
    }
}

fn read_frame(
    stdout: &mut ChildStdout,
    (width, height): (i32, i32),
) -> Result<Option<Frame>, CaptureError> {
    let len = FrameFormat::Bgr8.bytes_per_pixel() * width.max(0) as usize * height.max(0) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut buffer = vec![0u8; len];
    match stdout.read_exact(&mut buffer) {
        Ok(()) => Ok(Some(Frame::now(buffer, width, height, FrameFormat::Bgr8))),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(CaptureError::Read(err)),
    }
}

impl CaptureDevice for FfmpegDevice {
    fn is_opened(&self) -> bool {
        self.stdout.is_some()
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match self.stdout.as_mut() {
            Some(stdout) => read_frame(stdout, self.frame_size),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.pending = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Parse a `/dev/videoX` style URI and return the index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

/// Platform capture format and input name for a numeric device.
#[cfg(target_os = "macos")]
fn device_input(index: i32) -> Result<(&'static str, String), CaptureError> {
    Ok(("avfoundation", format!("{index}:none")))
}

#[cfg(target_os = "windows")]
fn device_input(index: i32) -> Result<(&'static str, String), CaptureError> {
    Err(CaptureError::Other(anyhow::anyhow!(
        "DirectShow opens cameras by name; use `video=<device name>` instead of index {index}"
    )))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn device_input(index: i32) -> Result<(&'static str, String), CaptureError> {
    Ok(("video4linux2", format!("/dev/video{index}")))
}
