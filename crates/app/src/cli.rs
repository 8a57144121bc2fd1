use std::{path::PathBuf, time::Duration};

use capture_service::{CaptureCliArgs, TelemetryOptions, telemetry};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "realtime-capture",
    version,
    about = "Capture video, analyse it on a worker thread, stream features as JSON lines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a capture session and print feature packets to stdout.
    Run(RunArgs),
    /// List attached capture devices.
    Devices,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProcessorKind {
    /// Per-cell motion against the previous frame.
    Motion,
    /// TorchScript object detector (requires `with-tch`).
    Detector,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub capture: CaptureCliArgs,
    /// Stop after this many seconds (default: until the stream ends or Ctrl+C).
    #[arg(long = "duration", value_name = "SECS")]
    pub duration: Option<f64>,
    /// Switch from preview to analysis after this many seconds.
    #[arg(long = "analysis-after", value_name = "SECS", default_value_t = 1.0)]
    pub analysis_after: f64,
    /// Polling cadence of the control loop.
    #[arg(long = "tick-ms", value_name = "MS", default_value_t = 30)]
    pub tick_ms: u64,
    /// Capture width in pixels.
    #[arg(
        long = "width",
        value_name = "PX",
        default_value_t = 640,
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(
        long = "height",
        value_name = "PX",
        default_value_t = 480,
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    pub height: i32,
    /// How long each open attempt waits for the first frame (FFmpeg backend).
    #[arg(
        long = "first-frame-timeout-ms",
        value_name = "MS",
        default_value_t = video_ingest::DEFAULT_FIRST_FRAME_TIMEOUT.as_millis() as u64
    )]
    pub first_frame_timeout_ms: u64,
    #[arg(long = "processor", value_enum, default_value_t = ProcessorKind::Motion)]
    pub processor: ProcessorKind,
    /// Write the last polled frame to this image file on exit.
    #[arg(long = "snapshot", value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
    /// Print Prometheus metrics on exit.
    #[arg(long = "print-metrics", action = clap::ArgAction::SetTrue)]
    pub print_metrics: bool,
}

impl RunArgs {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn analysis_after(&self) -> Duration {
        Duration::from_secs_f64(self.analysis_after.max(0.0))
    }

    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms.max(1))
    }
}

pub fn print_devices() {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let cameras = video_ingest::list_cameras();
    if cameras.is_empty() {
        println!("No capture devices found");
        return;
    }
    for (index, name) in cameras {
        println!("{index}: {name}");
    }
}
