//! Configuration for capture sessions.
//!
//! [`CaptureConfig`] is the opaque key/value mapping handed to the worker;
//! [`CaptureCliArgs`] turns command-line flags into one. Timing knobs for the
//! worker loop and the service live in [`LoopTiming`] and [`ServiceOptions`].

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use serde::{Deserialize, Serialize};
use video_ingest::RetryPolicy;

use crate::channels::DEFAULT_FEATURE_CAPACITY;

pub const KEY_VIDEO_SOURCE: &str = "video_source";
pub const KEY_DETECTOR_MODEL_PATH: &str = "detector_model_path";
pub const KEY_LANDMARK_MODEL_PATH: &str = "landmark_model_path";
pub const KEY_DEVICE: &str = "device";

const DEFAULT_VIDEO_SOURCE: &str = "0";
const DEFAULT_DETECTOR_MODEL_PATH: &str = "models/yolov8n.torchscript";
const DEFAULT_LANDMARK_MODEL_PATH: &str = "models/face_landmarker.task";
const DEFAULT_DEVICE: &str = "cpu";

/// Opaque key/value settings consumed by the worker and its processor.
///
/// Well-known keys fall back to defaults when absent; everything else passes
/// through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureConfig(BTreeMap<String, String>);

impl CaptureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Device index (decimal string) or path/URI of the video source.
    pub fn video_source(&self) -> &str {
        self.get(KEY_VIDEO_SOURCE).unwrap_or(DEFAULT_VIDEO_SOURCE)
    }

    pub fn detector_model_path(&self) -> PathBuf {
        PathBuf::from(
            self.get(KEY_DETECTOR_MODEL_PATH)
                .unwrap_or(DEFAULT_DETECTOR_MODEL_PATH),
        )
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        PathBuf::from(
            self.get(KEY_LANDMARK_MODEL_PATH)
                .unwrap_or(DEFAULT_LANDMARK_MODEL_PATH),
        )
    }

    /// Compute device selector (`cpu`, `cuda`, `cuda:N`, `auto`).
    pub fn device(&self) -> &str {
        self.get(KEY_DEVICE).unwrap_or(DEFAULT_DEVICE)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CaptureConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing worker spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Capture flags shared by every subcommand that starts a session.
#[derive(Debug, Default, Args)]
pub struct CaptureCliArgs {
    /// Camera index or video path/URI.
    #[arg(long = "source", value_name = "URI")]
    pub source: Option<String>,
    /// TorchScript detector model path.
    #[arg(long = "detector-model", value_name = "PATH")]
    pub detector_model: Option<PathBuf>,
    /// Landmark model path.
    #[arg(long = "landmark-model", value_name = "PATH")]
    pub landmark_model: Option<PathBuf>,
    /// Compute device (cpu, cuda, cuda:N, auto).
    #[arg(long = "device", value_name = "DEVICE")]
    pub device: Option<String>,
    /// Extra configuration entry; repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    pub set: Vec<String>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// Validated result of [`CaptureCliArgs`].
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub config: CaptureConfig,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<CaptureCliArgs> for CaptureSettings {
    type Error = anyhow::Error;

    fn try_from(args: CaptureCliArgs) -> Result<Self> {
        let mut config = CaptureConfig::new();
        for entry in &args.set {
            let Some((key, value)) = entry.split_once('=') else {
                bail!("--set expects KEY=VALUE, got {entry:?}");
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("--set entry {entry:?} has an empty key");
            }
            config.set(key, value.trim());
        }

        // dedicated flags win over --set
        if let Some(source) = args.source {
            config.set(KEY_VIDEO_SOURCE, source);
        }
        if let Some(path) = args.detector_model {
            config.set(KEY_DETECTOR_MODEL_PATH, path.to_string_lossy());
        }
        if let Some(path) = args.landmark_model {
            config.set(KEY_LANDMARK_MODEL_PATH, path.to_string_lossy());
        }
        if let Some(device) = args.device {
            config.set(KEY_DEVICE, device);
        }

        if config.video_source().trim().is_empty() {
            bail!("Video source must not be empty");
        }

        Ok(Self {
            config,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

/// Per-iteration timing of the worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopTiming {
    /// Longest wait to publish a frame before skipping it.
    pub frame_write_timeout: Duration,
    /// Longest wait for room in the feature channel before dropping a packet.
    pub feature_write_timeout: Duration,
    /// Pause after a failed iteration.
    pub error_backoff: Duration,
    /// Sleep at the end of every iteration.
    pub idle_yield: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            frame_write_timeout: Duration::from_secs(1),
            feature_write_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            idle_yield: Duration::from_millis(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    pub timing: LoopTiming,
    /// How long `stop()` waits for the worker before fencing it off.
    pub stop_timeout: Duration,
    pub retry: RetryPolicy,
    pub feature_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            timing: LoopTiming::default(),
            stop_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            feature_capacity: DEFAULT_FEATURE_CAPACITY,
        }
    }
}
