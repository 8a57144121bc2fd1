use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_ingest::Frame;

/// Measurement keys starting with this prefix name an active entity.
pub const ENTITY_KEY_PREFIX: &str = "ID_";

/// Named measurements extracted from one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeaturePacket {
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub measurements: BTreeMap<String, f64>,
}

impl FeaturePacket {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            measurements: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.measurements.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.measurements.get(key).copied()
    }

    /// Keys naming active entities in this frame, in key order.
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.measurements
            .keys()
            .map(String::as_str)
            .filter(|key| key.starts_with(ENTITY_KEY_PREFIX))
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// Output of processing one frame. Either half may be absent.
#[derive(Debug, Default)]
pub struct ProcessedFrame {
    pub features: Option<FeaturePacket>,
    pub annotated: Option<Frame>,
}

/// Per-frame analysis capability driven by the capture worker.
///
/// Implementations may own heavyweight models; they are constructed inside
/// the worker thread and never shared.
pub trait FrameProcessor: Send {
    /// Analyse one frame.
    fn process(&mut self, frame: Frame) -> Result<ProcessedFrame>;

    /// Drop any state carried over from earlier frames. Called when the
    /// worker switches from preview into analysis.
    fn reset(&mut self) {}

    /// Free model resources. Called once when the worker exits.
    fn release(&mut self) {}
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("model file not found: {}", path.display())]
    ModelMissing { path: PathBuf },
    #[error("unsupported compute device {0:?}")]
    UnsupportedDevice(String),
    #[error("processor backend failed to initialise: {0}")]
    Backend(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
