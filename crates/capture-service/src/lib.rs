//! Control/worker protocol for real-time capture.
//!
//! A [`CaptureService`] owns two [`ControlSignals`] and three channels and
//! runs at most one worker thread ([`run_worker`]) that captures frames,
//! optionally analyses them, and streams results back:
//!
//! - frames through a latest-wins slot ([`LatestFrameSlot`]),
//! - feature packets through a bounded FIFO ([`FeatureChannel`]),
//! - status messages through an unbounded FIFO ([`StatusChannel`]).
//!
//! [`RealtimeMode`] is the control-side consumer that polls them.

mod channels;
mod config;
mod mode;
mod service;
mod signals;
mod status;
pub mod telemetry;
mod worker;

pub use channels::{
    CaptureChannels, DEFAULT_FEATURE_CAPACITY, FeatureChannel, LatestFrameSlot, StatusChannel,
    WriteOutcome,
};
pub use config::{
    CaptureCliArgs, CaptureConfig, CaptureSettings, KEY_DETECTOR_MODEL_PATH, KEY_DEVICE,
    KEY_LANDMARK_MODEL_PATH, KEY_VIDEO_SOURCE, LoopTiming, ServiceOptions, TelemetryOptions,
};
pub use mode::{EntityRegistry, PACKET_HISTORY_CAPACITY, RealtimeMode};
pub use service::{CaptureService, ServiceError, ServiceState, StopOutcome};
pub use signals::{ControlSignals, SignalReader};
pub use status::{Status, StatusMessage};
pub use worker::{ProcessorFactory, WorkerContext, WorkerExit, run_worker};
