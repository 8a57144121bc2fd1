//! Video acquisition for the capture worker.
//!
//! - `source`: [`VideoSource`] with bounded-retry open and the backend traits.
//! - `ffmpeg`: subprocess backend decoding to raw BGR24 (default build).
//! - `camera`: OpenCV `VideoCapture` backend (`with-opencv`).
//! - `devices`: capture device discovery.

#[cfg(feature = "with-opencv")]
mod camera;
mod devices;
mod ffmpeg;
mod source;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvBackend;
pub use devices::{V4L_SYSFS_ROOT, list_cameras, list_cameras_in};
pub use ffmpeg::{DEFAULT_FIRST_FRAME_TIMEOUT, FfmpegBackend};
pub use source::{
    CaptureBackend, CaptureDevice, DEFAULT_OPEN_ATTEMPTS, DEFAULT_RETRY_DELAY, RetryPolicy,
    SourceTarget, VideoSource,
};
pub use types::{CaptureError, Frame, FrameFormat};
