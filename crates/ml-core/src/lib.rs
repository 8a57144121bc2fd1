//! Frame analysis used by the capture worker.
//!
//! [`FrameProcessor`] is the seam between the worker loop and whatever model
//! turns a frame into a [`FeaturePacket`]. The default build ships a
//! dependency-free motion grid; `with-tch` adds a TorchScript detector.

#[cfg(feature = "with-tch")]
mod detector;
mod draw;
mod motion;
mod processor;

#[cfg(feature = "with-tch")]
pub use detector::{Detection, DetectorProcessor, parse_device};
pub use draw::{Bgr, GREEN, RED, draw_rectangle};
pub use motion::{MotionGridConfig, MotionGridProcessor};
pub use processor::{ENTITY_KEY_PREFIX, FeaturePacket, FrameProcessor, InitError, ProcessedFrame};
