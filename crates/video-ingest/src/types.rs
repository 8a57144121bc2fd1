use std::{fmt, io};

use anyhow::Error;
use thiserror::Error;

/// Decoded frame captured from a video source.
///
/// Frames carry no identity beyond arrival order; `timestamp_ms` is the wall
/// clock time at which the frame was read.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn now(data: Vec<u8>, width: i32, height: i32, format: FrameFormat) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format,
        }
    }

    /// Expected buffer length for the frame's dimensions and format.
    pub fn expected_len(&self) -> usize {
        self.format.bytes_per_pixel() * self.width.max(0) as usize * self.height.max(0) as usize
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Reject frame sizes that cannot hold a single pixel.
pub(crate) fn check_frame_size((width, height): (i32, i32)) -> Result<(), CaptureError> {
    if width <= 0 || height <= 0 {
        return Err(CaptureError::Other(anyhow::anyhow!(
            "invalid frame size {width}x{height}"
        )));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open video source {uri:?} after {attempts} attempt(s)")]
    Open { uri: String, attempts: u32 },
    #[error("failed to launch capture process for {uri:?}")]
    Spawn {
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("frame read failed")]
    Read(#[source] io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}
