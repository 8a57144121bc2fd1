//! OpenCV-backed capture devices.

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    ffmpeg::parse_device_index,
    source::{CaptureBackend, CaptureDevice, SourceTarget},
    types::{CaptureError, Frame, FrameFormat, check_frame_size},
};

const CAPTURE_FPS: f64 = 30.0;

/// Opens sources through `cv::VideoCapture`, resizing frames to `target_size`.
#[derive(Clone, Debug)]
pub struct OpenCvBackend {
    target_size: (i32, i32),
}

impl OpenCvBackend {
    pub fn new(target_size: (i32, i32)) -> Self {
        Self { target_size }
    }
}

impl CaptureBackend for OpenCvBackend {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        check_frame_size(self.target_size)?;
        let mut cap = open_video_capture(target)?;
        if cap.is_opened().unwrap_or(false) {
            configure_camera(&mut cap, self.target_size);
        }
        Ok(Box::new(OpenCvDevice {
            cap: Some(cap),
            frame: Mat::default(),
            scratch: Mat::default(),
            target_size: self.target_size,
        }))
    }
}

struct OpenCvDevice {
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
    target_size: (i32, i32),
}

impl CaptureDevice for OpenCvDevice {
    fn is_opened(&self) -> bool {
        self.cap
            .as_ref()
            .is_some_and(|cap| cap.is_opened().unwrap_or(false))
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(None);
        };
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            return Ok(None);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Some(Frame::now(data, target_w, target_h, FrameFormat::Bgr8)))
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(err) = cap.release() {
                warn!("VideoCapture release failed: {err}");
            }
        }
    }
}

impl Drop for OpenCvDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a capture either by index or URI, trying V4L first.
fn open_video_capture(target: &SourceTarget) -> Result<VideoCapture, CaptureError> {
    let index = match target {
        SourceTarget::DeviceIndex(index) => Some(*index),
        SourceTarget::Uri(uri) => parse_device_index(uri),
    };

    if let Some(index) = index {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                Ok(_) => debug!("device #{index} not opened with backend {backend}"),
                Err(err) => debug!("failed to open device #{index} with backend {backend}: {err}"),
            }
        }
    }

    if let SourceTarget::Uri(uri) = target {
        match VideoCapture::from_file(uri, videoio::CAP_ANY) {
            Ok(cap) => return Ok(cap),
            Err(err) => debug!("failed to open {uri}: {err}"),
        }
    }

    // An unopened capture lets the caller's retry policy decide.
    VideoCapture::default().map_err(|e| CaptureError::Other(e.into()))
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32)) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, CAPTURE_FPS);
}
