//! Backend and processor selection for the headless runner.

use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use capture_service::{CaptureConfig, ProcessorFactory};
use ml_core::{FrameProcessor, InitError, MotionGridConfig, MotionGridProcessor};
use video_ingest::CaptureBackend;

use crate::cli::ProcessorKind;

pub const KEY_MOTION_ROWS: &str = "motion_rows";
pub const KEY_MOTION_COLS: &str = "motion_cols";
pub const KEY_MOTION_THRESHOLD: &str = "motion_threshold";

/// OpenCV opens synchronously, so `first_frame_timeout` only applies to FFmpeg.
#[cfg(feature = "with-opencv")]
pub fn backend(frame_size: (i32, i32), _first_frame_timeout: Duration) -> Arc<dyn CaptureBackend> {
    Arc::new(video_ingest::OpenCvBackend::new(frame_size))
}

#[cfg(not(feature = "with-opencv"))]
pub fn backend(frame_size: (i32, i32), first_frame_timeout: Duration) -> Arc<dyn CaptureBackend> {
    Arc::new(
        video_ingest::FfmpegBackend::new(frame_size).with_first_frame_timeout(first_frame_timeout),
    )
}

pub fn factory(kind: ProcessorKind) -> Arc<dyn ProcessorFactory> {
    match kind {
        ProcessorKind::Motion => Arc::new(motion),
        ProcessorKind::Detector => Arc::new(detector),
    }
}

fn parse_key<T: std::str::FromStr>(
    config: &CaptureConfig,
    key: &str,
    default: T,
) -> Result<T, InitError> {
    match config.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| InitError::Other(anyhow!("invalid value {raw:?} for {key}"))),
        None => Ok(default),
    }
}

fn motion_config(config: &CaptureConfig) -> Result<MotionGridConfig, InitError> {
    let defaults = MotionGridConfig::default();
    Ok(MotionGridConfig {
        rows: parse_key(config, KEY_MOTION_ROWS, defaults.rows)?,
        cols: parse_key(config, KEY_MOTION_COLS, defaults.cols)?,
        threshold: parse_key(config, KEY_MOTION_THRESHOLD, defaults.threshold)?,
    })
}

fn motion(config: &CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError> {
    Ok(Box::new(MotionGridProcessor::new(motion_config(config)?)))
}

#[cfg(feature = "with-tch")]
fn detector(config: &CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError> {
    let detector = ml_core::DetectorProcessor::new(config.detector_model_path(), config.device())?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn detector(_config: &CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError> {
    Err(InitError::Backend(
        "detector support requires building with the `with-tch` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_settings_come_from_the_config() {
        let config = CaptureConfig::new()
            .with(KEY_MOTION_ROWS, "8")
            .with(KEY_MOTION_THRESHOLD, "4.5");

        let parsed = motion_config(&config).unwrap();

        assert_eq!(parsed.rows, 8);
        assert_eq!(parsed.cols, MotionGridConfig::default().cols);
        assert_eq!(parsed.threshold, 4.5);
    }

    #[test]
    fn bad_motion_settings_fail_initialisation() {
        let config = CaptureConfig::new().with(KEY_MOTION_COLS, "many");
        assert!(matches!(motion_config(&config), Err(InitError::Other(_))));
    }

    #[cfg(not(feature = "with-tch"))]
    #[test]
    fn detector_needs_the_torch_feature() {
        let result = factory(ProcessorKind::Detector).create(&CaptureConfig::new());
        assert!(matches!(result, Err(InitError::Backend(_))));
    }
}
