use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use capture_service::{
    CaptureConfig, CaptureService, LoopTiming, ProcessorFactory, RealtimeMode, ServiceOptions,
    ServiceState, Status, StatusMessage, StopOutcome, WorkerExit,
};
use ml_core::{FrameProcessor, InitError, MotionGridConfig, MotionGridProcessor};
use video_ingest::{
    CaptureBackend, CaptureDevice, CaptureError, Frame, FrameFormat, RetryPolicy, SourceTarget,
};

const SIZE: i32 = 16;

/// Plays a short clip: alternating dark frames and frames with a bright
/// top-left quadrant, then ends. The first `failures` opens are refused.
struct ClipBackend {
    frames: usize,
    pace: Duration,
    failures: usize,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl ClipBackend {
    fn new(frames: usize, pace: Duration) -> Self {
        Self {
            frames,
            pace,
            failures: 0,
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ClipDevice {
    index: usize,
    frames: usize,
    pace: Duration,
    releases: Arc<AtomicUsize>,
}

impl CaptureDevice for ClipDevice {
    fn is_opened(&self) -> bool {
        true
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.index >= self.frames {
            return Ok(None);
        }
        thread::sleep(self.pace);
        let mut data = vec![0u8; (SIZE * SIZE * 3) as usize];
        if self.index % 2 == 1 {
            for y in 0..SIZE / 2 {
                for x in 0..SIZE / 2 {
                    let offset = ((y * SIZE + x) * 3) as usize;
                    data[offset..offset + 3].fill(255);
                }
            }
        }
        self.index += 1;
        Ok(Some(Frame {
            data,
            width: SIZE,
            height: SIZE,
            timestamp_ms: self.index as i64,
            format: FrameFormat::Bgr8,
        }))
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureBackend for ClipBackend {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(CaptureError::Open {
                uri: target.to_string(),
                attempts: 1,
            });
        }
        Ok(Box::new(ClipDevice {
            index: 0,
            frames: self.frames,
            pace: self.pace,
            releases: Arc::clone(&self.releases),
        }))
    }
}

fn motion_factory() -> Arc<dyn ProcessorFactory> {
    Arc::new(
        |_: &CaptureConfig| -> Result<Box<dyn FrameProcessor>, InitError> {
            Ok(Box::new(MotionGridProcessor::new(MotionGridConfig {
                rows: 2,
                cols: 2,
                threshold: 10.0,
            })))
        },
    )
}

fn options() -> ServiceOptions {
    ServiceOptions {
        timing: LoopTiming {
            frame_write_timeout: Duration::from_millis(20),
            feature_write_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
            idle_yield: Duration::from_millis(1),
        },
        stop_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(50),
        },
        feature_capacity: 256,
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn drain_statuses(mode: &mut RealtimeMode, into: &mut Vec<StatusMessage>) {
    while let Some(message) = mode.next_status() {
        into.push(message);
    }
}

#[test]
fn preview_then_analysis_until_the_clip_ends() {
    let backend = Arc::new(ClipBackend::new(80, Duration::from_millis(2)));
    let service =
        CaptureService::new(backend.clone(), motion_factory()).with_options(options());
    let mut mode = RealtimeMode::new(service);
    let mut statuses = Vec::new();
    assert!(!mode.start_analysis());

    mode.select(CaptureConfig::new().with("video_source", "clip.mp4"))
        .unwrap();
    assert!(mode.is_selected());
    assert!(wait_until(|| mode.latest_frame().is_some()));
    assert!(mode.next_feature_packet().is_none());

    assert!(mode.start_analysis());
    let mut packets = 0;
    assert!(wait_until(|| {
        while mode.next_feature_packet().is_some() {
            packets += 1;
        }
        drain_statuses(&mut mode, &mut statuses);
        mode.stream_ended()
    }));
    while mode.next_feature_packet().is_some() {
        packets += 1;
    }

    assert!(packets > 0);
    assert_eq!(mode.history().count(), packets);
    assert_eq!(mode.registry().ids(), ["ID_r0c0"]);
    assert!(!mode.is_analysis_active());
    assert!(!mode.start_analysis());
    let completed = statuses
        .iter()
        .filter(|m| m.status == Status::Completed)
        .count();
    assert_eq!(completed, 1);
    assert!(!statuses.iter().any(|m| m.status == Status::Error));

    assert!(wait_until(|| mode.service().state() == ServiceState::Idle));

    assert_eq!(mode.deselect(), StopOutcome::Joined(WorkerExit::Exhausted));
    assert!(!mode.is_selected());
    assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
    assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn open_retries_then_succeeds() {
    let backend = Arc::new(ClipBackend {
        failures: 2,
        ..ClipBackend::new(1000, Duration::from_millis(1))
    });
    let service =
        CaptureService::new(backend.clone(), motion_factory()).with_options(options());
    let mut mode = RealtimeMode::new(service);

    let started = Instant::now();
    mode.select(CaptureConfig::new()).unwrap();
    assert!(wait_until(|| mode.latest_frame().is_some()));

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
    mode.deselect();
    assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn unopenable_source_reports_one_error() {
    let backend = Arc::new(ClipBackend {
        failures: usize::MAX,
        ..ClipBackend::new(10, Duration::ZERO)
    });
    let service =
        CaptureService::new(backend.clone(), motion_factory()).with_options(options());
    let mut mode = RealtimeMode::new(service);
    let mut statuses = Vec::new();

    mode.select(CaptureConfig::new().with("video_source", "3"))
        .unwrap();
    assert!(wait_until(|| !mode.service().is_worker_alive()));
    assert_eq!(mode.service().state(), ServiceState::Idle);
    drain_statuses(&mut mode, &mut statuses);

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, Status::Error);
    assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
    assert_eq!(mode.deselect(), StopOutcome::Joined(WorkerExit::InitFailed));
}
