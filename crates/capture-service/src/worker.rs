//! The capture worker loop.
//!
//! [`run_worker`] runs on a dedicated thread for one session. It owns the
//! [`VideoSource`] and the [`FrameProcessor`], honours the control signals
//! once per iteration and reports back only through [`CaptureChannels`].

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use ml_core::{FeaturePacket, FrameProcessor, InitError};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureBackend, Frame, RetryPolicy, VideoSource};

use crate::{
    channels::{CaptureChannels, WriteOutcome},
    config::{CaptureConfig, LoopTiming},
    signals::SignalReader,
    status::StatusMessage,
};

const BACKOFF_SLICE: Duration = Duration::from_millis(10);

/// Builds the frame processor for a session, on the worker thread.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, config: &CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError>;
}

impl<F> ProcessorFactory for F
where
    F: Fn(&CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError> + Send + Sync,
{
    fn create(&self, config: &CaptureConfig) -> Result<Box<dyn FrameProcessor>, InitError> {
        self(config)
    }
}

/// Everything one worker session needs.
pub struct WorkerContext {
    pub session: u64,
    pub config: CaptureConfig,
    pub backend: Arc<dyn CaptureBackend>,
    pub processors: Arc<dyn ProcessorFactory>,
    pub signals: SignalReader,
    pub channels: CaptureChannels,
    pub timing: LoopTiming,
    pub retry: RetryPolicy,
}

/// Why a worker returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// `running` was cleared.
    Stopped,
    /// The source stopped yielding frames.
    Exhausted,
    /// Source or processor construction failed.
    InitFailed,
    /// The session was fenced off after a stop timeout.
    Terminated,
    /// The worker thread panicked outside an iteration.
    Panicked,
}

/// Channel writers for one session. Writes are discarded once the session's
/// fence is raised.
struct WorkerOutputs {
    channels: CaptureChannels,
    terminated: Arc<AtomicBool>,
    timing: LoopTiming,
}

impl WorkerOutputs {
    fn fenced(&self) -> bool {
        let fenced = self.terminated.load(Ordering::SeqCst);
        if fenced {
            debug!("Discarding output from terminated capture session");
        }
        fenced
    }

    fn publish_frame(&self, frame: Frame) {
        if self.fenced() {
            return;
        }
        match self
            .channels
            .frames
            .publish(frame, self.timing.frame_write_timeout)
        {
            WriteOutcome::Delivered => {
                metrics::counter!("capture_frames_published_total").increment(1);
            }
            WriteOutcome::Replaced => {
                metrics::counter!("capture_frames_published_total").increment(1);
                metrics::counter!("capture_frames_replaced_total").increment(1);
            }
            WriteOutcome::Dropped => {
                metrics::counter!("capture_frames_skipped_total").increment(1);
                warn!("Frame slot busy; skipping frame");
            }
        }
    }

    fn publish_features(&self, packet: FeaturePacket) {
        if self.fenced() {
            return;
        }
        match self
            .channels
            .features
            .send(packet, self.timing.feature_write_timeout)
        {
            WriteOutcome::Dropped => {
                metrics::counter!("capture_features_dropped_total").increment(1);
                warn!(
                    "Feature channel full for {:?}; dropping packet",
                    self.timing.feature_write_timeout
                );
            }
            _ => {
                metrics::counter!("capture_features_published_total").increment(1);
            }
        }
    }

    fn status(&self, message: StatusMessage) {
        if self.fenced() {
            return;
        }
        debug!("Status: {message}");
        self.channels.status.send(message);
    }
}

enum Step {
    Continue,
    Exhausted,
}

/// Run one capture session until `running` is cleared, the fence is raised,
/// or the stream ends.
pub fn run_worker(ctx: WorkerContext) -> WorkerExit {
    let span = tracing::info_span!(
        "capture.worker",
        source = %ctx.config.video_source(),
        session = ctx.session
    );
    let _span_guard = span.enter();

    let outputs = WorkerOutputs {
        channels: ctx.channels.clone(),
        terminated: ctx.signals.fence(),
        timing: ctx.timing,
    };

    let mut source = match VideoSource::open_with_policy(
        ctx.backend.as_ref(),
        ctx.config.video_source(),
        ctx.retry,
    ) {
        Ok(source) => source,
        Err(err) => {
            error!("Capture worker failed to start: {err}");
            outputs.status(StatusMessage::error(err.to_string()));
            return WorkerExit::InitFailed;
        }
    };

    let created = panic::catch_unwind(AssertUnwindSafe(|| ctx.processors.create(&ctx.config)));
    let mut processor = match created {
        Ok(Ok(processor)) => processor,
        Ok(Err(err)) => {
            error!("Frame processor failed to initialise: {err}");
            outputs.status(StatusMessage::error(err.to_string()));
            source.release();
            return WorkerExit::InitFailed;
        }
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            error!("Frame processor panicked during initialisation: {detail}");
            outputs.status(StatusMessage::error(detail));
            source.release();
            return WorkerExit::InitFailed;
        }
    };

    info!("Capture worker ready");
    outputs.status(StatusMessage::info(format!(
        "capture started on {}",
        source.identifier()
    )));

    let signals = &ctx.signals;
    let timing = ctx.timing;
    let mut active_branch: Option<bool> = None;

    let exit = loop {
        if !signals.keep_running() {
            break if signals.is_terminated() {
                WorkerExit::Terminated
            } else {
                WorkerExit::Stopped
            };
        }

        let analysis = signals.analysis_active();
        if active_branch != Some(analysis) {
            if analysis && active_branch == Some(false) {
                processor.reset();
            }
            let detail = if analysis {
                "analysis active"
            } else {
                "preview active"
            };
            info!("Capture worker: {detail}");
            outputs.status(StatusMessage::info(detail));
            active_branch = Some(analysis);
        }

        let started = Instant::now();
        let result = tracing::debug_span!("capture.iteration", analysis).in_scope(|| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                run_iteration(&mut source, processor.as_mut(), analysis, &outputs)
            }))
        });
        metrics::histogram!("capture_iteration_seconds").record(started.elapsed().as_secs_f64());

        let failure = match result {
            Ok(Ok(Step::Continue)) => None,
            Ok(Ok(Step::Exhausted)) => {
                info!("Video stream exhausted");
                outputs.status(StatusMessage::completed("video stream ended"));
                break WorkerExit::Exhausted;
            }
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(panic_detail(payload.as_ref())),
        };

        if let Some(detail) = failure {
            metrics::counter!("capture_iteration_errors_total").increment(1);
            warn!("Capture iteration failed: {detail}");
            outputs.status(StatusMessage::error(detail));
            backoff(signals, timing.error_backoff);
        }

        thread::sleep(timing.idle_yield);
    };

    processor.release();
    source.release();
    info!("Capture worker exited ({exit:?})");
    exit
}

fn run_iteration(
    source: &mut VideoSource,
    processor: &mut dyn FrameProcessor,
    analysis: bool,
    outputs: &WorkerOutputs,
) -> Result<Step> {
    let Some(frame) = source.get_frame() else {
        return Ok(Step::Exhausted);
    };

    let annotated = if analysis {
        let processed = processor
            .process(frame)
            .context("frame processing failed")?;
        if let Some(packet) = processed.features {
            outputs.publish_features(packet);
        }
        processed.annotated
    } else {
        Some(frame)
    };

    if let Some(frame) = annotated {
        outputs.publish_frame(frame);
    }
    Ok(Step::Continue)
}

/// Sleep for `duration`, returning early once the worker should stop.
fn backoff(signals: &SignalReader, duration: Duration) {
    let deadline = Instant::now() + duration;
    while signals.keep_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(BACKOFF_SLICE.min(deadline - now));
    }
}

pub(crate) fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use anyhow::bail;
    use ml_core::ProcessedFrame;
    use video_ingest::{CaptureDevice, CaptureError, FrameFormat, SourceTarget};

    use super::*;
    use crate::{signals::ControlSignals, status::Status};

    #[derive(Default)]
    struct Counters {
        opens: AtomicUsize,
        reads: AtomicUsize,
        releases: AtomicUsize,
    }

    /// Device yielding `frames` frames, then reporting exhaustion.
    struct FiniteDevice {
        remaining: usize,
        counters: Arc<Counters>,
    }

    impl CaptureDevice for FiniteDevice {
        fn is_opened(&self) -> bool {
            true
        }

        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame {
                data: vec![0; 3],
                width: 1,
                height: 1,
                timestamp_ms: n as i64,
                format: FrameFormat::Bgr8,
            }))
        }

        fn release(&mut self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FiniteBackend {
        frames: usize,
        counters: Arc<Counters>,
    }

    impl CaptureBackend for FiniteBackend {
        fn open(&self, _target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FiniteDevice {
                remaining: self.frames,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct RefusingBackend;

    impl CaptureBackend for RefusingBackend {
        fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            Err(CaptureError::Open {
                uri: target.to_string(),
                attempts: 1,
            })
        }
    }

    /// Processor replaying a script of outcomes, then echoing frames.
    struct ScriptedProcessor {
        script: VecDeque<&'static str>,
        resets: Arc<AtomicUsize>,
    }

    impl FrameProcessor for ScriptedProcessor {
        fn process(&mut self, frame: Frame) -> Result<ProcessedFrame> {
            match self.script.pop_front() {
                Some("fail") => bail!("bad frame"),
                Some("panic") => panic!("processor blew up"),
                _ => {
                    let mut packet = FeaturePacket::new(frame.timestamp_ms);
                    packet.insert("ID_0", 1.0);
                    Ok(ProcessedFrame {
                        features: Some(packet),
                        annotated: Some(frame),
                    })
                }
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_timing() -> LoopTiming {
        LoopTiming {
            frame_write_timeout: Duration::from_millis(10),
            feature_write_timeout: Duration::from_millis(10),
            error_backoff: Duration::from_millis(5),
            idle_yield: Duration::from_millis(1),
        }
    }

    fn context(
        backend: Arc<dyn CaptureBackend>,
        processors: Arc<dyn ProcessorFactory>,
        signals: &ControlSignals,
        channels: &CaptureChannels,
    ) -> WorkerContext {
        signals.set_running(true);
        WorkerContext {
            session: 1,
            config: CaptureConfig::new().with("video_source", "file.mp4"),
            backend,
            processors,
            signals: signals.reader(Arc::new(AtomicBool::new(false))),
            channels: channels.clone(),
            timing: fast_timing(),
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
        }
    }

    fn scripted(script: &[&'static str], resets: &Arc<AtomicUsize>) -> Arc<dyn ProcessorFactory> {
        let script: VecDeque<_> = script.iter().copied().collect();
        let resets = Arc::clone(resets);
        let script = Mutex::new(Some(script));
        Arc::new(move |_: &CaptureConfig| -> Result<Box<dyn FrameProcessor>, InitError> {
            let script = script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedProcessor {
                script,
                resets: Arc::clone(&resets),
            }))
        })
    }

    fn drain_status(channels: &CaptureChannels) -> Vec<StatusMessage> {
        std::iter::from_fn(|| channels.status.poll()).collect()
    }

    #[test]
    fn preview_exhaustion_completes_once_and_releases_once() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FiniteBackend {
            frames: 4,
            counters: Arc::clone(&counters),
        });
        let signals = ControlSignals::new();
        let channels = CaptureChannels::new(8);
        let resets = Arc::new(AtomicUsize::new(0));

        let exit = run_worker(context(
            backend,
            scripted(&[], &resets),
            &signals,
            &channels,
        ));

        assert_eq!(exit, WorkerExit::Exhausted);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 5);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        let completed = drain_status(&channels)
            .into_iter()
            .filter(|m| m.status == Status::Completed)
            .count();
        assert_eq!(completed, 1);
        assert_eq!(channels.frames.take_latest().map(|f| f.timestamp_ms), Some(3));
        assert!(channels.features.is_empty());
    }

    #[test]
    fn open_failure_reports_a_single_error() {
        let signals = ControlSignals::new();
        let channels = CaptureChannels::new(8);
        let resets = Arc::new(AtomicUsize::new(0));

        let exit = run_worker(context(
            Arc::new(RefusingBackend),
            scripted(&[], &resets),
            &signals,
            &channels,
        ));

        assert_eq!(exit, WorkerExit::InitFailed);
        let statuses = drain_status(&channels);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, Status::Error);
        assert!(statuses[0].detail.contains("file.mp4"));
    }

    #[test]
    fn processor_init_failure_releases_the_source() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FiniteBackend {
            frames: 10,
            counters: Arc::clone(&counters),
        });
        let signals = ControlSignals::new();
        let channels = CaptureChannels::new(8);
        let failing: Arc<dyn ProcessorFactory> = Arc::new(
            |_: &CaptureConfig| -> Result<Box<dyn FrameProcessor>, InitError> {
                Err(InitError::Backend("no runtime".into()))
            },
        );

        let exit = run_worker(context(backend, failing, &signals, &channels));

        assert_eq!(exit, WorkerExit::InitFailed);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        let statuses = drain_status(&channels);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].detail.contains("no runtime"));
    }

    #[test]
    fn iteration_failures_are_reported_and_survived() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FiniteBackend {
            frames: 4,
            counters: Arc::clone(&counters),
        });
        let signals = ControlSignals::new();
        signals.set_analysis_active(true);
        let channels = CaptureChannels::new(8);
        let resets = Arc::new(AtomicUsize::new(0));

        let exit = run_worker(context(
            backend,
            scripted(&["fail", "ok", "panic", "ok"], &resets),
            &signals,
            &channels,
        ));

        assert_eq!(exit, WorkerExit::Exhausted);
        let errors: Vec<_> = drain_status(&channels)
            .into_iter()
            .filter(|m| m.status == Status::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].detail.contains("bad frame"));
        assert!(errors[1].detail.contains("processor blew up"));
        let packets: Vec<_> = std::iter::from_fn(|| channels.features.poll())
            .map(|p| p.timestamp_ms)
            .collect();
        assert_eq!(packets, [1, 3]);
        // starting directly in analysis is not a mode switch
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cleared_running_flag_stops_the_worker() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FiniteBackend {
            frames: usize::MAX,
            counters: Arc::clone(&counters),
        });
        let signals = ControlSignals::new();
        let channels = CaptureChannels::new(8);
        let resets = Arc::new(AtomicUsize::new(0));
        let ctx = context(backend, scripted(&[], &resets), &signals, &channels);

        let handle = thread::spawn(move || run_worker(ctx));
        thread::sleep(Duration::from_millis(30));
        signals.set_running(false);

        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn switching_into_analysis_resets_the_processor() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FiniteBackend {
            frames: usize::MAX,
            counters: Arc::clone(&counters),
        });
        let signals = ControlSignals::new();
        let channels = CaptureChannels::new(1024);
        let resets = Arc::new(AtomicUsize::new(0));
        let ctx = context(backend, scripted(&[], &resets), &signals, &channels);

        let handle = thread::spawn(move || run_worker(ctx));
        thread::sleep(Duration::from_millis(20));
        signals.set_analysis_active(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while channels.features.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        signals.set_running(false);
        handle.join().unwrap();

        assert!(!channels.features.is_empty());
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        let infos: Vec<_> = drain_status(&channels)
            .into_iter()
            .filter(|m| m.status == Status::Info)
            .map(|m| m.detail)
            .collect();
        assert!(infos.iter().any(|d| d == "preview active"));
        assert!(infos.iter().any(|d| d == "analysis active"));
    }

    #[test]
    fn panic_payloads_become_readable_details() {
        fn explode(n: i32) -> i32 {
            if n > 0 {
                panic!("oops {n}");
            }
            n
        }

        let payload = panic::catch_unwind(|| explode(1)).unwrap_err();
        assert_eq!(panic_detail(payload.as_ref()), "panic: oops 1");
    }
}
