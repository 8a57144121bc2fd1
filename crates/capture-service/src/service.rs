//! Control-side lifecycle of the capture worker.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use ml_core::FeaturePacket;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureBackend, Frame};

use crate::{
    channels::CaptureChannels,
    config::{CaptureConfig, ServiceOptions},
    signals::ControlSignals,
    status::StatusMessage,
    telemetry,
    worker::{ProcessorFactory, WorkerContext, WorkerExit, run_worker},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to spawn capture worker thread")]
    Spawn(#[source] io::Error),
}

/// How a `stop()` call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// No worker was running.
    NotRunning,
    /// The worker exited within the stop timeout.
    Joined(WorkerExit),
    /// The worker missed the stop timeout and was fenced off and detached.
    Forced,
}

struct Session {
    id: u64,
    handle: JoinHandle<WorkerExit>,
    /// Disconnects when the worker closure returns or unwinds.
    done: Receiver<()>,
    terminated: Arc<AtomicBool>,
}

impl Session {
    fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn join(self) -> WorkerExit {
        match self.handle.join() {
            Ok(exit) => exit,
            Err(_) => {
                error!("Capture worker {} panicked", self.id);
                WorkerExit::Panicked
            }
        }
    }
}

/// Control-side handle owning the signals, the channels and at most one
/// worker thread.
///
/// Lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.
pub struct CaptureService {
    backend: Arc<dyn CaptureBackend>,
    processors: Arc<dyn ProcessorFactory>,
    options: ServiceOptions,
    signals: ControlSignals,
    channels: CaptureChannels,
    state: ServiceState,
    session: Option<Session>,
    next_session: u64,
}

impl CaptureService {
    pub fn new(backend: Arc<dyn CaptureBackend>, processors: Arc<dyn ProcessorFactory>) -> Self {
        let options = ServiceOptions::default();
        Self {
            backend,
            processors,
            channels: CaptureChannels::new(options.feature_capacity),
            options,
            signals: ControlSignals::new(),
            state: ServiceState::Idle,
            session: None,
            next_session: 1,
        }
    }

    /// Replace the options. Rebuilds the channels when the feature capacity
    /// changes, so call this before sharing them.
    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        if options.feature_capacity != self.options.feature_capacity {
            self.channels = CaptureChannels::new(options.feature_capacity);
        }
        self.options = options;
        self
    }

    /// Current lifecycle state. A worker that ended on its own (stream
    /// exhausted, init failure) reads as `Idle` even before it is reaped.
    pub fn state(&self) -> ServiceState {
        match self.state {
            ServiceState::Running if !self.is_worker_alive() => ServiceState::Idle,
            state => state,
        }
    }

    /// Whether a worker thread is still executing the loop.
    pub fn is_worker_alive(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.is_finished())
    }

    /// Start a worker for `config`. A no-op while one is alive.
    ///
    /// A worker that ended on its own (stream exhausted, init failure) is
    /// reaped first, so the service can be started again without `stop()`.
    pub fn start(&mut self, config: CaptureConfig) -> Result<(), ServiceError> {
        if self.session.as_ref().is_some_and(Session::is_finished) {
            if let Some(session) = self.session.take() {
                let exit = session.join();
                debug!("Reaped finished capture worker ({exit:?})");
            }
            self.state = ServiceState::Idle;
        }
        if self.session.is_some() {
            debug!("Capture service already running; start ignored");
            return Ok(());
        }

        self.state = ServiceState::Starting;
        let id = self.next_session;
        self.next_session += 1;

        let terminated = Arc::new(AtomicBool::new(false));
        self.signals.set_running(true);
        let ctx = WorkerContext {
            session: id,
            config,
            backend: Arc::clone(&self.backend),
            processors: Arc::clone(&self.processors),
            signals: self.signals.reader(Arc::clone(&terminated)),
            channels: self.channels.clone(),
            timing: self.options.timing,
            retry: self.options.retry,
        };

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let spawned = telemetry::spawn_thread(format!("capture-worker-{id}"), move || {
            let _done = done_tx;
            run_worker(ctx)
        });

        match spawned {
            Ok(handle) => {
                self.session = Some(Session {
                    id,
                    handle,
                    done: done_rx,
                    terminated,
                });
                self.state = ServiceState::Running;
                info!(
                    "Capture service running (session {id}, analysis={})",
                    self.signals.is_analysis_active()
                );
                Ok(())
            }
            Err(err) => {
                self.signals.set_running(false);
                self.state = ServiceState::Idle;
                error!("Failed to spawn capture worker: {err}");
                Err(ServiceError::Spawn(err))
            }
        }
    }

    /// Ask the worker to stop and wait up to the stop timeout. A worker that
    /// misses it is fenced off and detached. Ends `Idle` either way.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(session) = self.session.take() else {
            self.state = ServiceState::Idle;
            return StopOutcome::NotRunning;
        };

        self.state = ServiceState::Stopping;
        self.signals.set_running(false);
        let timeout = self.options.stop_timeout;

        let outcome = match session.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let id = session.id;
                let exit = session.join();
                info!("Capture worker {id} stopped ({exit:?})");
                StopOutcome::Joined(exit)
            }
            Err(RecvTimeoutError::Timeout) => {
                session.terminated.store(true, Ordering::SeqCst);
                metrics::counter!("capture_forced_terminations_total").increment(1);
                warn!(
                    "Capture worker {} did not stop within {timeout:?}; terminating it",
                    session.id
                );
                // the detached thread exits at its next signal check
                drop(session.handle);
                StopOutcome::Forced
            }
        };

        self.state = ServiceState::Idle;
        outcome
    }

    pub fn set_analysis_active(&self, active: bool) {
        self.signals.set_analysis_active(active);
    }

    pub fn is_analysis_active(&self) -> bool {
        self.signals.is_analysis_active()
    }

    pub fn poll_feature_packet(&self) -> Option<FeaturePacket> {
        self.channels.features.poll()
    }

    pub fn poll_latest_frame(&self) -> Option<Frame> {
        self.channels.frames.take_latest()
    }

    pub fn poll_status(&self) -> Option<StatusMessage> {
        self.channels.status.poll()
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.stop();
    }
}
