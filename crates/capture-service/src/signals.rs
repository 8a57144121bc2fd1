//! Control signals shared between the control side and the capture worker.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// The two flags gating worker behaviour. Written only by the control side.
///
/// Cloning shares the underlying flags; one set outlives every worker
/// session started by the owning service.
#[derive(Clone, Debug, Default)]
pub struct ControlSignals {
    running: Arc<AtomicBool>,
    analysis_active: Arc<AtomicBool>,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_analysis_active(&self) -> bool {
        self.analysis_active.load(Ordering::SeqCst)
    }

    pub fn set_analysis_active(&self, active: bool) {
        self.analysis_active.store(active, Ordering::SeqCst);
    }

    /// Read-only view for one worker session, fenced by `terminated`.
    pub fn reader(&self, terminated: Arc<AtomicBool>) -> SignalReader {
        SignalReader {
            running: Arc::clone(&self.running),
            analysis_active: Arc::clone(&self.analysis_active),
            terminated,
        }
    }
}

/// Worker-side view of [`ControlSignals`].
///
/// `terminated` belongs to a single session. Once raised the worker behaves
/// as if `running` had been cleared, even if a later session sets it again.
#[derive(Clone, Debug)]
pub struct SignalReader {
    running: Arc<AtomicBool>,
    analysis_active: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl SignalReader {
    pub fn keep_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.is_terminated()
    }

    pub fn analysis_active(&self) -> bool {
        self.analysis_active.load(Ordering::Relaxed)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn fence(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }
}
