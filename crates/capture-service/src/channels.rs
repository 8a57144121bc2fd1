//! The three worker-to-control channels.
//!
//! Frames use a single overwriting slot, feature packets a bounded FIFO with
//! timed sends, status messages an unbounded FIFO. All consumer reads are
//! non-blocking.

use std::{
    sync::{Arc, Mutex, PoisonError, TryLockError},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use ml_core::FeaturePacket;
use video_ingest::Frame;

use crate::status::StatusMessage;

/// Default bound for the feature channel.
pub const DEFAULT_FEATURE_CAPACITY: usize = 64;

const SLOT_RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Result of a producer-side write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered,
    /// Delivered after discarding an unread item.
    Replaced,
    /// Timed out; the item was discarded.
    Dropped,
}

/// Capacity-1 latest-wins frame cache.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    slot: Mutex<Option<Frame>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, discarding any unread one. Gives up after `timeout` if
    /// the slot stays locked.
    pub fn publish(&self, frame: Frame, timeout: Duration) -> WriteOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let mut guard = match self.slot.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return WriteOutcome::Dropped;
                    }
                    thread::sleep(SLOT_RETRY_INTERVAL);
                    continue;
                }
            };
            return match guard.replace(frame) {
                Some(_) => WriteOutcome::Replaced,
                None => WriteOutcome::Delivered,
            };
        }
    }

    /// Take the most recent frame, if any.
    pub fn take_latest(&self) -> Option<Frame> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Bounded FIFO of feature packets.
#[derive(Clone, Debug)]
pub struct FeatureChannel {
    tx: Sender<FeaturePacket>,
    rx: Receiver<FeaturePacket>,
}

impl FeatureChannel {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Enqueue `packet`, waiting at most `timeout` for room.
    pub fn send(&self, packet: FeaturePacket, timeout: Duration) -> WriteOutcome {
        match self.tx.send_timeout(packet, timeout) {
            Ok(()) => WriteOutcome::Delivered,
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                WriteOutcome::Dropped
            }
        }
    }

    pub fn poll(&self) -> Option<FeaturePacket> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Unbounded FIFO of status messages.
#[derive(Clone, Debug)]
pub struct StatusChannel {
    tx: Sender<StatusMessage>,
    rx: Receiver<StatusMessage>,
}

impl StatusChannel {
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn send(&self, message: StatusMessage) {
        // both ends live in `self`, so the channel cannot be disconnected
        let _ = self.tx.send(message);
    }

    pub fn poll(&self) -> Option<StatusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Channel set created once by the control side and shared by every worker
/// session it starts.
#[derive(Clone, Debug)]
pub struct CaptureChannels {
    pub frames: Arc<LatestFrameSlot>,
    pub features: FeatureChannel,
    pub status: StatusChannel,
}

impl CaptureChannels {
    pub fn new(feature_capacity: usize) -> Self {
        Self {
            frames: Arc::new(LatestFrameSlot::new()),
            features: FeatureChannel::bounded(feature_capacity),
            status: StatusChannel::unbounded(),
        }
    }
}

impl Default for CaptureChannels {
    fn default() -> Self {
        Self::new(DEFAULT_FEATURE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(timestamp_ms: i64) -> Frame {
        Frame {
            data: vec![0; 3],
            width: 1,
            height: 1,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn slot_keeps_only_the_newest_frame() {
        let slot = LatestFrameSlot::new();
        let timeout = Duration::from_millis(10);

        assert_eq!(slot.publish(frame(1), timeout), WriteOutcome::Delivered);
        assert_eq!(slot.publish(frame(2), timeout), WriteOutcome::Replaced);
        assert_eq!(slot.publish(frame(3), timeout), WriteOutcome::Replaced);

        assert_eq!(slot.take_latest().map(|f| f.timestamp_ms), Some(3));
        assert!(slot.take_latest().is_none());
    }

    #[test]
    fn slot_publish_gives_up_while_locked() {
        let slot = LatestFrameSlot::new();
        let _held = slot.slot.lock().unwrap();

        let started = Instant::now();
        let outcome = slot.publish(frame(1), Duration::from_millis(30));

        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn features_are_fifo_and_drop_on_timeout() {
        let channel = FeatureChannel::bounded(2);
        let timeout = Duration::from_millis(20);
        for ts in 0..2 {
            assert_eq!(
                channel.send(FeaturePacket::new(ts), timeout),
                WriteOutcome::Delivered
            );
        }

        assert_eq!(
            channel.send(FeaturePacket::new(99), timeout),
            WriteOutcome::Dropped
        );
        assert_eq!(channel.poll().map(|p| p.timestamp_ms), Some(0));
        assert_eq!(channel.poll().map(|p| p.timestamp_ms), Some(1));
        assert!(channel.poll().is_none());
    }

    #[test]
    fn status_preserves_order() {
        let channel = StatusChannel::unbounded();
        channel.send(StatusMessage::info("a"));
        channel.send(StatusMessage::error("b"));

        assert_eq!(channel.poll(), Some(StatusMessage::info("a")));
        assert_eq!(channel.poll(), Some(StatusMessage::error("b")));
        assert_eq!(channel.poll(), None);
    }
}
