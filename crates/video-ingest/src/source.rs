//! Video source ownership: bounded-retry open, on-demand frame reads, and
//! idempotent release.
//!
//! A [`VideoSource`] is opened once per worker session and owned exclusively
//! by the worker. The concrete capture mechanism sits behind the
//! [`CaptureBackend`] / [`CaptureDevice`] traits so the worker never depends on
//! a particular decoder.

use std::{fmt, thread, time::Duration};

use tracing::{debug, error, info, warn};

use crate::types::{CaptureError, Frame};

/// Number of open attempts before a source is declared unavailable.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;
/// Pause between consecutive open attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where frames come from, resolved from a source identifier string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceTarget {
    /// Local capture device addressed by index (`"0"`, `"1"`, ...).
    DeviceIndex(i32),
    /// File path or stream URI passed through unchanged.
    Uri(String),
}

impl SourceTarget {
    /// Resolve an identifier: all-decimal-digit strings become device
    /// indices, everything else is an opaque path or URI.
    pub fn parse(identifier: &str) -> Self {
        if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = identifier.parse::<i32>() {
                return SourceTarget::DeviceIndex(index);
            }
        }
        SourceTarget::Uri(identifier.to_string())
    }
}

impl fmt::Display for SourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTarget::DeviceIndex(index) => write!(f, "device #{index}"),
            SourceTarget::Uri(uri) => f.write_str(uri),
        }
    }
}

/// An opened (or failed-to-open) capture handle.
pub trait CaptureDevice: Send {
    /// Whether the underlying handle is usable.
    fn is_opened(&self) -> bool;

    /// Read the next frame. `Ok(None)` signals end of stream.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Close the handle. Must be safe to call more than once.
    fn release(&mut self);
}

/// Factory for capture handles. One backend serves many sessions.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// Bounded retry used when opening a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_OPEN_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Single capture source owned by one worker session.
pub struct VideoSource {
    identifier: String,
    device: Option<Box<dyn CaptureDevice>>,
}

impl VideoSource {
    /// Open `identifier` with the default policy (3 attempts, 500 ms apart).
    pub fn open(backend: &dyn CaptureBackend, identifier: &str) -> Result<Self, CaptureError> {
        Self::open_with_policy(backend, identifier, RetryPolicy::default())
    }

    /// Open `identifier`, re-issuing the same open call up to
    /// `policy.attempts` times. Handles that come back unopened are released
    /// before the next attempt, so a failed open leaves nothing behind.
    pub fn open_with_policy(
        backend: &dyn CaptureBackend,
        identifier: &str,
        policy: RetryPolicy,
    ) -> Result<Self, CaptureError> {
        let target = SourceTarget::parse(identifier);
        let attempts = policy.attempts.max(1);

        for attempt in 1..=attempts {
            info!("Opening video source '{identifier}' ({attempt}/{attempts})");
            match backend.open(&target) {
                Ok(device) if device.is_opened() => {
                    info!("Video source '{identifier}' opened ({target})");
                    return Ok(Self {
                        identifier: identifier.to_string(),
                        device: Some(device),
                    });
                }
                Ok(mut device) => {
                    device.release();
                    warn!("Video source '{identifier}' is not available");
                }
                Err(err) => {
                    warn!("Video source '{identifier}' failed to open: {err}");
                }
            }

            if attempt < attempts {
                debug!("Retrying in {:?}", policy.delay);
                thread::sleep(policy.delay);
            }
        }

        error!("Cannot open video source '{identifier}'");
        Err(CaptureError::Open {
            uri: identifier.to_string(),
            attempts,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_open(&self) -> bool {
        self.device.as_ref().is_some_and(|device| device.is_opened())
    }

    /// Fetch one frame. Returns `None` when the handle is gone, closed, or
    /// the stream is exhausted; read failures are logged, not raised.
    pub fn get_frame(&mut self) -> Option<Frame> {
        let device = self.device.as_mut()?;
        if !device.is_opened() {
            return None;
        }
        match device.read() {
            Ok(frame) => frame,
            Err(err) => {
                debug!("Video source '{}' read failed: {err}", self.identifier);
                None
            }
        }
    }

    /// Release the handle. Subsequent calls are no-ops.
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            info!("Releasing video source '{}'", self.identifier);
            device.release();
        }
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}
