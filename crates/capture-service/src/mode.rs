//! Consumer-side mode logic for real-time analysis.
//!
//! [`RealtimeMode`] drives a [`CaptureService`] from the control side: it
//! selects and deselects the mode, flips the analysis signal, and drains the
//! channels without blocking on its own cadence.

use std::collections::VecDeque;

use ml_core::{ENTITY_KEY_PREFIX, FeaturePacket};
use tracing::{info, warn};
use video_ingest::Frame;

use crate::{
    config::CaptureConfig,
    service::{CaptureService, ServiceError, StopOutcome},
    status::{Status, StatusMessage},
};

/// Packets kept for the current analysis run.
pub const PACKET_HISTORY_CAPACITY: usize = 1024;

/// Union of entity keys seen during an analysis run, sorted and unique.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityRegistry {
    ids: Vec<String>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the entity keys of `packet`; returns how many were new.
    pub fn observe(&mut self, packet: &FeaturePacket) -> usize {
        let mut added = 0;
        for id in packet.entity_ids() {
            if let Err(pos) = self.ids.binary_search_by(|probe| probe.as_str().cmp(id)) {
                self.ids.insert(pos, id.to_string());
                added += 1;
            }
        }
        added
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        id.starts_with(ENTITY_KEY_PREFIX)
            && self
                .ids
                .binary_search_by(|probe| probe.as_str().cmp(id))
                .is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

pub struct RealtimeMode {
    service: CaptureService,
    registry: EntityRegistry,
    history: VecDeque<FeaturePacket>,
    selected: bool,
    stream_ended: bool,
}

impl RealtimeMode {
    pub fn new(service: CaptureService) -> Self {
        Self {
            service,
            registry: EntityRegistry::new(),
            history: VecDeque::new(),
            selected: false,
            stream_ended: false,
        }
    }

    /// Enter the mode: start capture in preview.
    pub fn select(&mut self, config: CaptureConfig) -> Result<(), ServiceError> {
        self.service.set_analysis_active(false);
        self.stream_ended = false;
        self.service.start(config)?;
        self.selected = true;
        info!("Realtime mode selected");
        Ok(())
    }

    /// Leave the mode and stop capture.
    pub fn deselect(&mut self) -> StopOutcome {
        self.selected = false;
        self.service.set_analysis_active(false);
        let outcome = self.service.stop();
        if outcome == StopOutcome::Forced {
            warn!("Capture worker had to be terminated");
        }
        info!("Realtime mode deselected");
        outcome
    }

    /// Begin analysis. Refused once the stream has ended or before `select`.
    pub fn start_analysis(&mut self) -> bool {
        if !self.selected || self.stream_ended {
            warn!("Cannot start analysis: no active stream");
            return false;
        }
        self.registry.clear();
        self.history.clear();
        self.service.set_analysis_active(true);
        info!("Analysis started");
        true
    }

    /// Return to preview.
    pub fn stop_analysis(&mut self) {
        self.service.set_analysis_active(false);
        info!("Analysis stopped");
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_analysis_active(&self) -> bool {
        self.service.is_analysis_active()
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    /// Non-blocking: next feature packet, folded into the registry.
    pub fn next_feature_packet(&mut self) -> Option<FeaturePacket> {
        let packet = self.service.poll_feature_packet()?;
        let added = self.registry.observe(&packet);
        if added > 0 {
            info!("{added} new entities (total {})", self.registry.len());
        }
        if self.history.len() == PACKET_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(packet.clone());
        Some(packet)
    }

    /// Non-blocking: most recent frame, if one arrived since the last call.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.service.poll_latest_frame()
    }

    /// Non-blocking: next status message. `COMPLETED` ends the stream and
    /// drops back to preview; `ERROR` is handed to the caller to surface.
    pub fn next_status(&mut self) -> Option<StatusMessage> {
        let message = self.service.poll_status()?;
        match message.status {
            Status::Completed => {
                info!("Stream ended: {}", message.detail);
                self.stream_ended = true;
                self.service.set_analysis_active(false);
            }
            Status::Error => warn!("Capture error: {}", message.detail),
            Status::Info => info!("{}", message.detail),
        }
        Some(message)
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn history(&self) -> impl Iterator<Item = &FeaturePacket> {
        self.history.iter()
    }

    pub fn service(&self) -> &CaptureService {
        &self.service
    }
}
