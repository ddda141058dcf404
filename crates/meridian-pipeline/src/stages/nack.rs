use std::sync::{Arc, Mutex};

use quanta::Instant;

use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::nack::RetransmissionRequester;
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtp::RtpView;
use meridian_transport::stats::StatBlock;
use meridian_transport::streams::MediaType;

use crate::stage::{Observer, StageBehavior};

/// Feeds received sequence numbers to the shared NACK requester. Requests
/// themselves are emitted by the scheduler's poll task.
pub struct NackObserver {
    requester: Arc<Mutex<RetransmissionRequester>>,
    enabled: bool,
    observed: u64,
}

impl NackObserver {
    pub fn new(requester: Arc<Mutex<RetransmissionRequester>>, enabled: bool) -> Self {
        NackObserver {
            requester,
            enabled,
            observed: 0,
        }
    }
}

impl StageBehavior for NackObserver {
    fn name(&self) -> &str {
        "nack"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::FeatureToggled {
                feature: Feature::Nack,
                enabled,
            } => self.enabled = *enabled,
            TransportEvent::LocalSsrc {
                media: MediaType::Video,
                ssrc,
            } => self
                .requester
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .set_sender_ssrc(*ssrc),
            _ => {}
        }
    }

    fn stats(&self) -> StatBlock {
        let s = self.requester.lock().unwrap_or_else(|e| e.into_inner()).stats();
        StatBlock::new()
            .with("observed", self.observed)
            .with("nacks_sent", s.nacks_sent)
            .with("packets_requested", s.packets_requested)
            .with("packets_recovered", s.packets_recovered)
            .with("packets_given_up", s.packets_given_up)
            .with("currently_missing", s.currently_missing)
    }
}

impl Observer for NackObserver {
    fn observe(&mut self, packet: &PacketInfo, now: Instant) {
        if !self.enabled {
            return;
        }
        let Ok(view) = RtpView::parse(&packet.buffer) else {
            return;
        };
        self.observed += 1;
        self.requester
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .packet_received(view.ssrc(), view.sequence_number(), now);
    }
}
