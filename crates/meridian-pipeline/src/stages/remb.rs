use std::sync::{Arc, Mutex};

use quanta::Instant;
use tracing::warn;

use meridian_transport::events::TransportEvent;
use meridian_transport::packet::PacketInfo;
use meridian_transport::remb::{encode_abs_send_time, parse_abs_send_time, RembEstimator};
use meridian_transport::rtp::{add_extension, RtpView};
use meridian_transport::stats::StatBlock;
use meridian_transport::streams::{ExtensionTable, RtpExtensionKind};

use crate::stage::{Modifier, Observer, StageBehavior};

/// Feeds abs-send-time arrivals to the shared REMB estimator. Inert while
/// transport-cc is negotiated.
pub struct RembStage {
    estimator: Arc<Mutex<RembEstimator>>,
}

impl RembStage {
    pub fn new(estimator: Arc<Mutex<RembEstimator>>) -> Self {
        RembStage { estimator }
    }
}

impl StageBehavior for RembStage {
    fn name(&self) -> &str {
        "remb"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        self.estimator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_event(event);
    }

    fn stats(&self) -> StatBlock {
        let estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        let s = estimator.stats();
        StatBlock::new()
            .with("active", estimator.is_active())
            .with("packets", s.packets)
            .with("missing_send_time", s.missing_send_time)
            .with("reports", s.reports)
            .with("last_reported_bps", s.last_reported_bps.unwrap_or(0))
    }
}

impl Observer for RembStage {
    fn observe(&mut self, packet: &PacketInfo, now: Instant) {
        let mut estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        if !estimator.is_active() {
            return;
        }
        let Ok(view) = RtpView::parse(&packet.buffer) else {
            return;
        };
        let send_time = estimator
            .abs_send_time_id()
            .and_then(|id| view.extension(id))
            .and_then(parse_abs_send_time);
        estimator.packet_received(
            view.ssrc(),
            send_time,
            packet.len(),
            packet.received_time.unwrap_or(now),
        );
    }
}

/// Stamps outgoing RTP with the abs-send-time extension when it is mapped.
pub struct AbsSendTimeStage {
    extensions: ExtensionTable,
    epoch: Instant,
    tagged: u64,
    failures: u64,
}

impl AbsSendTimeStage {
    pub fn new(epoch: Instant) -> Self {
        AbsSendTimeStage {
            extensions: ExtensionTable::default(),
            epoch,
            tagged: 0,
            failures: 0,
        }
    }
}

impl StageBehavior for AbsSendTimeStage {
    fn name(&self) -> &str {
        "abs-send-time"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::ExtensionAdded { id, kind } => {
                self.extensions.insert(*id, kind.clone())
            }
            TransportEvent::ExtensionsCleared => self.extensions.clear(),
            _ => {}
        }
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new()
            .with("tagged", self.tagged)
            .with("failures", self.failures)
    }
}

impl Modifier for AbsSendTimeStage {
    fn modify(&mut self, packet: &mut PacketInfo, now: Instant) {
        let Some(id) = self.extensions.id_of(&RtpExtensionKind::AbsSendTime) else {
            return;
        };
        let value = encode_abs_send_time(now.saturating_duration_since(self.epoch));
        if let Err(e) = add_extension(&mut packet.buffer, id, &value) {
            self.failures += 1;
            warn!(error = %e, "cannot add abs-send-time extension");
            return;
        }
        self.tagged += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_transport::events::Feature;
    use meridian_transport::remb::RembConfig;
    use meridian_transport::rtp::RtpPacketBuilder;
    use quanta::Clock;
    use std::time::Duration;

    const AST_ID: u8 = 2;

    #[test]
    fn sender_stamp_feeds_receiver_estimator() {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(10));
        let mapped = TransportEvent::ExtensionAdded {
            id: AST_ID,
            kind: RtpExtensionKind::AbsSendTime,
        };
        let mut tagger = AbsSendTimeStage::new(clock.now());
        tagger.handle_event(&mapped);
        let estimator = Arc::new(Mutex::new(RembEstimator::new(RembConfig::default(), 1)));
        let mut stage = RembStage::new(Arc::clone(&estimator));
        stage.handle_event(&mapped);

        for seq in 0..50u16 {
            mock.increment(Duration::from_millis(20));
            let mut packet = PacketInfo::new(
                RtpPacketBuilder::new(100, seq, 0, 9)
                    .payload(&[0; 500])
                    .build(),
            );
            tagger.modify(&mut packet, clock.now());
            stage.observe(&packet, clock.now());
        }
        let mut estimator = estimator.lock().unwrap();
        assert_eq!(estimator.stats().packets, 50);
        assert_eq!(estimator.stats().missing_send_time, 0);
        let remb = estimator.poll(clock.now()).expect("first report is due");
        assert_eq!(remb.ssrcs, vec![9]);
        assert!(remb.bitrate_bps > 0);
    }

    #[test]
    fn inert_when_transport_cc_mapped_or_disabled() {
        let (clock, _mock) = Clock::mock();
        let estimator = Arc::new(Mutex::new(RembEstimator::new(RembConfig::default(), 1)));
        let mut stage = RembStage::new(Arc::clone(&estimator));
        stage.handle_event(&TransportEvent::ExtensionAdded {
            id: AST_ID,
            kind: RtpExtensionKind::AbsSendTime,
        });
        stage.handle_event(&TransportEvent::FeatureToggled {
            feature: Feature::Remb,
            enabled: false,
        });
        let packet = PacketInfo::new(RtpPacketBuilder::new(100, 1, 0, 9).build());
        stage.observe(&packet, clock.now());
        assert_eq!(estimator.lock().unwrap().stats().packets, 0);

        stage.handle_event(&TransportEvent::FeatureToggled {
            feature: Feature::Remb,
            enabled: true,
        });
        stage.handle_event(&TransportEvent::ExtensionAdded {
            id: 3,
            kind: RtpExtensionKind::TransportCc,
        });
        stage.observe(&packet, clock.now());
        assert_eq!(estimator.lock().unwrap().stats().packets, 0);
    }
}
