use quanta::Instant;
use tracing::trace;

use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtp::RtpView;
use meridian_transport::stats::StatBlock;

use crate::stage::{Filter, StageBehavior};

/// Drops RTP packets whose payload is nothing but padding (probes).
pub struct PaddingTerminationFilter {
    enabled: bool,
    terminated: u64,
    terminated_bytes: u64,
}

impl PaddingTerminationFilter {
    pub fn new(enabled: bool) -> Self {
        PaddingTerminationFilter {
            enabled,
            terminated: 0,
            terminated_bytes: 0,
        }
    }
}

impl StageBehavior for PaddingTerminationFilter {
    fn name(&self) -> &str {
        "padding-termination"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        if let TransportEvent::FeatureToggled {
            feature: Feature::PaddingTermination,
            enabled,
        } = event
        {
            self.enabled = *enabled;
        }
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new()
            .with("enabled", self.enabled)
            .with("terminated", self.terminated)
            .with("terminated_bytes", self.terminated_bytes)
    }
}

impl Filter for PaddingTerminationFilter {
    fn accept(&mut self, packet: &PacketInfo, _now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        match RtpView::parse(&packet.buffer) {
            Ok(view) if view.is_padding_only() => {
                self.terminated += 1;
                self.terminated_bytes += packet.len() as u64;
                trace!(
                    ssrc = view.ssrc(),
                    seq = view.sequence_number(),
                    "padding-only packet terminated"
                );
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_transport::rtp::RtpPacketBuilder;
    use quanta::Clock;

    #[test]
    fn drops_padding_only_and_keeps_media() {
        let now = Clock::new().now();
        let mut filter = PaddingTerminationFilter::new(true);
        let padding = PacketInfo::new(RtpPacketBuilder::new(100, 1, 0, 5).padding(200).build());
        let media = PacketInfo::new(
            RtpPacketBuilder::new(100, 2, 0, 5)
                .payload(&[1, 2, 3])
                .padding(4)
                .build(),
        );
        assert!(!filter.accept(&padding, now));
        assert!(filter.accept(&media, now));
        assert_eq!(filter.stats().count("terminated"), 1);
    }

    #[test]
    fn disabled_by_feature_toggle() {
        let now = Clock::new().now();
        let mut filter = PaddingTerminationFilter::new(true);
        filter.handle_event(&TransportEvent::FeatureToggled {
            feature: Feature::PaddingTermination,
            enabled: false,
        });
        let padding = PacketInfo::new(RtpPacketBuilder::new(100, 1, 0, 5).padding(200).build());
        assert!(filter.accept(&padding, now));
    }
}
