use quanta::Instant;

use meridian_transport::events::TransportEvent;
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtx::{RtxDecoder, RtxOutcome};
use meridian_transport::stats::StatBlock;

use crate::stage::{StageBehavior, StageOutput, Transformer};

/// Restores RTX packets to their original form. Nothing downstream of this
/// stage sees RTX framing.
pub struct RtxDecodeStage {
    decoder: RtxDecoder,
}

impl RtxDecodeStage {
    pub fn new() -> Self {
        RtxDecodeStage {
            decoder: RtxDecoder::new(),
        }
    }
}

impl Default for RtxDecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl StageBehavior for RtxDecodeStage {
    fn name(&self) -> &str {
        "rtx-decode"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        self.decoder.handle_event(event);
    }

    fn stats(&self) -> StatBlock {
        let s = self.decoder.stats();
        StatBlock::new()
            .with("rtx_packets", s.rtx_packets)
            .with("restored", s.restored)
            .with("padding_only", s.padding_only)
            .with("missing_association", s.missing_association)
            .with("malformed", s.malformed)
    }
}

impl Transformer for RtxDecodeStage {
    fn transform(&mut self, mut packet: PacketInfo, _now: Instant) -> StageOutput {
        let outcome = self.decoder.decode(&mut packet.buffer);
        if outcome == RtxOutcome::Restored {
            packet.retransmission = true;
        }
        if outcome.should_forward() {
            StageOutput::Forward(packet)
        } else {
            StageOutput::Discard(packet)
        }
    }
}
