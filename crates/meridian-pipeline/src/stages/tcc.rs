//! Transport-cc stages: the receive-side generator feeding feedback reports
//! back to the sender, and the send-side tagger stamping the transport-wide
//! sequence number.

use std::sync::{Arc, Mutex};

use quanta::Instant;
use tracing::warn;

use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtcp::RtcpPacket;
use meridian_transport::rtp::{add_extension, RtpView};
use meridian_transport::stats::StatBlock;
use meridian_transport::streams::{ExtensionTable, MediaType, RtpExtensionKind};
use meridian_transport::tcc::{TccArrival, TccGenerator, TransportCcEngine};

use crate::stage::{Modifier, Observer, StageBehavior};
use crate::stages::RtcpOutput;

fn apply_extension_event(extensions: &mut ExtensionTable, event: &TransportEvent) {
    match event {
        TransportEvent::ExtensionAdded { id, kind } => extensions.insert(*id, kind.clone()),
        TransportEvent::ExtensionsCleared => extensions.clear(),
        _ => {}
    }
}

// ─── Generator (receive side) ───────────────────────────────────────────────

pub struct TccGeneratorStage {
    generator: Arc<Mutex<TccGenerator>>,
    extensions: ExtensionTable,
    enabled: bool,
    output: RtcpOutput,
    missing_extension: u64,
}

impl TccGeneratorStage {
    pub fn new(generator: Arc<Mutex<TccGenerator>>, enabled: bool, output: RtcpOutput) -> Self {
        TccGeneratorStage {
            generator,
            extensions: ExtensionTable::default(),
            enabled,
            output,
            missing_extension: 0,
        }
    }
}

impl StageBehavior for TccGeneratorStage {
    fn name(&self) -> &str {
        "tcc-generator"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        apply_extension_event(&mut self.extensions, event);
        match event {
            TransportEvent::FeatureToggled {
                feature: Feature::TransportCc,
                enabled,
            } => self.enabled = *enabled,
            TransportEvent::LocalSsrc {
                media: MediaType::Video,
                ssrc,
            } => self
                .generator
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .set_sender_ssrc(*ssrc),
            _ => {}
        }
    }

    fn stats(&self) -> StatBlock {
        let s = self.generator.lock().unwrap_or_else(|e| e.into_inner()).stats();
        StatBlock::new()
            .with("packets", s.packets)
            .with("duplicates", s.duplicates)
            .with("late", s.late)
            .with("reports", s.reports)
            .with("entries_reported", s.entries_reported)
            .with("resets", s.resets)
            .with("missing_extension", self.missing_extension)
    }
}

impl Observer for TccGeneratorStage {
    fn observe(&mut self, packet: &PacketInfo, now: Instant) {
        if !self.enabled {
            return;
        }
        let Some(id) = self.extensions.id_of(&RtpExtensionKind::TransportCc) else {
            return;
        };
        let Ok(view) = RtpView::parse(&packet.buffer) else {
            return;
        };
        let seq = match view.extension(id) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
            _ => {
                self.missing_extension += 1;
                return;
            }
        };
        let arrival = TccArrival {
            seq,
            media_ssrc: view.ssrc(),
            size: packet.len(),
            marker: view.marker(),
            at: packet.received_time.unwrap_or(now),
        };
        let report = self
            .generator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .packet_received(arrival);
        if let Some(feedback) = report {
            (self.output)(RtcpPacket::TransportCc(feedback));
        }
    }
}

// ─── Tagger (send side) ─────────────────────────────────────────────────────

/// Stamps outgoing RTP with a transport-wide sequence number and records it
/// in the engine's send history.
pub struct TccTaggerStage {
    engine: Arc<TransportCcEngine>,
    extensions: ExtensionTable,
    enabled: bool,
    tagged: u64,
    failures: u64,
}

impl TccTaggerStage {
    pub fn new(engine: Arc<TransportCcEngine>, enabled: bool) -> Self {
        TccTaggerStage {
            engine,
            extensions: ExtensionTable::default(),
            enabled,
            tagged: 0,
            failures: 0,
        }
    }
}

impl StageBehavior for TccTaggerStage {
    fn name(&self) -> &str {
        "tcc-tagger"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        apply_extension_event(&mut self.extensions, event);
        if let TransportEvent::FeatureToggled {
            feature: Feature::TransportCc,
            enabled,
        } = event
        {
            self.enabled = *enabled;
        }
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new()
            .with("tagged", self.tagged)
            .with("failures", self.failures)
            .with("history", self.engine.history_len())
    }
}

impl Modifier for TccTaggerStage {
    fn modify(&mut self, packet: &mut PacketInfo, now: Instant) {
        if !self.enabled {
            return;
        }
        let Some(id) = self.extensions.id_of(&RtpExtensionKind::TransportCc) else {
            return;
        };
        let seq = self.engine.allocate_sequence();
        if let Err(e) = add_extension(&mut packet.buffer, id, &seq.to_be_bytes()) {
            self.failures += 1;
            warn!(error = %e, "cannot add transport-cc extension");
            return;
        }
        packet.sent_time = Some(now);
        self.engine.packet_sent(seq, packet.len(), now);
        self.tagged += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_transport::bwe::{DelayBasedEstimator, EstimatorConfig};
    use meridian_transport::rtp::RtpPacketBuilder;
    use meridian_transport::tcc::{TccGeneratorConfig, TccSenderConfig};
    use quanta::Clock;

    const TCC_ID: u8 = 3;

    fn mapped() -> TransportEvent {
        TransportEvent::ExtensionAdded {
            id: TCC_ID,
            kind: RtpExtensionKind::TransportCc,
        }
    }

    #[test]
    fn tagger_assigns_increasing_sequence_numbers() {
        let (clock, _mock) = Clock::mock();
        let engine = Arc::new(TransportCcEngine::new(
            TccSenderConfig::default(),
            Box::new(DelayBasedEstimator::new(EstimatorConfig::default())),
        ));
        let mut tagger = TccTaggerStage::new(Arc::clone(&engine), true);
        tagger.handle_event(&mapped());

        let mut seqs = Vec::new();
        for i in 0..3u16 {
            let mut packet = PacketInfo::new(
                RtpPacketBuilder::new(100, i, 0, 7)
                    .payload(&[0; 20])
                    .build(),
            );
            tagger.modify(&mut packet, clock.now());
            let view = RtpView::parse(&packet.buffer).unwrap();
            let ext = view.extension(TCC_ID).unwrap();
            seqs.push(u16::from_be_bytes([ext[0], ext[1]]));
            assert_eq!(view.payload(), &[0; 20]);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(engine.history_len(), 3);
    }

    #[test]
    fn tagger_is_inert_without_mapping() {
        let (clock, _mock) = Clock::mock();
        let engine = Arc::new(TransportCcEngine::new(
            TccSenderConfig::default(),
            Box::new(DelayBasedEstimator::new(EstimatorConfig::default())),
        ));
        let mut tagger = TccTaggerStage::new(Arc::clone(&engine), true);
        let original = RtpPacketBuilder::new(100, 1, 0, 7).payload(&[1]).build();
        let mut packet = PacketInfo::new(original.clone());
        tagger.modify(&mut packet, clock.now());
        assert_eq!(packet.buffer, original);
        assert_eq!(engine.history_len(), 0);
    }

    #[test]
    fn generator_emits_feedback_on_marker() {
        let (clock, mock) = Clock::mock();
        mock.increment(std::time::Duration::from_secs(10));
        let out: Arc<Mutex<Vec<RtcpPacket>>> = Arc::default();
        let sink = Arc::clone(&out);
        let generator = Arc::new(Mutex::new(TccGenerator::new(TccGeneratorConfig::default(), 1)));
        let mut stage = TccGeneratorStage::new(
            generator,
            true,
            Arc::new(move |p| sink.lock().unwrap().push(p)),
        );
        stage.handle_event(&mapped());

        for seq in 1..=5u16 {
            mock.increment(std::time::Duration::from_millis(20));
            let buf = RtpPacketBuilder::new(100, seq, 0, 9)
                .marker(seq == 5)
                .extension(TCC_ID, &seq.to_be_bytes())
                .payload(&[0; 100])
                .build();
            stage.observe(&PacketInfo::new(buf), clock.now());
        }
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            RtcpPacket::TransportCc(fb) => {
                assert_eq!(fb.base_seq, 1);
                assert_eq!(fb.received().count(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
