//! # RTCP Termination
//!
//! Consumes the RTCP feedback this transport acts on itself and forwards the
//! rest (PLI/FIR, unknown types) to the receive sink.
//!
//! ## Key design decisions
//!
//! - Transport-cc feedback goes to the [`TransportCcEngine`]; the resulting
//!   estimate is published as a [`TransportEvent::BandwidthEstimate`].
//! - NACKs are answered by the [`NackResponder`] from the packet cache. The
//!   cache, the RTX encoder and the send queue are each touched in turn,
//!   never while another is locked.
//! - A compound packet is discarded once every message in it was consumed;
//!   if anything is left for the application, the whole buffer is forwarded.

use std::sync::{Arc, Mutex};

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace, warn};

use meridian_transport::bwe::Bandwidth;
use meridian_transport::cache::RtpPacketCache;
use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtcp::{parse_compound, NackPacket, RtcpPacket};
use meridian_transport::rtx::RtxEncoder;
use meridian_transport::stats::StatBlock;
use meridian_transport::tcc::TransportCcEngine;

use crate::stage::{StageBehavior, StageOutput, Transformer};
use crate::stages::{EventOutput, PacketOutput};

// ─── NACK Responder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct NackResponderStats {
    pub nacks_received: u64,
    pub packets_requested: u64,
    pub resent_rtx: u64,
    pub resent_plain: u64,
    pub cache_misses: u64,
    pub encode_failures: u64,
}

/// Answers NACKs from the packet cache.
///
/// With RTX enabled and an RTX stream associated, packets are resent in RTX
/// form; otherwise the original is resent as-is.
pub struct NackResponder {
    cache: Arc<RtpPacketCache>,
    encoder: Arc<Mutex<RtxEncoder>>,
    output: PacketOutput,
    rtx_enabled: bool,
    stats: NackResponderStats,
}

impl NackResponder {
    pub fn new(
        cache: Arc<RtpPacketCache>,
        encoder: Arc<Mutex<RtxEncoder>>,
        output: PacketOutput,
        rtx_enabled: bool,
    ) -> Self {
        NackResponder {
            cache,
            encoder,
            output,
            rtx_enabled,
            stats: NackResponderStats::default(),
        }
    }

    pub fn set_rtx_enabled(&mut self, enabled: bool) {
        self.rtx_enabled = enabled;
    }

    pub fn respond(&mut self, nack: &NackPacket) {
        self.stats.nacks_received += 1;
        for &seq in &nack.lost {
            self.stats.packets_requested += 1;
            let Some(original) = self.cache.get(nack.media_ssrc, seq) else {
                self.stats.cache_misses += 1;
                trace!(ssrc = nack.media_ssrc, seq, "nacked packet not in cache");
                continue;
            };
            let resend = if self.rtx_enabled {
                let mut encoder = self.encoder.lock().unwrap_or_else(|e| e.into_inner());
                if encoder.has_rtx(nack.media_ssrc) {
                    match encoder.encode(&original) {
                        Ok(packet) => Some(packet),
                        Err(e) => {
                            self.stats.encode_failures += 1;
                            warn!(ssrc = nack.media_ssrc, seq, error = %e, "rtx encode failed");
                            continue;
                        }
                    }
                } else {
                    None
                }
            } else {
                None
            };
            let packet = match resend {
                Some(rtx) => {
                    self.stats.resent_rtx += 1;
                    original.discard();
                    rtx
                }
                None => {
                    self.stats.resent_plain += 1;
                    let mut plain = original;
                    plain.retransmission = true;
                    plain
                }
            };
            (self.output)(packet);
        }
    }

    pub fn stats(&self) -> NackResponderStats {
        self.stats.clone()
    }
}

// ─── Termination Stage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct RtcpTerminationStats {
    pub compounds: u64,
    pub malformed: u64,
    pub nacks: u64,
    pub tcc_feedback: u64,
    pub remb: u64,
    pub keyframe_requests: u64,
    pub other: u64,
    pub forwarded: u64,
    pub last_estimate_bps: u64,
}

pub struct RtcpTerminationStage {
    engine: Option<Arc<TransportCcEngine>>,
    responder: Option<NackResponder>,
    events: EventOutput,
    stats: RtcpTerminationStats,
}

impl RtcpTerminationStage {
    pub fn new(
        engine: Option<Arc<TransportCcEngine>>,
        responder: Option<NackResponder>,
        events: EventOutput,
    ) -> Self {
        RtcpTerminationStage {
            engine,
            responder,
            events,
            stats: RtcpTerminationStats::default(),
        }
    }

    fn publish_estimate(&mut self, estimate: Bandwidth) {
        self.stats.last_estimate_bps = estimate.bps();
        (self.events)(TransportEvent::BandwidthEstimate(estimate));
    }
}

impl StageBehavior for RtcpTerminationStage {
    fn name(&self) -> &str {
        "rtcp-termination"
    }

    fn handle_event(&mut self, event: &TransportEvent) {
        if let TransportEvent::FeatureToggled {
            feature: Feature::Rtx,
            enabled,
        } = event
        {
            if let Some(responder) = self.responder.as_mut() {
                responder.set_rtx_enabled(*enabled);
            }
        }
    }

    fn stats(&self) -> StatBlock {
        let s = &self.stats;
        let mut block = StatBlock::new()
            .with("compounds", s.compounds)
            .with("malformed", s.malformed)
            .with("nacks", s.nacks)
            .with("tcc_feedback", s.tcc_feedback)
            .with("remb", s.remb)
            .with("keyframe_requests", s.keyframe_requests)
            .with("other", s.other)
            .with("forwarded", s.forwarded)
            .with("last_estimate_bps", s.last_estimate_bps);
        if let Some(responder) = &self.responder {
            let r = responder.stats();
            block.add("resent_rtx", r.resent_rtx);
            block.add("resent_plain", r.resent_plain);
            block.add("resend_cache_misses", r.cache_misses);
        }
        block
    }
}

impl Transformer for RtcpTerminationStage {
    fn transform(&mut self, packet: PacketInfo, now: Instant) -> StageOutput {
        self.stats.compounds += 1;
        let messages = match parse_compound(&packet.buffer) {
            Ok(messages) => messages,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "malformed RTCP dropped");
                return StageOutput::Discard(packet);
            }
        };

        let mut forward = false;
        for message in &messages {
            match message {
                RtcpPacket::TransportCc(feedback) => {
                    self.stats.tcc_feedback += 1;
                    if let Some(engine) = &self.engine {
                        let estimate = engine.on_feedback(feedback, now);
                        self.publish_estimate(estimate);
                    }
                }
                RtcpPacket::Nack(nack) => {
                    self.stats.nacks += 1;
                    if let Some(responder) = self.responder.as_mut() {
                        responder.respond(nack);
                    }
                }
                RtcpPacket::Remb(remb) => {
                    self.stats.remb += 1;
                    // Transport-cc takes precedence once feedback flows.
                    if self.stats.tcc_feedback == 0 {
                        self.publish_estimate(Bandwidth::from_bps(remb.bitrate_bps));
                    }
                }
                RtcpPacket::Pli(_) | RtcpPacket::Fir(_) => {
                    self.stats.keyframe_requests += 1;
                    forward = true;
                }
                RtcpPacket::Other { .. } => {
                    self.stats.other += 1;
                    forward = true;
                }
            }
        }

        if forward {
            self.stats.forwarded += 1;
            StageOutput::Forward(packet)
        } else {
            StageOutput::Discard(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use meridian_transport::rtcp::PliPacket;
    use meridian_transport::rtp::{RtpPacketBuilder, RtpView};
    use meridian_transport::streams::{Encoding, PayloadType, RtcpFeedback, SsrcAssociationKind};
    use quanta::Clock;

    const MEDIA: u32 = 0x1000;
    const RTX: u32 = 0x2000;

    fn cache_with(seqs: &[u16]) -> Arc<RtpPacketCache> {
        let now = Clock::new().now();
        let cache = Arc::new(RtpPacketCache::new(64));
        for &seq in seqs {
            let packet = PacketInfo::new(
                RtpPacketBuilder::new(100, seq, 0, MEDIA)
                    .payload(&[seq as u8; 10])
                    .build(),
            );
            cache.insert(&packet, now);
        }
        cache
    }

    fn rtx_encoder() -> Arc<Mutex<RtxEncoder>> {
        let mut encoder = RtxEncoder::new();
        for event in [
            TransportEvent::PayloadTypeAdded(PayloadType {
                pt: 100,
                encoding: Encoding::Vp8,
                clock_rate: 90_000,
                feedback: RtcpFeedback::default(),
            }),
            TransportEvent::PayloadTypeAdded(PayloadType {
                pt: 96,
                encoding: Encoding::Rtx { apt: 100 },
                clock_rate: 90_000,
                feedback: RtcpFeedback::default(),
            }),
            TransportEvent::SsrcAssociation {
                primary: MEDIA,
                secondary: RTX,
                kind: SsrcAssociationKind::Rtx,
            },
        ] {
            encoder.handle_event(&event);
        }
        Arc::new(Mutex::new(encoder))
    }

    fn collector() -> (PacketOutput, Arc<Mutex<Vec<PacketInfo>>>) {
        let out: Arc<Mutex<Vec<PacketInfo>>> = Arc::default();
        let sink = Arc::clone(&out);
        (Arc::new(move |p| sink.lock().unwrap().push(p)), out)
    }

    fn no_events() -> EventOutput {
        Arc::new(|_| {})
    }

    #[test]
    fn nack_answered_over_rtx() {
        let (output, resent) = collector();
        let responder = NackResponder::new(cache_with(&[1, 2, 3]), rtx_encoder(), output, true);
        let mut stage = RtcpTerminationStage::new(None, Some(responder), no_events());
        let nack = RtcpPacket::Nack(NackPacket::new(1, MEDIA, vec![2, 3, 9]));
        let out = stage.transform(PacketInfo::new(nack.to_bytes()), Clock::new().now());
        assert!(matches!(out, StageOutput::Discard(_)));

        let resent = resent.lock().unwrap();
        assert_eq!(resent.len(), 2);
        for packet in resent.iter() {
            assert!(packet.retransmission);
            assert_eq!(RtpView::parse(&packet.buffer).unwrap().ssrc(), RTX);
        }
        let stats = stage.stats();
        assert_eq!(stats.count("resent_rtx"), 2);
        assert_eq!(stats.count("resend_cache_misses"), 1);
    }

    #[test]
    fn nack_answered_plain_when_rtx_disabled() {
        let (output, resent) = collector();
        let responder = NackResponder::new(cache_with(&[5]), rtx_encoder(), output, true);
        let mut stage = RtcpTerminationStage::new(None, Some(responder), no_events());
        stage.handle_event(&TransportEvent::FeatureToggled {
            feature: Feature::Rtx,
            enabled: false,
        });
        let nack = RtcpPacket::Nack(NackPacket::new(1, MEDIA, vec![5]));
        stage.transform(PacketInfo::new(nack.to_bytes()), Clock::new().now());

        let resent = resent.lock().unwrap();
        assert_eq!(resent.len(), 1);
        let view = RtpView::parse(&resent[0].buffer).unwrap();
        assert_eq!((view.ssrc(), view.sequence_number()), (MEDIA, 5));
    }

    #[test]
    fn keyframe_requests_are_forwarded() {
        let mut stage = RtcpTerminationStage::new(None, None, no_events());
        let pli = RtcpPacket::Pli(PliPacket {
            sender_ssrc: 1,
            media_ssrc: MEDIA,
        });
        let out = stage.transform(PacketInfo::new(pli.to_bytes()), Clock::new().now());
        assert!(matches!(out, StageOutput::Forward(_)));
    }

    #[test]
    fn malformed_rtcp_is_discarded() {
        let mut stage = RtcpTerminationStage::new(None, None, no_events());
        let malformed = PacketInfo::new(BytesMut::from(&[0x80u8, 205, 0, 9][..]));
        let out = stage.transform(malformed, Clock::new().now());
        assert!(matches!(out, StageOutput::Discard(_)));
        assert_eq!(stage.stats().count("malformed"), 1);
    }

    #[test]
    fn remb_publishes_estimate_without_transport_cc() {
        let seen: Arc<Mutex<Vec<TransportEvent>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let events: EventOutput = Arc::new(move |e| sink.lock().unwrap().push(e));
        let mut stage = RtcpTerminationStage::new(None, None, events);
        let remb = RtcpPacket::Remb(meridian_transport::rtcp::RembPacket {
            sender_ssrc: 1,
            bitrate_bps: 750_000,
            ssrcs: vec![MEDIA],
        });
        stage.transform(PacketInfo::new(remb.to_bytes()), Clock::new().now());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransportEvent::BandwidthEstimate(Bandwidth::from_bps(750_000))]
        );
    }
}
