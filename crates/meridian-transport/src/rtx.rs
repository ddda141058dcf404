//! # RTX (RFC 4588)
//!
//! Retransmissions travel on a separate SSRC and payload type, with the
//! original sequence number prepended to the payload:
//!
//! ```text
//! +----------------------+------------------+----------------------+
//! | RTP header (RTX ssrc,| OSN (2 bytes,    | original payload     |
//! | RTX pt, RTX seq)     | original seq)    | (padding stripped)   |
//! +----------------------+------------------+----------------------+
//! ```
//!
//! The header extensions of the original are kept, so a retransmission can
//! be tagged with a fresh transport-wide sequence number like any packet.
//!
//! [`RtxEncoder`] runs on the send side, [`RtxDecoder`] on the receive side.
//! Both resolve SSRC and payload type mappings from their own
//! [`StreamTables`], updated by events.

use std::collections::HashMap;

use bytes::BytesMut;
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::events::TransportEvent;
use crate::packet::PacketInfo;
use crate::rtp::{self, RtpView};
use crate::seq::SequenceCounter;
use crate::streams::StreamTables;

/// Length of the original sequence number prefix.
pub const RTX_OSN_LEN: usize = 2;

// ─── Wire Helpers ───────────────────────────────────────────────────────────

/// Build the RTX form of `original`.
pub fn encode_rtx(original: &[u8], rtx_ssrc: u32, rtx_pt: u8, rtx_seq: u16) -> Result<BytesMut> {
    let view = RtpView::parse(original)?;
    let header = view.header_bytes();
    let payload = view.payload();
    let mut out = BytesMut::with_capacity(header.len() + RTX_OSN_LEN + payload.len());
    out.extend_from_slice(header);
    out.extend_from_slice(&view.sequence_number().to_be_bytes());
    out.extend_from_slice(payload);
    out[0] &= !0x20;
    rtp::set_ssrc(&mut out, rtx_ssrc);
    rtp::set_payload_type(&mut out, rtx_pt);
    rtp::set_sequence_number(&mut out, rtx_seq);
    Ok(out)
}

/// Restore the original packet from its RTX form.
///
/// Fails with [`Error::Malformed`] if the payload is too short to hold the
/// original sequence number.
pub fn decode_rtx(rtx: &[u8], media_ssrc: u32, media_pt: u8) -> Result<BytesMut> {
    let view = RtpView::parse(rtx)?;
    let payload = view.payload();
    if payload.len() < RTX_OSN_LEN {
        return Err(Error::Malformed("RTX payload shorter than OSN"));
    }
    let osn = u16::from_be_bytes([payload[0], payload[1]]);
    let header = view.header_bytes();
    let mut out = BytesMut::with_capacity(header.len() + payload.len() - RTX_OSN_LEN);
    out.extend_from_slice(header);
    out.extend_from_slice(&payload[RTX_OSN_LEN..]);
    out[0] &= !0x20;
    rtp::set_ssrc(&mut out, media_ssrc);
    rtp::set_payload_type(&mut out, media_pt);
    rtp::set_sequence_number(&mut out, osn);
    Ok(out)
}

// ─── Encoder (send side) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct RtxSendStats {
    pub packets_encoded: u64,
    pub bytes_encoded: u64,
    pub missing_association: u64,
    pub unknown_payload_type: u64,
}

pub struct RtxEncoder {
    tables: StreamTables,
    sequences: HashMap<u32, SequenceCounter>,
    stats: RtxSendStats,
}

impl RtxEncoder {
    pub fn new() -> Self {
        RtxEncoder {
            tables: StreamTables::new(),
            sequences: HashMap::new(),
            stats: RtxSendStats::default(),
        }
    }

    pub fn handle_event(&mut self, event: &TransportEvent) {
        self.tables.apply(event);
    }

    /// True if retransmissions of `media_ssrc` can go over RTX.
    pub fn has_rtx(&self, media_ssrc: u32) -> bool {
        self.tables.associations.rtx_for(media_ssrc).is_some()
    }

    /// Produce the RTX retransmission of `original`.
    pub fn encode(&mut self, original: &PacketInfo) -> Result<PacketInfo> {
        let view = RtpView::parse(&original.buffer)?;
        let media_ssrc = view.ssrc();
        let Some(rtx_ssrc) = self.tables.associations.rtx_for(media_ssrc) else {
            self.stats.missing_association += 1;
            return Err(Error::MissingAssociation(media_ssrc));
        };
        let Some(rtx_pt) = self.tables.payload_types.rtx_pt_for(view.payload_type()) else {
            self.stats.unknown_payload_type += 1;
            return Err(Error::UnknownPayloadType(view.payload_type()));
        };
        let rtx_seq = self
            .sequences
            .entry(rtx_ssrc)
            .or_insert_with(SequenceCounter::random)
            .next();

        let bytes = encode_rtx(&original.buffer, rtx_ssrc, rtx_pt, rtx_seq)?;
        self.stats.packets_encoded += 1;
        self.stats.bytes_encoded += bytes.len() as u64;
        trace!(media_ssrc, rtx_ssrc, osn = view.sequence_number(), rtx_seq, "rtx encoded");

        let mut packet = original.with_buffer(&bytes);
        packet.retransmission = true;
        Ok(packet)
    }

    pub fn stats(&self) -> RtxSendStats {
        self.stats.clone()
    }
}

impl Default for RtxEncoder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Decoder (receive side) ─────────────────────────────────────────────────

/// What [`RtxDecoder::decode`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtxOutcome {
    /// Not an RTX payload type; untouched.
    NotRtx,
    /// Original ssrc, sequence number and payload type restored in place.
    Restored,
    /// RTX packet carrying only padding; discard.
    PaddingOnly,
    /// RTX SSRC with no known media SSRC; discard.
    MissingAssociation,
    /// Unparseable; discard.
    Malformed,
}

impl RtxOutcome {
    pub fn should_forward(&self) -> bool {
        matches!(self, RtxOutcome::NotRtx | RtxOutcome::Restored)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RtxReceiveStats {
    pub rtx_packets: u64,
    pub restored: u64,
    pub padding_only: u64,
    pub missing_association: u64,
    pub malformed: u64,
}

pub struct RtxDecoder {
    tables: StreamTables,
    stats: RtxReceiveStats,
}

impl RtxDecoder {
    pub fn new() -> Self {
        RtxDecoder {
            tables: StreamTables::new(),
            stats: RtxReceiveStats::default(),
        }
    }

    pub fn handle_event(&mut self, event: &TransportEvent) {
        self.tables.apply(event);
    }

    /// Decode `buf` in place if it is an RTX packet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RtxOutcome {
        let Ok(view) = RtpView::parse(buf) else {
            self.stats.malformed += 1;
            return RtxOutcome::Malformed;
        };
        let Some(media_pt) = self.tables.payload_types.rtx_apt(view.payload_type()) else {
            return RtxOutcome::NotRtx;
        };
        self.stats.rtx_packets += 1;

        if view.payload_len() - view.padding_size() < RTX_OSN_LEN {
            self.stats.padding_only += 1;
            trace!(ssrc = view.ssrc(), seq = view.sequence_number(), "padding-only rtx");
            return RtxOutcome::PaddingOnly;
        }
        let Some(media_ssrc) = self.tables.associations.primary_for_rtx(view.ssrc()) else {
            self.stats.missing_association += 1;
            warn!(rtx_ssrc = view.ssrc(), "rtx packet with no associated media ssrc");
            return RtxOutcome::MissingAssociation;
        };

        match decode_rtx(buf, media_ssrc, media_pt) {
            Ok(restored) => {
                *buf = restored;
                self.stats.restored += 1;
                RtxOutcome::Restored
            }
            Err(_) => {
                self.stats.malformed += 1;
                RtxOutcome::Malformed
            }
        }
    }

    pub fn stats(&self) -> RtxReceiveStats {
        self.stats.clone()
    }
}

impl Default for RtxDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;
    use crate::streams::{Encoding, PayloadType, RtcpFeedback, SsrcAssociationKind};

    const MEDIA_SSRC: u32 = 0x1111;
    const RTX_SSRC: u32 = 0x2222;
    const MEDIA_PT: u8 = 100;
    const RTX_PT: u8 = 96;

    fn events() -> Vec<TransportEvent> {
        vec![
            TransportEvent::PayloadTypeAdded(PayloadType {
                pt: MEDIA_PT,
                encoding: Encoding::Vp8,
                clock_rate: 90_000,
                feedback: RtcpFeedback::default(),
            }),
            TransportEvent::PayloadTypeAdded(PayloadType {
                pt: RTX_PT,
                encoding: Encoding::Rtx { apt: MEDIA_PT },
                clock_rate: 90_000,
                feedback: RtcpFeedback::default(),
            }),
            TransportEvent::SsrcAssociation {
                primary: MEDIA_SSRC,
                secondary: RTX_SSRC,
                kind: SsrcAssociationKind::Rtx,
            },
        ]
    }

    fn pair() -> (RtxEncoder, RtxDecoder) {
        let mut enc = RtxEncoder::new();
        let mut dec = RtxDecoder::new();
        for e in events() {
            enc.handle_event(&e);
            dec.handle_event(&e);
        }
        (enc, dec)
    }

    // ─── Round Trip ─────────────────────────────────────────────────────

    #[test]
    fn encode_decode_restores_original() {
        let (mut enc, mut dec) = pair();
        let original = RtpPacketBuilder::new(MEDIA_PT, 42, 1234, MEDIA_SSRC)
            .marker(true)
            .extension(3, &[0, 1])
            .payload(b"media payload")
            .build();
        let packet = PacketInfo::new(original.clone());

        let mut rtx = enc.encode(&packet).unwrap();
        assert!(rtx.retransmission);
        {
            let view = RtpView::parse(&rtx.buffer).unwrap();
            assert_eq!(view.ssrc(), RTX_SSRC);
            assert_eq!(view.payload_type(), RTX_PT);
            assert_eq!(&view.payload()[..2], &42u16.to_be_bytes());
            assert_eq!(view.extension(3), Some(&[0, 1][..]));
        }

        assert_eq!(dec.decode(&mut rtx.buffer), RtxOutcome::Restored);
        let view = RtpView::parse(&rtx.buffer).unwrap();
        assert_eq!(view.ssrc(), MEDIA_SSRC);
        assert_eq!(view.sequence_number(), 42);
        assert_eq!(view.payload_type(), MEDIA_PT);
        assert_eq!(view.payload(), b"media payload");
        assert_eq!(&rtx.buffer[..], &original[..]);
    }

    #[test]
    fn padding_is_stripped_on_encode() {
        let (mut enc, _) = pair();
        let original = RtpPacketBuilder::new(MEDIA_PT, 1, 0, MEDIA_SSRC)
            .payload(b"abc")
            .padding(8)
            .build();
        let rtx = enc.encode(&PacketInfo::new(original)).unwrap();
        let view = RtpView::parse(&rtx.buffer).unwrap();
        assert_eq!(view.padding_size(), 0);
        assert_eq!(view.payload().len(), 2 + 3);
    }

    #[test]
    fn rtx_sequence_numbers_are_consecutive() {
        let (mut enc, _) = pair();
        let packet = PacketInfo::new(RtpPacketBuilder::new(MEDIA_PT, 9, 0, MEDIA_SSRC).build());
        let a = enc.encode(&packet).unwrap();
        let b = enc.encode(&packet).unwrap();
        let sa = RtpView::parse(&a.buffer).unwrap().sequence_number();
        let sb = RtpView::parse(&b.buffer).unwrap().sequence_number();
        assert_eq!(sb, sa.wrapping_add(1));
    }

    // ─── Discards ───────────────────────────────────────────────────────

    #[test]
    fn padding_only_rtx_is_discarded() {
        let (_, mut dec) = pair();
        let mut buf = RtpPacketBuilder::new(RTX_PT, 5, 0, RTX_SSRC)
            .payload(&[0x01])
            .padding(100)
            .build();
        assert_eq!(dec.decode(&mut buf), RtxOutcome::PaddingOnly);
        assert_eq!(dec.stats().padding_only, 1);
    }

    #[test]
    fn unknown_rtx_ssrc_is_discarded() {
        let (_, mut dec) = pair();
        let mut buf = RtpPacketBuilder::new(RTX_PT, 5, 0, 0x9999)
            .payload(&[0, 1, 2, 3])
            .build();
        assert_eq!(dec.decode(&mut buf), RtxOutcome::MissingAssociation);
        assert!(!RtxOutcome::MissingAssociation.should_forward());
    }

    #[test]
    fn non_rtx_passes_untouched() {
        let (_, mut dec) = pair();
        let mut buf = RtpPacketBuilder::new(MEDIA_PT, 5, 0, MEDIA_SSRC)
            .payload(b"x")
            .build();
        let before = buf.clone();
        assert_eq!(dec.decode(&mut buf), RtxOutcome::NotRtx);
        assert_eq!(buf, before);
    }

    #[test]
    fn encoder_requires_association() {
        let mut enc = RtxEncoder::new();
        let packet = PacketInfo::new(RtpPacketBuilder::new(MEDIA_PT, 1, 0, MEDIA_SSRC).build());
        assert_eq!(
            enc.encode(&packet).unwrap_err(),
            Error::MissingAssociation(MEDIA_SSRC)
        );
        assert_eq!(enc.stats().missing_association, 1);
    }
}
