//! # Probing Data Sender
//!
//! Produces extra traffic so the bandwidth estimator can discover headroom.
//! The byte budget is first spent replaying recently sent packets of the
//! probed stream over RTX (useful to the receiver if anything was lost),
//! then topped up with padding-only packets.
//!
//! ## Key design decisions
//!
//! - The cached set is replayed at most `passes` times. Two passes is the
//!   default; more passes trade duplicate traffic for fewer padding packets.
//! - Padding packets go out on a dedicated local video SSRC with their own
//!   sequence and timestamp (+3000 per packet). Their payload is entirely
//!   RTP padding, so a remote padding terminator can drop them unseen.
//! - Replay uses the codec annotations on cached packets: keyframe packets
//!   go first, then lower quality indices. Padding takes the payload type of
//!   the highest annotated quality of the probed stream and falls back to
//!   the lowest video payload type.
//! - A cache miss, or a stream without RTX, degrades to padding only.
//! - RTX encoding is supplied by the caller per packet, so the cache lock
//!   and the encoder lock are never held together.

use bytes::BytesMut;
use serde::Serialize;
use tracing::{debug, trace};

use crate::cache::RtpPacketCache;
use crate::events::TransportEvent;
use crate::packet::PacketInfo;
use crate::rtp::{RtpPacketBuilder, RtpView};
use crate::seq::SequenceCounter;
use crate::streams::{MediaType, PayloadTypeTable};

/// Timestamp advance per padding packet (1/30 s at 90 kHz).
pub const PADDING_TIMESTAMP_STEP: u32 = 3000;

#[derive(Debug, Clone)]
pub struct ProbingConfig {
    /// Times the cached packets may be replayed per probe.
    pub passes: usize,
    /// RTP padding bytes per padding packet (count byte included, max 255).
    pub padding_len: u8,
}

impl Default for ProbingConfig {
    fn default() -> Self {
        ProbingConfig {
            passes: 2,
            padding_len: 255,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbingStats {
    pub probes: u64,
    pub bytes_requested: u64,
    pub rtx_packets: u64,
    pub rtx_bytes: u64,
    pub padding_packets: u64,
    pub padding_bytes: u64,
    /// Probes where the cache had nothing to replay.
    pub cache_misses: u64,
    /// Probes that could not be padded (no local video SSRC or payload type).
    pub unpadded: u64,
}

pub struct ProbingDataSender {
    config: ProbingConfig,
    payload_types: PayloadTypeTable,
    local_video_ssrc: Option<u32>,
    padding_seq: SequenceCounter,
    padding_ts: u32,
    stats: ProbingStats,
}

impl ProbingDataSender {
    pub fn new(config: ProbingConfig) -> Self {
        ProbingDataSender {
            config,
            payload_types: PayloadTypeTable::default(),
            local_video_ssrc: None,
            padding_seq: SequenceCounter::random(),
            padding_ts: rand::random::<u32>(),
            stats: ProbingStats::default(),
        }
    }

    pub fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::PayloadTypeAdded(pt) => self.payload_types.insert(pt.clone()),
            TransportEvent::PayloadTypesCleared => self.payload_types.clear(),
            TransportEvent::LocalSsrc {
                media: MediaType::Video,
                ssrc,
            } => self.local_video_ssrc = Some(*ssrc),
            _ => {}
        }
    }

    /// Build probing packets worth about `num_bytes` for `media_ssrc`.
    ///
    /// `encode` turns a cached original into its retransmission; returning
    /// `None` stops the replay phase.
    pub fn send_probing(
        &mut self,
        media_ssrc: u32,
        num_bytes: usize,
        cache: &RtpPacketCache,
        mut encode: impl FnMut(&PacketInfo) -> Option<PacketInfo>,
    ) -> Vec<PacketInfo> {
        self.stats.probes += 1;
        self.stats.bytes_requested += num_bytes as u64;
        let mut out = Vec::new();
        let mut sent = 0usize;

        let mut cached = cache.newest_covering(media_ssrc, num_bytes);
        if cached.is_empty() {
            self.stats.cache_misses += 1;
        }
        let padding_pt = self.padding_pt(&cached);
        cached.sort_by_key(|p| (!p.codec.keyframe, p.codec.quality_index.unwrap_or(0)));
        'replay: for _ in 0..self.config.passes {
            for original in &cached {
                if sent >= num_bytes {
                    break 'replay;
                }
                let Some(mut packet) = encode(original) else {
                    break 'replay;
                };
                packet.probing = true;
                sent += packet.len();
                self.stats.rtx_packets += 1;
                self.stats.rtx_bytes += packet.len() as u64;
                out.push(packet);
            }
        }

        if sent < num_bytes {
            let padded = self.pad(num_bytes - sent, padding_pt, &mut out);
            trace!(media_ssrc, replayed = sent, padded, "probe built");
        }
        out
    }

    /// Payload type of the highest annotated quality among `cached` (newest
    /// wins a tie), if it is a known video media type.
    fn padding_pt(&self, cached: &[PacketInfo]) -> Option<u8> {
        let is_video_media = |pt: u8| {
            self.payload_types
                .get(pt)
                .is_some_and(|t| !t.is_rtx() && t.encoding.media_type() == MediaType::Video)
        };
        cached
            .iter()
            .rev()
            .filter_map(|p| {
                let quality = p.codec.quality_index?;
                let pt = RtpView::parse(&p.buffer).ok()?.payload_type();
                Some((quality, pt))
            })
            .filter(|&(_, pt)| is_video_media(pt))
            .max_by_key(|&(quality, _)| quality)
            .map(|(_, pt)| pt)
            .or_else(|| self.payload_types.video_pt())
    }

    fn pad(&mut self, remaining: usize, pt: Option<u8>, out: &mut Vec<PacketInfo>) -> usize {
        let (Some(ssrc), Some(pt)) = (self.local_video_ssrc, pt) else {
            self.stats.unpadded += 1;
            debug!(remaining, "no local video ssrc/payload type for padding");
            return 0;
        };
        let mut padded = 0;
        while padded < remaining {
            self.padding_ts = self.padding_ts.wrapping_add(PADDING_TIMESTAMP_STEP);
            let seq = self.padding_seq.next();
            let buf: BytesMut = RtpPacketBuilder::new(pt, seq, self.padding_ts, ssrc)
                .padding(self.config.padding_len.max(1))
                .build();
            padded += buf.len();
            self.stats.padding_packets += 1;
            self.stats.padding_bytes += buf.len() as u64;
            let mut packet = PacketInfo::new(buf);
            packet.probing = true;
            out.push(packet);
        }
        padded
    }

    pub fn stats(&self) -> ProbingStats {
        self.stats.clone()
    }
}
