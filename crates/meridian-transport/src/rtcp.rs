//! # RTCP Feedback Codecs
//!
//! Encoding and parsing of the RTCP feedback messages the transport core
//! produces and consumes:
//!
//! | Message        | PT  | FMT | Reference |
//! |----------------|-----|-----|-----------|
//! | Generic NACK   | 205 | 1   | RFC 4585  |
//! | Transport-cc   | 205 | 15  | draft-holmer-rmcat-transport-wide-cc-extensions |
//! | PLI            | 206 | 1   | RFC 4585  |
//! | FIR            | 206 | 4   | RFC 5104  |
//! | REMB           | 206 | 15  | draft-alvestrand-rmcat-remb |
//!
//! Everything else in a compound packet is surfaced as
//! [`RtcpPacket::Other`] and skipped by consumers.

use bytes::{BufMut, BytesMut};

use crate::error::{ensure_len, Error, Result};
use crate::seq;

pub const RTCP_HEADER_LEN: usize = 4;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
pub const FMT_NACK: u8 = 1;
pub const FMT_TCC: u8 = 15;
pub const FMT_PLI: u8 = 1;
pub const FMT_FIR: u8 = 4;
pub const FMT_AFB: u8 = 15;

const REMB_IDENTIFIER: &[u8; 4] = b"REMB";

// ─── Packet Enum ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    Nack(NackPacket),
    Pli(PliPacket),
    Fir(FirPacket),
    Remb(RembPacket),
    TransportCc(TccFeedback),
    Other { packet_type: u8, fmt: u8 },
}

impl RtcpPacket {
    /// Append the wire encoding to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            RtcpPacket::Nack(p) => p.encode(out),
            RtcpPacket::Pli(p) => p.encode(out),
            RtcpPacket::Fir(p) => p.encode(out),
            RtcpPacket::Remb(p) => p.encode(out),
            RtcpPacket::TransportCc(p) => p.encode(out),
            RtcpPacket::Other { .. } => {}
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(64);
        self.encode(&mut out);
        out
    }
}

/// Parse every packet in a compound RTCP buffer.
pub fn parse_compound(buf: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        ensure_len(&buf[pos..], RTCP_HEADER_LEN)?;
        let b0 = buf[pos];
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::BadVersion(version));
        }
        let padding = b0 & 0x20 != 0;
        let fmt = b0 & 0x1F;
        let packet_type = buf[pos + 1];
        let words = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        let total = (words + 1) * 4;
        ensure_len(&buf[pos..], total)?;

        let mut body = &buf[pos + RTCP_HEADER_LEN..pos + total];
        if padding {
            let count = body.last().copied().unwrap_or(0) as usize;
            if count == 0 || count > body.len() {
                return Err(Error::Malformed("RTCP padding length"));
            }
            body = &body[..body.len() - count];
        }

        packets.push(parse_one(packet_type, fmt, body)?);
        pos += total;
    }
    Ok(packets)
}

fn parse_one(packet_type: u8, fmt: u8, body: &[u8]) -> Result<RtcpPacket> {
    Ok(match (packet_type, fmt) {
        (PT_RTPFB, FMT_NACK) => RtcpPacket::Nack(NackPacket::parse_body(body)?),
        (PT_RTPFB, FMT_TCC) => RtcpPacket::TransportCc(TccFeedback::parse_body(body)?),
        (PT_PSFB, FMT_PLI) => RtcpPacket::Pli(PliPacket::parse_body(body)?),
        (PT_PSFB, FMT_FIR) => RtcpPacket::Fir(FirPacket::parse_body(body)?),
        (PT_PSFB, FMT_AFB) if body.len() >= 12 && &body[8..12] == REMB_IDENTIFIER => {
            RtcpPacket::Remb(RembPacket::parse_body(body)?)
        }
        _ => RtcpPacket::Other { packet_type, fmt },
    })
}

/// Write a complete feedback packet: header, the two SSRCs and `fci`.
fn write_feedback(out: &mut BytesMut, fmt: u8, pt: u8, sender: u32, media: u32, fci: &[u8]) {
    let unpadded = RTCP_HEADER_LEN + 8 + fci.len();
    let pad = (4 - unpadded % 4) % 4;
    let total = unpadded + pad;
    let mut b0 = 0x80 | (fmt & 0x1F);
    if pad > 0 {
        b0 |= 0x20;
    }
    out.put_u8(b0);
    out.put_u8(pt);
    out.put_u16((total / 4 - 1) as u16);
    out.put_u32(sender);
    out.put_u32(media);
    out.extend_from_slice(fci);
    if pad > 0 {
        for _ in 1..pad {
            out.put_u8(0);
        }
        out.put_u8(pad as u8);
    }
}

fn read_ssrcs(body: &[u8]) -> Result<(u32, u32)> {
    ensure_len(body, 8)?;
    Ok((
        u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
    ))
}

// ─── NACK ───────────────────────────────────────────────────────────────────

/// Generic NACK listing lost sequence numbers of one media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPacket {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub lost: Vec<u16>,
}

impl NackPacket {
    pub fn new(sender_ssrc: u32, media_ssrc: u32, mut lost: Vec<u16>) -> Self {
        if let Some(&first) = lost.first() {
            lost.sort_by_key(|s| seq::delta(*s, first));
            lost.dedup();
        }
        NackPacket {
            sender_ssrc,
            media_ssrc,
            lost,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        let mut fci = BytesMut::with_capacity(self.lost.len() * 4);
        let mut items: Vec<(u16, u16)> = Vec::new();
        for &s in &self.lost {
            match items.last_mut() {
                Some((pid, blp)) if (1..=16).contains(&seq::delta(s, *pid)) => {
                    *blp |= 1 << (seq::delta(s, *pid) - 1);
                }
                _ => items.push((s, 0)),
            }
        }
        for (pid, blp) in items {
            fci.put_u16(pid);
            fci.put_u16(blp);
        }
        write_feedback(out, FMT_NACK, PT_RTPFB, self.sender_ssrc, self.media_ssrc, &fci);
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        let (sender_ssrc, media_ssrc) = read_ssrcs(body)?;
        let fci = &body[8..];
        if fci.len() % 4 != 0 {
            return Err(Error::Malformed("NACK FCI length"));
        }
        let mut lost = Vec::new();
        for item in fci.chunks_exact(4) {
            let pid = u16::from_be_bytes([item[0], item[1]]);
            let blp = u16::from_be_bytes([item[2], item[3]]);
            lost.push(pid);
            for bit in 0..16 {
                if blp & (1 << bit) != 0 {
                    lost.push(pid.wrapping_add(bit + 1));
                }
            }
        }
        Ok(NackPacket {
            sender_ssrc,
            media_ssrc,
            lost,
        })
    }
}

// ─── PLI ────────────────────────────────────────────────────────────────────

/// Picture Loss Indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PliPacket {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PliPacket {
    fn encode(&self, out: &mut BytesMut) {
        write_feedback(out, FMT_PLI, PT_PSFB, self.sender_ssrc, self.media_ssrc, &[]);
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        let (sender_ssrc, media_ssrc) = read_ssrcs(body)?;
        Ok(PliPacket {
            sender_ssrc,
            media_ssrc,
        })
    }
}

// ─── FIR ────────────────────────────────────────────────────────────────────

/// Full Intra Request carrying one command per target SSRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirPacket {
    pub sender_ssrc: u32,
    /// `(target ssrc, command sequence number)`.
    pub entries: Vec<(u32, u8)>,
}

impl FirPacket {
    fn encode(&self, out: &mut BytesMut) {
        let mut fci = BytesMut::with_capacity(self.entries.len() * 8);
        for &(ssrc, seq_nr) in &self.entries {
            fci.put_u32(ssrc);
            fci.put_u8(seq_nr);
            fci.put_slice(&[0, 0, 0]);
        }
        // Media source SSRC is unused for FIR and set to zero.
        write_feedback(out, FMT_FIR, PT_PSFB, self.sender_ssrc, 0, &fci);
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        let (sender_ssrc, _) = read_ssrcs(body)?;
        let fci = &body[8..];
        if fci.len() % 8 != 0 {
            return Err(Error::Malformed("FIR FCI length"));
        }
        let entries = fci
            .chunks_exact(8)
            .map(|e| (u32::from_be_bytes([e[0], e[1], e[2], e[3]]), e[4]))
            .collect();
        Ok(FirPacket {
            sender_ssrc,
            entries,
        })
    }
}

// ─── REMB ───────────────────────────────────────────────────────────────────

/// Receiver Estimated Maximum Bitrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RembPacket {
    pub sender_ssrc: u32,
    pub bitrate_bps: u64,
    pub ssrcs: Vec<u32>,
}

impl RembPacket {
    fn encode(&self, out: &mut BytesMut) {
        let mut exp = 0u32;
        while (self.bitrate_bps >> exp) > 0x3FFFF {
            exp += 1;
        }
        let mantissa = (self.bitrate_bps >> exp) as u32;
        let mut fci = BytesMut::with_capacity(8 + self.ssrcs.len() * 4);
        fci.put_slice(REMB_IDENTIFIER);
        fci.put_u8(self.ssrcs.len() as u8);
        fci.put_u8(((exp as u8) << 2) | ((mantissa >> 16) as u8 & 0x03));
        fci.put_u16(mantissa as u16);
        for ssrc in &self.ssrcs {
            fci.put_u32(*ssrc);
        }
        write_feedback(out, FMT_AFB, PT_PSFB, self.sender_ssrc, 0, &fci);
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        let (sender_ssrc, _) = read_ssrcs(body)?;
        ensure_len(body, 16)?;
        let num = body[12] as usize;
        let exp = body[13] >> 2;
        let mantissa =
            ((body[13] as u64 & 0x03) << 16) | ((body[14] as u64) << 8) | body[15] as u64;
        ensure_len(body, 16 + num * 4)?;
        let ssrcs = body[16..16 + num * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(RembPacket {
            sender_ssrc,
            bitrate_bps: mantissa << exp,
            ssrcs,
        })
    }
}

// ─── Transport-wide Feedback ────────────────────────────────────────────────

/// Receive delta resolution.
pub const TCC_TICK_US: i64 = 250;
/// Reference time resolution.
pub const TCC_REFERENCE_US: i64 = 64_000;
const TICKS_PER_REFERENCE: i64 = TCC_REFERENCE_US / TCC_TICK_US;
const MAX_STATUS_COUNT: usize = 0xFFFF;
const MAX_RUN_LENGTH: usize = 0x1FFF;

const SYMBOL_NOT_RECEIVED: u8 = 0;
const SYMBOL_SMALL_DELTA: u8 = 1;
const SYMBOL_LARGE_DELTA: u8 = 2;

/// Per-packet entry of a transport-wide feedback report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TccPacketStatus {
    pub seq: u16,
    /// Arrival time on the remote clock, in microseconds. `None` if lost.
    pub arrival_us: Option<i64>,
}

/// Transport-wide congestion control feedback report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TccFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub base_seq: u16,
    /// 24-bit signed reference time in 64 ms units.
    pub reference_time: i32,
    pub feedback_count: u8,
    pub packets: Vec<TccPacketStatus>,
}

impl TccFeedback {
    pub fn reference_time_us(&self) -> i64 {
        self.reference_time as i64 * TCC_REFERENCE_US
    }

    pub fn received(&self) -> impl Iterator<Item = (u16, i64)> + '_ {
        self.packets
            .iter()
            .filter_map(|p| p.arrival_us.map(|at| (p.seq, at)))
    }

    pub fn missing(&self) -> impl Iterator<Item = u16> + '_ {
        self.packets
            .iter()
            .filter(|p| p.arrival_us.is_none())
            .map(|p| p.seq)
    }

    fn encode(&self, out: &mut BytesMut) {
        // Delta ticks relative to the previous received packet.
        let mut last_ticks = self.reference_time as i64 * TICKS_PER_REFERENCE;
        let mut symbols = Vec::with_capacity(self.packets.len());
        let mut deltas = BytesMut::with_capacity(self.packets.len() * 2);
        for p in &self.packets {
            match p.arrival_us {
                None => symbols.push(SYMBOL_NOT_RECEIVED),
                Some(at) => {
                    let ticks = at.div_euclid(TCC_TICK_US);
                    let d = ticks - last_ticks;
                    last_ticks = ticks;
                    if (0..=255).contains(&d) {
                        symbols.push(SYMBOL_SMALL_DELTA);
                        deltas.put_u8(d as u8);
                    } else {
                        symbols.push(SYMBOL_LARGE_DELTA);
                        deltas.put_i16(d.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
                    }
                }
            }
        }

        let mut fci = BytesMut::with_capacity(8 + symbols.len() + deltas.len());
        fci.put_u16(self.base_seq);
        fci.put_u16(symbols.len() as u16);
        let reference = (self.reference_time as u32) & 0x00FF_FFFF;
        fci.put_u32((reference << 8) | self.feedback_count as u32);

        let mut i = 0;
        while i < symbols.len() {
            let run = symbols[i..].iter().take_while(|s| **s == symbols[i]).count();
            if run >= 7 {
                let run = run.min(MAX_RUN_LENGTH);
                fci.put_u16(((symbols[i] as u16) << 13) | run as u16);
                i += run;
            } else {
                let mut chunk: u16 = 0xC000;
                for slot in 0..7 {
                    let symbol = symbols.get(i + slot).copied().unwrap_or(0) as u16;
                    chunk |= symbol << (12 - slot * 2);
                }
                fci.put_u16(chunk);
                i += 7;
            }
        }
        fci.extend_from_slice(&deltas);
        write_feedback(out, FMT_TCC, PT_RTPFB, self.sender_ssrc, self.media_ssrc, &fci);
    }

    fn parse_body(body: &[u8]) -> Result<Self> {
        let (sender_ssrc, media_ssrc) = read_ssrcs(body)?;
        let fci = &body[8..];
        ensure_len(fci, 8)?;
        let base_seq = u16::from_be_bytes([fci[0], fci[1]]);
        let count = u16::from_be_bytes([fci[2], fci[3]]) as usize;
        let raw_reference = u32::from_be_bytes([0, fci[4], fci[5], fci[6]]);
        // Sign-extend the 24-bit reference time.
        let reference_time = ((raw_reference << 8) as i32) >> 8;
        let feedback_count = fci[7];

        let mut pos = 8;
        let mut symbols: Vec<u8> = Vec::with_capacity(count);
        while symbols.len() < count {
            ensure_len(fci, pos + 2)?;
            let chunk = u16::from_be_bytes([fci[pos], fci[pos + 1]]);
            pos += 2;
            let remaining = count - symbols.len();
            if chunk & 0x8000 == 0 {
                let symbol = ((chunk >> 13) & 0x03) as u8;
                let run = (chunk & 0x1FFF) as usize;
                symbols.extend(std::iter::repeat(symbol).take(run.min(remaining)));
            } else if chunk & 0x4000 == 0 {
                for slot in 0..14.min(remaining) {
                    symbols.push(((chunk >> (13 - slot)) & 0x01) as u8);
                }
            } else {
                for slot in 0..7.min(remaining) {
                    symbols.push(((chunk >> (12 - slot * 2)) & 0x03) as u8);
                }
            }
        }

        let mut ticks = reference_time as i64 * TICKS_PER_REFERENCE;
        let mut packets = Vec::with_capacity(count);
        for (i, symbol) in symbols.into_iter().enumerate() {
            let seq = base_seq.wrapping_add(i as u16);
            let arrival_us = match symbol {
                SYMBOL_NOT_RECEIVED => None,
                SYMBOL_SMALL_DELTA => {
                    ensure_len(fci, pos + 1)?;
                    ticks += fci[pos] as i64;
                    pos += 1;
                    Some(ticks * TCC_TICK_US)
                }
                SYMBOL_LARGE_DELTA => {
                    ensure_len(fci, pos + 2)?;
                    ticks += i16::from_be_bytes([fci[pos], fci[pos + 1]]) as i64;
                    pos += 2;
                    Some(ticks * TCC_TICK_US)
                }
                _ => return Err(Error::Malformed("transport-cc status symbol")),
            };
            packets.push(TccPacketStatus { seq, arrival_us });
        }

        Ok(TccFeedback {
            sender_ssrc,
            media_ssrc,
            base_seq,
            reference_time,
            feedback_count,
            packets,
        })
    }
}

/// Incrementally builds a [`TccFeedback`], filling gaps with lost entries.
#[derive(Debug)]
pub struct TccFeedbackBuilder {
    feedback: TccFeedback,
    last_ticks: i64,
    next_seq: Option<u16>,
}

impl TccFeedbackBuilder {
    /// `first_arrival_us` anchors the reference time (floored to 64 ms).
    pub fn new(
        sender_ssrc: u32,
        media_ssrc: u32,
        feedback_count: u8,
        first_arrival_us: i64,
    ) -> Self {
        let reference_time = first_arrival_us.div_euclid(TCC_REFERENCE_US);
        // Keep within the 24-bit signed field.
        let reference_time = ((reference_time as i32) << 8) >> 8;
        TccFeedbackBuilder {
            feedback: TccFeedback {
                sender_ssrc,
                media_ssrc,
                base_seq: 0,
                reference_time,
                feedback_count,
                packets: Vec::new(),
            },
            last_ticks: reference_time as i64 * TICKS_PER_REFERENCE,
            next_seq: None,
        }
    }

    /// Add a received packet. Sequence numbers must be added in increasing
    /// modular order. Returns false when the packet cannot be represented
    /// (delta out of range or report full); the report is left unchanged.
    pub fn add_received(&mut self, seq: u16, arrival_us: i64) -> bool {
        let gap = match self.next_seq {
            None => 0,
            Some(next) => {
                let d = seq::delta(seq, next);
                if d < 0 {
                    return false;
                }
                d as usize
            }
        };
        if self.feedback.packets.len() + gap + 1 > MAX_STATUS_COUNT {
            return false;
        }
        let ticks = arrival_us.div_euclid(TCC_TICK_US);
        let d = ticks - self.last_ticks;
        if d < i16::MIN as i64 || d > i16::MAX as i64 {
            return false;
        }
        match self.next_seq {
            None => self.feedback.base_seq = seq,
            Some(next) => {
                for missing in seq::range(next, seq) {
                    self.feedback.packets.push(TccPacketStatus {
                        seq: missing,
                        arrival_us: None,
                    });
                }
            }
        }
        self.feedback.packets.push(TccPacketStatus {
            seq,
            arrival_us: Some(ticks * TCC_TICK_US),
        });
        self.last_ticks = ticks;
        self.next_seq = Some(seq.wrapping_add(1));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.feedback.packets.is_empty()
    }

    /// Number of entries (received and lost) so far.
    pub fn len(&self) -> usize {
        self.feedback.packets.len()
    }

    pub fn build(self) -> TccFeedback {
        self.feedback
    }
}
