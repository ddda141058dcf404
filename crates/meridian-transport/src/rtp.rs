//! # RTP Header Handling
//!
//! Zero-copy parsing of RTP headers ([`RtpView`]) plus in-place rewriting of
//! the fixed fields and header extensions. Packets are never re-serialized
//! when only a fixed field changes; adding an extension rebuilds the buffer.
//!
//! Fixed header layout (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{ensure_len, Error, Result};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// Profile marker for one-byte header extensions (RFC 8285).
pub const ONE_BYTE_PROFILE: u16 = 0xBEDE;
/// Profile marker for two-byte header extensions; low 4 bits are app bits.
pub const TWO_BYTE_PROFILE: u16 = 0x1000;
const TWO_BYTE_PROFILE_MASK: u16 = 0xFFF0;

/// Maximum element length in the one-byte extension format.
pub const ONE_BYTE_MAX_LEN: usize = 16;

// ─── Demux Predicates ───────────────────────────────────────────────────────

/// RFC 5761: with RTP and RTCP multiplexed on one transport, RTCP packet
/// types occupy 192..=223 in the second byte.
pub fn looks_like_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 8 && buf[0] >> 6 == RTP_VERSION && (192..=223).contains(&buf[1])
}

pub fn looks_like_rtp(buf: &[u8]) -> bool {
    buf.len() >= RTP_HEADER_LEN && buf[0] >> 6 == RTP_VERSION && !looks_like_rtcp(buf)
}

// ─── Header ─────────────────────────────────────────────────────────────────

/// Location of the header extension block inside a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionBlock {
    pub profile: u16,
    /// Offset of the first extension element byte.
    pub offset: usize,
    /// Length of the element area in bytes.
    pub len: usize,
}

impl ExtensionBlock {
    pub fn is_one_byte(&self) -> bool {
        self.profile == ONE_BYTE_PROFILE
    }

    pub fn is_two_byte(&self) -> bool {
        self.profile & TWO_BYTE_PROFILE_MASK == TWO_BYTE_PROFILE
    }
}

/// Parsed RTP fixed header plus computed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub extensions: Option<ExtensionBlock>,
    /// Offset of the first payload byte.
    pub header_len: usize,
    /// Number of trailing padding bytes (including the count byte).
    pub padding_size: usize,
}

impl RtpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, RTP_HEADER_LEN)?;
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::BadVersion(version));
        }
        let padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = buf[0] & 0x0F;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut header_len = RTP_HEADER_LEN + csrc_count as usize * 4;
        ensure_len(buf, header_len)?;

        let extensions = if has_extension {
            ensure_len(buf, header_len + 4)?;
            let profile = u16::from_be_bytes([buf[header_len], buf[header_len + 1]]);
            let words = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
            let offset = header_len + 4;
            let len = words * 4;
            ensure_len(buf, offset + len)?;
            header_len = offset + len;
            Some(ExtensionBlock {
                profile,
                offset,
                len,
            })
        } else {
            None
        };

        let padding_size = if padding {
            let count = buf[buf.len() - 1] as usize;
            if count == 0 || header_len + count > buf.len() {
                return Err(Error::Malformed("RTP padding length"));
            }
            count
        } else {
            0
        };

        Ok(RtpHeader {
            padding,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            extensions,
            header_len,
            padding_size,
        })
    }
}

// ─── View ───────────────────────────────────────────────────────────────────

/// Parsed, read-only view over an RTP packet buffer.
#[derive(Debug, Clone, Copy)]
pub struct RtpView<'a> {
    buf: &'a [u8],
    header: RtpHeader,
}

impl<'a> RtpView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let header = RtpHeader::parse(buf)?;
        Ok(RtpView { buf, header })
    }

    pub fn header(&self) -> &RtpHeader {
        &self.header
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn marker(&self) -> bool {
        self.header.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.header.payload_type
    }

    pub fn padding_size(&self) -> usize {
        self.header.padding_size
    }

    /// Payload bytes, excluding trailing padding.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header.header_len..self.buf.len() - self.header.padding_size]
    }

    /// Bytes after the header, including padding.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.header.header_len
    }

    /// True when everything after the header is padding.
    pub fn is_padding_only(&self) -> bool {
        self.header.padding && self.payload_len() == self.header.padding_size
    }

    /// Header bytes: fixed header, CSRCs and extension block.
    pub fn header_bytes(&self) -> &'a [u8] {
        &self.buf[..self.header.header_len]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Value of the extension element with `id`, if present.
    pub fn extension(&self, id: u8) -> Option<&'a [u8]> {
        let (offset, len) = find_extension(self.buf, &self.header, id)?;
        Some(&self.buf[offset..offset + len])
    }

    /// All extension elements as `(id, value)` pairs.
    pub fn extensions(&self) -> Vec<(u8, &'a [u8])> {
        match self.header.extensions {
            Some(block) => elements(self.buf, &block)
                .into_iter()
                .map(|(id, offset, len)| (id, &self.buf[offset..offset + len]))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Walk extension elements, returning `(id, value offset, value len)`.
fn elements(buf: &[u8], block: &ExtensionBlock) -> Vec<(u8, usize, usize)> {
    let mut out = Vec::new();
    let end = block.offset + block.len;
    let mut pos = block.offset;
    if block.is_one_byte() {
        while pos < end {
            let byte = buf[pos];
            let id = byte >> 4;
            if id == 0 {
                pos += 1;
                continue;
            }
            if id == 15 {
                break;
            }
            let len = (byte & 0x0F) as usize + 1;
            if pos + 1 + len > end {
                break;
            }
            out.push((id, pos + 1, len));
            pos += 1 + len;
        }
    } else if block.is_two_byte() {
        while pos < end {
            let id = buf[pos];
            if id == 0 {
                pos += 1;
                continue;
            }
            if pos + 2 > end {
                break;
            }
            let len = buf[pos + 1] as usize;
            if pos + 2 + len > end {
                break;
            }
            out.push((id, pos + 2, len));
            pos += 2 + len;
        }
    }
    out
}

fn find_extension(buf: &[u8], header: &RtpHeader, id: u8) -> Option<(usize, usize)> {
    let block = header.extensions?;
    elements(buf, &block)
        .into_iter()
        .find(|(ext_id, _, _)| *ext_id == id)
        .map(|(_, offset, len)| (offset, len))
}

// ─── In-place Rewriting ─────────────────────────────────────────────────────

pub fn set_marker(buf: &mut [u8], marker: bool) {
    if marker {
        buf[1] |= 0x80;
    } else {
        buf[1] &= 0x7F;
    }
}

pub fn set_payload_type(buf: &mut [u8], pt: u8) {
    buf[1] = (buf[1] & 0x80) | (pt & 0x7F);
}

pub fn set_sequence_number(buf: &mut [u8], seq: u16) {
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
}

pub fn set_timestamp(buf: &mut [u8], ts: u32) {
    buf[4..8].copy_from_slice(&ts.to_be_bytes());
}

pub fn set_ssrc(buf: &mut [u8], ssrc: u32) {
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

/// Overwrite the value of an existing extension element of the same length.
///
/// Returns `Ok(false)` if the element is absent or has a different length.
pub fn set_extension(buf: &mut [u8], id: u8, value: &[u8]) -> Result<bool> {
    let header = RtpHeader::parse(buf)?;
    match find_extension(buf, &header, id) {
        Some((offset, len)) if len == value.len() => {
            buf[offset..offset + len].copy_from_slice(value);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Set a one-byte header extension, adding the element (and the extension
/// block) if needed. Rebuilds the buffer when the header grows.
pub fn add_extension(buf: &mut BytesMut, id: u8, value: &[u8]) -> Result<()> {
    if !(1..=14).contains(&id) || value.is_empty() || value.len() > ONE_BYTE_MAX_LEN {
        return Err(Error::Malformed("one-byte extension element"));
    }
    if set_extension(buf, id, value)? {
        return Ok(());
    }
    let header = RtpHeader::parse(buf)?;
    let mut elems: Vec<(u8, Vec<u8>)> = match header.extensions {
        Some(block) if block.is_one_byte() => elements(buf, &block)
            .into_iter()
            .filter(|(ext_id, _, _)| *ext_id != id)
            .map(|(ext_id, offset, len)| (ext_id, buf[offset..offset + len].to_vec()))
            .collect(),
        Some(_) => return Err(Error::Malformed("two-byte extension profile in use")),
        None => Vec::new(),
    };
    elems.push((id, value.to_vec()));

    let mut block = BytesMut::new();
    for (ext_id, data) in &elems {
        block.put_u8((ext_id << 4) | (data.len() as u8 - 1));
        block.extend_from_slice(data);
    }
    while block.len() % 4 != 0 {
        block.put_u8(0);
    }

    let fixed_len = RTP_HEADER_LEN + header.csrc_count as usize * 4;
    let mut out = BytesMut::with_capacity(buf.len() + block.len() + 4);
    out.extend_from_slice(&buf[..fixed_len]);
    out[0] |= 0x10;
    out.put_u16(ONE_BYTE_PROFILE);
    out.put_u16((block.len() / 4) as u16);
    out.extend_from_slice(&block);
    out.extend_from_slice(&buf[header.header_len..]);
    *buf = out;
    Ok(())
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Builds RTP packets from parts. Used for synthetic padding and in tests.
#[derive(Debug, Clone)]
pub struct RtpPacketBuilder {
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    marker: bool,
    csrcs: Vec<u32>,
    extensions: Vec<(u8, Vec<u8>)>,
    payload: Vec<u8>,
    padding: u8,
}

impl RtpPacketBuilder {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpPacketBuilder {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            marker: false,
            csrcs: Vec::new(),
            extensions: Vec::new(),
            payload: Vec::new(),
            padding: 0,
        }
    }

    pub fn marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn csrc(mut self, csrc: u32) -> Self {
        self.csrcs.push(csrc);
        self
    }

    /// Add a one-byte extension element (id 1..=14, 1..=16 bytes).
    pub fn extension(mut self, id: u8, value: &[u8]) -> Self {
        self.extensions.push((id, value.to_vec()));
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Trailing padding bytes, including the count byte. Zero disables.
    pub fn padding(mut self, padding: u8) -> Self {
        self.padding = padding;
        self
    }

    pub fn build(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            RTP_HEADER_LEN + self.csrcs.len() * 4 + 64 + self.payload.len() + self.padding as usize,
        );
        let mut b0 = RTP_VERSION << 6 | (self.csrcs.len() as u8 & 0x0F);
        if self.padding > 0 {
            b0 |= 0x20;
        }
        buf.put_u8(b0);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
        buf.extend_from_slice(&self.payload);
        if self.padding > 0 {
            for _ in 1..self.padding {
                buf.put_u8(0);
            }
            buf.put_u8(self.padding);
        }
        for (id, value) in &self.extensions {
            // Builder input is trusted; invalid elements are skipped.
            let _ = add_extension(&mut buf, *id, value);
        }
        buf
    }
}
