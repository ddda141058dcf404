//! Gap-hiding sequence number rewriter.
//!
//! When a forwarder drops packets of a stream (layer switch, padding
//! termination), the receiver would otherwise see gaps and NACK them. The
//! rewriter grows a delta on each rejected packet so the accepted packets
//! stay contiguous on the outgoing side.
//!
//! Not internally synchronized; one owner per stream.

use crate::rtp;
use crate::seq;

#[derive(Debug, Clone, Default)]
pub struct ResumableStreamRewriter {
    seqnum_delta: u16,
    highest_sequence_number_sent: Option<u16>,
}

impl ResumableStreamRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite an accepted packet's sequence number.
    pub fn accept(&mut self, seq: u16) -> u16 {
        let rewritten = seq.wrapping_sub(self.seqnum_delta);
        match self.highest_sequence_number_sent {
            Some(highest) if !seq::is_newer_than(rewritten, highest) => {}
            _ => self.highest_sequence_number_sent = Some(rewritten),
        }
        rewritten
    }

    /// Account for a dropped packet. Returns `seq` unchanged.
    pub fn reject(&mut self, seq: u16) -> u16 {
        if let Some(highest) = self.highest_sequence_number_sent {
            let candidate = seq.wrapping_sub(highest);
            if seq::is_newer_than(candidate, self.seqnum_delta) {
                self.seqnum_delta = candidate;
            }
        }
        seq
    }

    /// Apply [`accept`](Self::accept) or [`reject`](Self::reject) to an RTP
    /// buffer, rewriting the sequence number in place when accepted.
    pub fn rewrite_rtp(&mut self, accept: bool, buf: &mut [u8]) -> Option<u16> {
        let seq = rtp::RtpHeader::parse(buf).ok()?.sequence_number;
        if accept {
            let rewritten = self.accept(seq);
            rtp::set_sequence_number(buf, rewritten);
            Some(rewritten)
        } else {
            self.reject(seq);
            None
        }
    }

    pub fn seqnum_delta(&self) -> u16 {
        self.seqnum_delta
    }

    pub fn highest_sequence_number_sent(&self) -> Option<u16> {
        self.highest_sequence_number_sent
    }
}
