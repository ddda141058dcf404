//! Rate-limited keyframe requests.
//!
//! At most one PLI/FIR per media SSRC per `wait_interval`. Requests inside
//! the window are dropped and counted, never queued or merged. PLI is used
//! when the remote video payload types negotiated it, FIR otherwise; with
//! neither, nothing is sent.

use std::collections::HashMap;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace};

use crate::events::TransportEvent;
use crate::rtcp::{FirPacket, PliPacket, RtcpPacket};
use crate::streams::{MediaType, PayloadTypeTable};

#[derive(Debug, Clone)]
pub struct KeyframeConfig {
    pub wait_interval: Duration,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        KeyframeConfig {
            wait_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeRequestKind {
    Pli,
    Fir,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyframeStats {
    pub pli_sent: u64,
    pub fir_sent: u64,
    /// Requests inside the wait interval.
    pub dropped: u64,
    /// Requests with no negotiated PLI/FIR support.
    pub unsupported: u64,
}

pub struct KeyframeRequester {
    config: KeyframeConfig,
    sender_ssrc: u32,
    payload_types: PayloadTypeTable,
    last_request: HashMap<u32, Instant>,
    fir_sequence: u8,
    stats: KeyframeStats,
}

impl KeyframeRequester {
    pub fn new(config: KeyframeConfig, sender_ssrc: u32) -> Self {
        KeyframeRequester {
            config,
            sender_ssrc,
            payload_types: PayloadTypeTable::default(),
            last_request: HashMap::new(),
            fir_sequence: 0,
            stats: KeyframeStats::default(),
        }
    }

    pub fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::PayloadTypeAdded(pt) => self.payload_types.insert(pt.clone()),
            TransportEvent::PayloadTypesCleared => self.payload_types.clear(),
            TransportEvent::LocalSsrc {
                media: MediaType::Video,
                ssrc,
            } => self.sender_ssrc = *ssrc,
            _ => {}
        }
    }

    /// Which message a request would use right now, if any.
    pub fn request_kind(&self) -> Option<KeyframeRequestKind> {
        let feedback = self.payload_types.video_feedback();
        if feedback.pli {
            Some(KeyframeRequestKind::Pli)
        } else if feedback.fir {
            Some(KeyframeRequestKind::Fir)
        } else {
            None
        }
    }

    /// Request a keyframe for `media_ssrc`. Returns the RTCP message to send,
    /// or `None` if the request was rate limited or unsupported.
    pub fn request_keyframe(&mut self, media_ssrc: u32, now: Instant) -> Option<RtcpPacket> {
        if let Some(last) = self.last_request.get(&media_ssrc) {
            if now.saturating_duration_since(*last) < self.config.wait_interval {
                self.stats.dropped += 1;
                trace!(media_ssrc, "keyframe request rate limited");
                return None;
            }
        }
        let Some(kind) = self.request_kind() else {
            self.stats.unsupported += 1;
            debug!(media_ssrc, "no PLI/FIR negotiated, keyframe request ignored");
            return None;
        };
        self.last_request.insert(media_ssrc, now);

        Some(match kind {
            KeyframeRequestKind::Pli => {
                self.stats.pli_sent += 1;
                RtcpPacket::Pli(PliPacket {
                    sender_ssrc: self.sender_ssrc,
                    media_ssrc,
                })
            }
            KeyframeRequestKind::Fir => {
                self.stats.fir_sent += 1;
                self.fir_sequence = self.fir_sequence.wrapping_add(1);
                RtcpPacket::Fir(FirPacket {
                    sender_ssrc: self.sender_ssrc,
                    entries: vec![(media_ssrc, self.fir_sequence)],
                })
            }
        })
    }

    pub fn stats(&self) -> KeyframeStats {
        self.stats.clone()
    }
}
