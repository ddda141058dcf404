//! # Stream Tables
//!
//! Negotiated stream state that stages need to interpret packets: payload
//! types, header extension ids and SSRC associations. Each component keeps
//! its own [`StreamTables`] and updates it from the [`TransportEvent`]s it
//! receives, so there is no shared registry to lock.

use std::collections::HashMap;

use crate::events::TransportEvent;

// ─── Payload Types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    Opus,
    Vp8,
    Vp9,
    H264,
    Av1,
    /// RFC 4588 retransmission; `apt` is the associated media payload type.
    Rtx { apt: u8 },
    Other { name: String, media: MediaType },
}

impl Encoding {
    pub fn media_type(&self) -> MediaType {
        match self {
            Encoding::Opus => MediaType::Audio,
            Encoding::Vp8 | Encoding::Vp9 | Encoding::H264 | Encoding::Av1 => MediaType::Video,
            Encoding::Rtx { .. } => MediaType::Video,
            Encoding::Other { media, .. } => *media,
        }
    }
}

/// RTCP feedback mechanisms negotiated for a payload type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub nack: bool,
    pub pli: bool,
    pub fir: bool,
    pub transport_cc: bool,
    pub remb: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    pub pt: u8,
    pub encoding: Encoding,
    pub clock_rate: u32,
    pub feedback: RtcpFeedback,
}

impl PayloadType {
    pub fn is_rtx(&self) -> bool {
        matches!(self.encoding, Encoding::Rtx { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadTypeTable {
    types: HashMap<u8, PayloadType>,
}

impl PayloadTypeTable {
    pub fn insert(&mut self, pt: PayloadType) {
        self.types.insert(pt.pt, pt);
    }

    pub fn clear(&mut self) {
        self.types.clear();
    }

    pub fn get(&self, pt: u8) -> Option<&PayloadType> {
        self.types.get(&pt)
    }

    /// Associated media payload type if `pt` is an RTX payload type.
    pub fn rtx_apt(&self, pt: u8) -> Option<u8> {
        match self.types.get(&pt)?.encoding {
            Encoding::Rtx { apt } => Some(apt),
            _ => None,
        }
    }

    /// RTX payload type carrying retransmissions of `media_pt`.
    pub fn rtx_pt_for(&self, media_pt: u8) -> Option<u8> {
        self.types.values().find_map(|t| match t.encoding {
            Encoding::Rtx { apt } if apt == media_pt => Some(t.pt),
            _ => None,
        })
    }

    /// Lowest-numbered non-RTX video payload type.
    pub fn video_pt(&self) -> Option<u8> {
        self.types
            .values()
            .filter(|t| !t.is_rtx() && t.encoding.media_type() == MediaType::Video)
            .map(|t| t.pt)
            .min()
    }

    /// Union of RTCP feedback capabilities over all video payload types.
    pub fn video_feedback(&self) -> RtcpFeedback {
        self.types
            .values()
            .filter(|t| !t.is_rtx() && t.encoding.media_type() == MediaType::Video)
            .fold(RtcpFeedback::default(), |acc, t| RtcpFeedback {
                nack: acc.nack || t.feedback.nack,
                pli: acc.pli || t.feedback.pli,
                fir: acc.fir || t.feedback.fir,
                transport_cc: acc.transport_cc || t.feedback.transport_cc,
                remb: acc.remb || t.feedback.remb,
            })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ─── Header Extensions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RtpExtensionKind {
    TransportCc,
    AbsSendTime,
    AudioLevel,
    VideoOrientation,
    Mid,
    Other(String),
}

impl RtpExtensionKind {
    /// Map a negotiated extension URI to a kind.
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01" => {
                RtpExtensionKind::TransportCc
            }
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time" => {
                RtpExtensionKind::AbsSendTime
            }
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level" => RtpExtensionKind::AudioLevel,
            "urn:3gpp:video-orientation" => RtpExtensionKind::VideoOrientation,
            "urn:ietf:params:rtp-hdrext:sdes:mid" => RtpExtensionKind::Mid,
            other => RtpExtensionKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionTable {
    by_id: HashMap<u8, RtpExtensionKind>,
}

impl ExtensionTable {
    pub fn insert(&mut self, id: u8, kind: RtpExtensionKind) {
        self.by_id.retain(|_, k| *k != kind);
        self.by_id.insert(id, kind);
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
    }

    pub fn id_of(&self, kind: &RtpExtensionKind) -> Option<u8> {
        self.by_id
            .iter()
            .find_map(|(id, k)| (k == kind).then_some(*id))
    }

    pub fn kind_of(&self, id: u8) -> Option<&RtpExtensionKind> {
        self.by_id.get(&id)
    }
}

// ─── SSRC Associations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsrcAssociationKind {
    Rtx,
    Fec,
}

/// `primary ↔ secondary` SSRC pairs, indexed both ways.
#[derive(Debug, Clone, Default)]
pub struct SsrcAssociationTable {
    secondary_by_primary: HashMap<(u32, SsrcAssociationKind), u32>,
    primary_by_secondary: HashMap<u32, (u32, SsrcAssociationKind)>,
}

impl SsrcAssociationTable {
    pub fn associate(&mut self, primary: u32, secondary: u32, kind: SsrcAssociationKind) {
        if let Some(old) = self.secondary_by_primary.insert((primary, kind), secondary) {
            self.primary_by_secondary.remove(&old);
        }
        self.primary_by_secondary.insert(secondary, (primary, kind));
    }

    pub fn rtx_for(&self, primary: u32) -> Option<u32> {
        self.secondary_by_primary
            .get(&(primary, SsrcAssociationKind::Rtx))
            .copied()
    }

    /// Media SSRC an RTX SSRC retransmits for.
    pub fn primary_for_rtx(&self, secondary: u32) -> Option<u32> {
        match self.primary_by_secondary.get(&secondary) {
            Some(&(primary, SsrcAssociationKind::Rtx)) => Some(primary),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.secondary_by_primary.clear();
        self.primary_by_secondary.clear();
    }
}

// ─── Bundle ─────────────────────────────────────────────────────────────────

/// The three tables, updated together from events.
#[derive(Debug, Clone, Default)]
pub struct StreamTables {
    pub payload_types: PayloadTypeTable,
    pub extensions: ExtensionTable,
    pub associations: SsrcAssociationTable,
}

impl StreamTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a control event. Returns true if the tables changed.
    pub fn apply(&mut self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::PayloadTypeAdded(pt) => self.payload_types.insert(pt.clone()),
            TransportEvent::PayloadTypesCleared => self.payload_types.clear(),
            TransportEvent::ExtensionAdded { id, kind } => {
                self.extensions.insert(*id, kind.clone())
            }
            TransportEvent::ExtensionsCleared => self.extensions.clear(),
            TransportEvent::SsrcAssociation {
                primary,
                secondary,
                kind,
            } => self.associations.associate(*primary, *secondary, *kind),
            _ => return false,
        }
        true
    }
}
