//! Control events.
//!
//! Events carry no packet payload. They describe negotiated stream state and
//! runtime toggles, and are delivered to every interested component in a
//! fixed order (graph order inside a pipeline, subscription order on the
//! event bus).

use crate::bwe::Bandwidth;
use crate::streams::{MediaType, PayloadType, RtpExtensionKind, SsrcAssociationKind};

/// Runtime-switchable features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Rtx,
    Nack,
    TransportCc,
    Remb,
    PaddingTermination,
    PacketTimeline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PayloadTypeAdded(PayloadType),
    PayloadTypesCleared,
    ExtensionAdded {
        id: u8,
        kind: RtpExtensionKind,
    },
    ExtensionsCleared,
    SsrcAssociation {
        primary: u32,
        secondary: u32,
        kind: SsrcAssociationKind,
    },
    FeatureToggled {
        feature: Feature,
        enabled: bool,
    },
    /// A local SSRC used for sending media of `media` type.
    LocalSsrc {
        media: MediaType,
        ssrc: u32,
    },
    BandwidthEstimate(Bandwidth),
}
