//! Graph stages wrapping the transport logic.
//!
//! Components that are also driven from the scheduler (NACK requester,
//! transport-cc generator, REMB estimator) are shared as `Arc<Mutex<_>>`;
//! every stage locks at most one of them at a time and releases it before
//! emitting anything.

pub mod cache;
pub mod crypto;
pub mod nack;
pub mod padding;
pub mod remb;
pub mod rtcp;
pub mod rtx;
pub mod tcc;

use std::sync::Arc;

use meridian_transport::events::TransportEvent;
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtcp::RtcpPacket;
use meridian_transport::rtp::{looks_like_rtcp, looks_like_rtp};

/// Where locally generated RTCP (NACK, feedback, REMB) goes.
pub type RtcpOutput = Arc<dyn Fn(RtcpPacket) + Send + Sync>;

/// Re-injection point into the send pipeline.
pub type PacketOutput = Arc<dyn Fn(PacketInfo) + Send + Sync>;

/// Where stages publish control events (bandwidth updates).
pub type EventOutput = Arc<dyn Fn(TransportEvent) + Send + Sync>;

pub fn is_rtp(packet: &PacketInfo) -> bool {
    looks_like_rtp(&packet.buffer)
}

pub fn is_rtcp(packet: &PacketInfo) -> bool {
    looks_like_rtcp(&packet.buffer)
}
